use nsm_protocol::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NsmError>;

#[derive(Error, Debug)]
pub enum NsmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("policy rejected session: {0}")]
    PolicyRejected(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),
}

impl NsmError {
    /// Convert to protocol error code and message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        let code = match self {
            NsmError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            NsmError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            NsmError::Busy(_) => ErrorCode::Busy,
            NsmError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            NsmError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            NsmError::PolicyRejected(_) => ErrorCode::PolicyRejected,
            NsmError::SessionNotFound(_) | NsmError::ServiceNotFound(_) => ErrorCode::NotFound,
        };
        (code, self.to_string())
    }
}
