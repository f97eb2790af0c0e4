pub mod paths;

use serde::{Deserialize, Serialize};

/// Unique path identifying a session, derived from the owner identity and
/// the caller-chosen notify tag.
pub type SessionPath = String;

/// Protocol version spoken over the local socket.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single JSON line on the wire.
pub const MAX_JSON_LINE_BYTES: usize = 256 * 1024;

/// Transport category of a network service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Bearer {
    Ethernet,
    Wifi,
    Cellular,
    Bluetooth,
    Vpn,
    Gadget,
}

impl Bearer {
    /// Every bearer type known to the daemon, in display order.
    pub const ALL: [Bearer; 6] = [
        Bearer::Ethernet,
        Bearer::Wifi,
        Bearer::Cellular,
        Bearer::Bluetooth,
        Bearer::Vpn,
        Bearer::Gadget,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Bearer::Ethernet => "ethernet",
            Bearer::Wifi => "wifi",
            Bearer::Cellular => "cellular",
            Bearer::Bluetooth => "bluetooth",
            Bearer::Vpn => "vpn",
            Bearer::Gadget => "gadget",
        }
    }

    pub fn from_name(name: &str) -> Option<Bearer> {
        Bearer::ALL.into_iter().find(|b| b.name() == name)
    }
}

/// What kind of reachability a session asks for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Any,
    Local,
    Internet,
}

impl ConnectionType {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionType::Any => "any",
            ConnectionType::Local => "local",
            ConnectionType::Internet => "internet",
        }
    }

    /// Parse a wire string. "unknown" is not a valid request and maps to None.
    pub fn from_name(name: &str) -> Option<ConnectionType> {
        match name {
            "any" => Some(ConnectionType::Any),
            "local" => Some(ConnectionType::Local),
            "internet" => Some(ConnectionType::Internet),
            _ => None,
        }
    }
}

/// Session state as reported to the owner. Derived from the bound service,
/// never set directly by requests.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected,
    Online,
}

/// State of a network service as reported by the service subsystem.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    Association,
    Configuration,
    Ready,
    Online,
    Disconnect,
    Failure,
}

/// Roaming behavior dictated by policy, never user-settable.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoamingPolicy {
    #[default]
    Default,
    Always,
    Forbidden,
    National,
    International,
}

/// Address summary for one family of a service's IP configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct IpSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Service fields exposed to session owners. An empty `id` means the
/// session is not bound to any service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<Bearer>,
    #[serde(default)]
    pub ifname: String,
    #[serde(default)]
    pub ipv4: IpSettings,
    #[serde(default)]
    pub ipv6: IpSettings,
}

impl ServiceInfo {
    pub fn is_bound(&self) -> bool {
        !self.id.is_empty()
    }
}

/// Coalesced update sent to a session owner. Only fields that changed since
/// the last update are present; the first update after creation carries all
/// of them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<ConnectionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_bearers: Option<Vec<Bearer>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceInfo>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.connection_type.is_none()
            && self.allowed_bearers.is_none()
            && self.service.is_none()
    }
}

/// Summary of a live session for list/info requests.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionSummary {
    pub path: SessionPath,
    pub owner: String,
    pub state: SessionState,
    pub active: bool,
    pub mark: u32,
    pub connection_type: ConnectionType,
    pub allowed_bearers: Vec<Bearer>,
    pub roaming_policy: RoamingPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
}

/// Description of a service fed into the catalog by the service subsystem.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceSpec {
    pub id: String,
    pub bearer: Bearer,
    #[serde(default)]
    pub ifindex: u32,
    #[serde(default)]
    pub ifname: String,
    #[serde(default)]
    pub ipv4: IpSettings,
    #[serde(default)]
    pub ipv6: IpSettings,
}

fn default_connection_type() -> String {
    "any".to_string()
}

/// Client-to-daemon requests sent as JSON lines over the Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    // Session lifecycle
    SessionCreate {
        #[serde(default)]
        allowed_bearers: Vec<String>,
        #[serde(default = "default_connection_type")]
        connection_type: String,
        #[serde(default)]
        notify_tag: Option<String>,
    },
    SessionConnect {
        path: SessionPath,
    },
    SessionDisconnect {
        path: SessionPath,
    },
    SessionChange {
        path: SessionPath,
        name: String,
        value: serde_json::Value,
    },
    SessionDestroy {
        path: SessionPath,
    },
    SessionList,
    SessionInfo {
        path: SessionPath,
    },

    // Update streaming
    Subscribe {
        path: SessionPath,
    },
    Unsubscribe {
        path: SessionPath,
    },

    // Service ingestion (trusted feed from the interface subsystem)
    ServiceAdd {
        service: ServiceSpec,
    },
    ServiceUpdate {
        id: String,
        #[serde(default)]
        state: Option<ServiceState>,
        #[serde(default)]
        ipv4: Option<IpSettings>,
        #[serde(default)]
        ipv6: Option<IpSettings>,
    },
    ServiceRemove {
        id: String,
    },
    ServiceList,

    Health,
    ServerShutdown,
}

/// Daemon-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Hello {
        protocol_version: u32,
        features: Vec<String>,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Event {
        event: Box<Event>,
    },
}

impl Response {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Response::Ok { data }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    pub fn hello(features: Vec<String>) -> Self {
        Response::Hello {
            protocol_version: PROTOCOL_VERSION,
            features,
        }
    }
}

/// Events streamed to session subscribers.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Coalesced field update for a session.
    SessionUpdate {
        path: SessionPath,
        update: SessionUpdate,
    },
    /// The daemon is tearing the session down; the handle is gone.
    SessionRelease {
        path: SessionPath,
    },
    /// An active session has no satisfying service and policy wants an
    /// outside connector to bring one up.
    AutoconnectNeeded {
        path: SessionPath,
        bearers: Vec<Bearer>,
    },
}

/// Error codes for structured error handling across the socket.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    AlreadyExists,
    Busy,
    PermissionDenied,
    ResourceExhausted,
    PolicyRejected,
    NotFound,
    InvalidRequest,
    ServerError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_names_round_trip() {
        for bearer in Bearer::ALL {
            assert_eq!(Bearer::from_name(bearer.name()), Some(bearer));
        }
        assert_eq!(Bearer::from_name("carrier-pigeon"), None);
    }

    #[test]
    fn connection_type_rejects_unknown() {
        assert_eq!(ConnectionType::from_name("any"), Some(ConnectionType::Any));
        assert_eq!(ConnectionType::from_name("unknown"), None);
        assert_eq!(ConnectionType::from_name(""), None);
    }

    #[test]
    fn request_parses_with_defaults() {
        let req: Request =
            serde_json::from_str(r#"{"cmd":"session_create","allowed_bearers":["wifi"]}"#)
                .expect("parse");
        match req {
            Request::SessionCreate {
                allowed_bearers,
                connection_type,
                notify_tag,
            } => {
                assert_eq!(allowed_bearers, vec!["wifi".to_string()]);
                assert_eq!(connection_type, "any");
                assert_eq!(notify_tag, None);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn update_serializes_only_present_fields() {
        let update = SessionUpdate {
            state: Some(SessionState::Connected),
            ..SessionUpdate::default()
        };
        let value = serde_json::to_value(&update).expect("serialize");
        assert_eq!(value, serde_json::json!({"state": "connected"}));
    }

    #[test]
    fn event_tag_round_trip() {
        let event = Event::SessionRelease {
            path: "/sessions/a/0".to_string(),
        };
        let line = serde_json::to_string(&event).expect("serialize");
        assert!(line.contains(r#""event":"session_release""#));
        let back: Event = serde_json::from_str(&line).expect("parse");
        assert!(matches!(back, Event::SessionRelease { .. }));
    }
}
