//! Effective-config resolution: the merge of provider policy and the
//! caller's requested configuration that matching actually runs against.

use nsm_protocol::{Bearer, ConnectionType};

use crate::error::{NsmError, Result};

/// Parse caller-supplied bearer names. An empty list means "no restriction"
/// and resolves to every known bearer type.
pub fn parse_bearers(names: &[String]) -> Result<Vec<Bearer>> {
    if names.is_empty() {
        return Ok(Bearer::ALL.to_vec());
    }
    let mut bearers = Vec::with_capacity(names.len());
    for name in names {
        let bearer = Bearer::from_name(name)
            .ok_or_else(|| NsmError::InvalidArgument(format!("unknown bearer '{name}'")))?;
        if !bearers.contains(&bearer) {
            bearers.push(bearer);
        }
    }
    Ok(bearers)
}

/// Parse a caller-supplied connection type. "unknown" is never a valid
/// request.
pub fn parse_connection_type(name: &str) -> Result<ConnectionType> {
    ConnectionType::from_name(name)
        .ok_or_else(|| NsmError::InvalidArgument(format!("unknown connection type '{name}'")))
}

/// Intersect the policy's allowed bearers with the caller's requested list,
/// preserving the order of the caller's list.
pub fn effective_bearers(policy: &[Bearer], user: &[Bearer]) -> Vec<Bearer> {
    user.iter()
        .copied()
        .filter(|bearer| policy.contains(bearer))
        .collect()
}

fn strictness(kind: ConnectionType) -> u8 {
    match kind {
        ConnectionType::Local => 0,
        ConnectionType::Internet => 1,
        ConnectionType::Any => 2,
    }
}

/// Apply the policy's connection-type constraint to the caller's request.
/// Policy may clamp a looser request; `Any` passes the request through.
pub fn effective_connection_type(policy: ConnectionType, user: ConnectionType) -> ConnectionType {
    if strictness(user) > strictness(policy) {
        policy
    } else {
        user
    }
}
