//! Pluggable session policy. At most one provider is active per registry;
//! with none configured the permissive [`DefaultPolicy`] applies.

use std::collections::HashMap;

use serde::Deserialize;

use nsm_protocol::{Bearer, ConnectionType, RoamingPolicy, SessionPath};

use crate::catalog::Service;

/// OS-level identity a policy ties a session to. Firewall and routing
/// resources are only allocated for sessions with a known identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionOwnerId {
    #[default]
    Unknown,
    Uid(u32),
    Gid(u32),
    SecurityContext(String),
}

impl SessionOwnerId {
    pub fn is_known(&self) -> bool {
        !matches!(self, SessionOwnerId::Unknown)
    }
}

/// Policy-owned session configuration. Replaced wholesale by the provider,
/// never mutated in place by the session.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub id: SessionOwnerId,
    pub allowed_bearers: Vec<Bearer>,
    pub connection_type: ConnectionType,
    pub roaming_policy: RoamingPolicy,
    pub priority: bool,
    pub ecall: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            id: SessionOwnerId::Unknown,
            allowed_bearers: Bearer::ALL.to_vec(),
            connection_type: ConnectionType::Any,
            roaming_policy: RoamingPolicy::Default,
            priority: false,
            ecall: false,
        }
    }
}

/// Identity of the requesting client, as seen by the provider.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub path: SessionPath,
    pub owner: String,
    pub peer_uid: Option<u32>,
}

/// Why the registry is asking whether to request an autoconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoconnectReason {
    /// The owner explicitly asked the session to connect.
    SessionConnect,
    /// The session's constraints changed and nothing satisfies them now.
    ConfigChange,
}

/// Outcome of [`PolicyProvider::create`]. A deferred decision is finished
/// later through `SessionRegistry::complete_create`.
pub enum PolicyDecision {
    Ready(Result<PolicyConfig, String>),
    Deferred,
}

/// Strategy interface for session policy.
pub trait PolicyProvider: Send {
    /// Evaluate policy for a session being created.
    fn create(&mut self, ident: &SessionIdentity) -> PolicyDecision;

    /// The session is gone; drop any per-session provider state.
    fn destroy(&mut self, _path: &SessionPath) {}

    /// Custom service-eligibility predicate. `None` falls back to the
    /// bearer-set test.
    fn allowed(&self, _ident: &SessionIdentity, _service: &Service) -> Option<bool> {
        None
    }

    /// The session's `active` flag flipped.
    fn session_changed(&mut self, _path: &SessionPath, _active: bool) {}

    /// Whether an unsatisfied active session should ask an outer connector
    /// to bring a service up.
    fn autoconnect(&self, _reason: AutoconnectReason) -> bool {
        true
    }
}

/// The no-provider case: everything allowed, nothing deferred.
#[derive(Debug, Default)]
pub struct DefaultPolicy;

impl PolicyProvider for DefaultPolicy {
    fn create(&mut self, _ident: &SessionIdentity) -> PolicyDecision {
        PolicyDecision::Ready(Ok(PolicyConfig::default()))
    }
}

/// One per-UID policy entry, loadable from the daemon's policy file.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyEntry {
    pub uid: u32,
    #[serde(default)]
    pub allowed_bearers: Vec<Bearer>,
    #[serde(default)]
    pub connection_type: Option<ConnectionType>,
    #[serde(default)]
    pub roaming_policy: Option<RoamingPolicy>,
    #[serde(default)]
    pub priority: bool,
    #[serde(default)]
    pub ecall: bool,
}

/// Table-driven provider keyed by the peer's UID. Peers without an entry
/// get the permissive default config, with their UID recorded so marking
/// resources are still allocated.
pub struct StaticPolicy {
    by_uid: HashMap<u32, PolicyConfig>,
}

impl StaticPolicy {
    pub fn new(entries: Vec<PolicyEntry>) -> Self {
        let by_uid = entries
            .into_iter()
            .map(|entry| {
                let config = PolicyConfig {
                    id: SessionOwnerId::Uid(entry.uid),
                    allowed_bearers: if entry.allowed_bearers.is_empty() {
                        Bearer::ALL.to_vec()
                    } else {
                        entry.allowed_bearers.clone()
                    },
                    connection_type: entry.connection_type.unwrap_or(ConnectionType::Any),
                    roaming_policy: entry.roaming_policy.unwrap_or_default(),
                    priority: entry.priority,
                    ecall: entry.ecall,
                };
                (entry.uid, config)
            })
            .collect();
        Self { by_uid }
    }
}

impl PolicyProvider for StaticPolicy {
    fn create(&mut self, ident: &SessionIdentity) -> PolicyDecision {
        let config = match ident.peer_uid {
            Some(uid) => self
                .by_uid
                .get(&uid)
                .cloned()
                .unwrap_or_else(|| PolicyConfig {
                    id: SessionOwnerId::Uid(uid),
                    ..PolicyConfig::default()
                }),
            None => PolicyConfig::default(),
        };
        PolicyDecision::Ready(Ok(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(uid: Option<u32>) -> SessionIdentity {
        SessionIdentity {
            path: "/sessions/test/0".to_string(),
            owner: "test".to_string(),
            peer_uid: uid,
        }
    }

    #[test]
    fn default_policy_is_permissive() {
        let mut policy = DefaultPolicy;
        let PolicyDecision::Ready(Ok(config)) = policy.create(&ident(None)) else {
            panic!("expected an immediate permissive config");
        };
        assert_eq!(config.id, SessionOwnerId::Unknown);
        assert_eq!(config.allowed_bearers, Bearer::ALL.to_vec());
        assert_eq!(config.connection_type, ConnectionType::Any);
        assert!(!config.ecall);
    }

    #[test]
    fn static_policy_restricts_known_uid() {
        let mut policy = StaticPolicy::new(vec![PolicyEntry {
            uid: 1000,
            allowed_bearers: vec![Bearer::Ethernet],
            connection_type: Some(ConnectionType::Local),
            roaming_policy: None,
            priority: true,
            ecall: false,
        }]);

        let PolicyDecision::Ready(Ok(config)) = policy.create(&ident(Some(1000))) else {
            panic!("expected an immediate config");
        };
        assert_eq!(config.id, SessionOwnerId::Uid(1000));
        assert_eq!(config.allowed_bearers, vec![Bearer::Ethernet]);
        assert_eq!(config.connection_type, ConnectionType::Local);
        assert!(config.priority);
    }

    #[test]
    fn static_policy_falls_back_for_unlisted_uid() {
        let mut policy = StaticPolicy::new(Vec::new());
        let PolicyDecision::Ready(Ok(config)) = policy.create(&ident(Some(42))) else {
            panic!("expected an immediate config");
        };
        assert_eq!(config.id, SessionOwnerId::Uid(42));
        assert_eq!(config.allowed_bearers, Bearer::ALL.to_vec());
    }
}
