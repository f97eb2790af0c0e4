//! Owner-facing update notifications: a shadow snapshot per session and the
//! coalesced diff sent when anything visible changes.

use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::debug;

use nsm_protocol::{
    Bearer, ConnectionType, Event, ServiceInfo, SessionPath, SessionState, SessionUpdate,
};

use crate::error::{NsmError, Result};

/// The publicly visible fields of a session, as last shown to its owner.
/// List-valued fields compare by value, not identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub connection_type: ConnectionType,
    pub allowed_bearers: Vec<Bearer>,
    pub service: ServiceInfo,
}

impl SessionSnapshot {
    /// The unconditional update sent right after creation.
    pub fn full_update(&self) -> SessionUpdate {
        SessionUpdate {
            state: Some(self.state),
            connection_type: Some(self.connection_type),
            allowed_bearers: Some(self.allowed_bearers.clone()),
            service: Some(self.service.clone()),
        }
    }

    /// Only the fields that differ from the last-notified snapshot.
    pub fn diff_from(&self, last: &SessionSnapshot) -> SessionUpdate {
        SessionUpdate {
            state: (self.state != last.state).then_some(self.state),
            connection_type: (self.connection_type != last.connection_type)
                .then_some(self.connection_type),
            allowed_bearers: (self.allowed_bearers != last.allowed_bearers)
                .then(|| self.allowed_bearers.clone()),
            service: (self.service != last.service).then(|| self.service.clone()),
        }
    }
}

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Per-session broadcast channels carrying owner updates.
#[derive(Default)]
pub struct Notifier {
    channels: HashMap<SessionPath, broadcast::Sender<Event>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: &SessionPath) -> broadcast::Receiver<Event> {
        let (tx, rx) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        self.channels.insert(path.clone(), tx);
        rx
    }

    pub fn remove(&mut self, path: &SessionPath) {
        self.channels.remove(path);
    }

    pub fn subscribe(&self, path: &SessionPath) -> Result<broadcast::Receiver<Event>> {
        self.channels
            .get(path)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| NsmError::SessionNotFound(path.clone()))
    }

    /// Fire-and-forget: a send with no live subscribers is fine.
    pub fn send(&self, path: &SessionPath, event: Event) {
        if let Some(tx) = self.channels.get(path) {
            if tx.send(event).is_err() {
                debug!(session = %path, "update dropped, no subscribers");
            }
        }
    }
}
