//! Session entities and the registry that owns them.
//!
//! The registry is a plain single-threaded state machine: every operation
//! takes `&mut self` and runs to completion, so entity state never sees
//! concurrent mutation. The daemon serializes calls into it.

use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::{debug, info};

use nsm_protocol::{
    Bearer, ConnectionType, Event, IpSettings, ServiceSpec, ServiceState, SessionPath,
    SessionState, SessionSummary,
};

use crate::bearer;
use crate::catalog::{MatchOrder, Service, ServiceCatalog};
use crate::error::{NsmError, Result};
use crate::firewall::{Firewall, FirewallBackend, Mark, RuleHandle};
use crate::notify::{Notifier, SessionSnapshot};
use crate::policy::{
    AutoconnectReason, PolicyConfig, PolicyDecision, PolicyProvider, SessionIdentity,
};
use crate::routing::{Routing, RoutingBackend};

/// First mark handed out; marks are monotonic and never reused while the
/// process runs.
pub const INITIAL_MARK: Mark = 256;

pub struct RegistryConfig {
    pub initial_mark: Mark,
    pub match_order: MatchOrder,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            initial_mark: INITIAL_MARK,
            match_order: MatchOrder::default(),
        }
    }
}

/// A client request for a new session.
pub struct SessionRequest {
    pub owner: String,
    pub peer_uid: Option<u32>,
    pub notify_tag: Option<String>,
    pub allowed_bearers: Vec<String>,
    pub connection_type: String,
}

/// What the caller gets back for a live session.
#[derive(Debug)]
pub struct SessionHandle {
    pub path: SessionPath,
    pub mark: Mark,
    pub updates: broadcast::Receiver<Event>,
}

pub type CreateTicket = u64;

/// Result of a creation request: done, or parked on a deferred policy
/// decision to be finished via [`SessionRegistry::complete_create`].
#[derive(Debug)]
pub enum CreateOutcome {
    Created(SessionHandle),
    Pending(CreateTicket),
}

struct Session {
    path: SessionPath,
    owner: String,
    peer_uid: Option<u32>,
    mark: Mark,
    policy: PolicyConfig,
    user_bearers: Vec<Bearer>,
    user_connection_type: ConnectionType,
    state: SessionState,
    active: bool,
    service: Option<String>,
    fw_rule: Option<RuleHandle>,
    routes_up: bool,
    last_notified: Option<SessionSnapshot>,
}

impl Session {
    fn effective_bearers(&self) -> Vec<Bearer> {
        bearer::effective_bearers(&self.policy.allowed_bearers, &self.user_bearers)
    }

    fn effective_connection_type(&self) -> ConnectionType {
        bearer::effective_connection_type(self.policy.connection_type, self.user_connection_type)
    }

    fn identity(&self) -> SessionIdentity {
        SessionIdentity {
            path: self.path.clone(),
            owner: self.owner.clone(),
            peer_uid: self.peer_uid,
        }
    }

    fn to_summary(&self) -> SessionSummary {
        SessionSummary {
            path: self.path.clone(),
            owner: self.owner.clone(),
            state: self.state,
            active: self.active,
            mark: self.mark,
            connection_type: self.effective_connection_type(),
            allowed_bearers: self.effective_bearers(),
            roaming_policy: self.policy.roaming_policy,
            service_id: self.service.clone(),
        }
    }
}

struct ValidatedRequest {
    path: SessionPath,
    owner: String,
    peer_uid: Option<u32>,
    user_bearers: Vec<Bearer>,
    user_connection_type: ConnectionType,
}

fn service_session_state(state: ServiceState) -> SessionState {
    match state {
        ServiceState::Online => SessionState::Online,
        ServiceState::Ready => SessionState::Connected,
        _ => SessionState::Disconnected,
    }
}

/// Owns all live sessions, the service catalog, the policy provider, and
/// the firewall/routing wrappers.
pub struct SessionRegistry {
    cfg: RegistryConfig,
    policy: Box<dyn PolicyProvider>,
    firewall: Firewall,
    routing: Routing,
    catalog: ServiceCatalog,
    notifier: Notifier,
    sessions: HashMap<SessionPath, Session>,
    pending: HashMap<CreateTicket, ValidatedRequest>,
    next_ticket: CreateTicket,
    next_mark: Mark,
}

impl SessionRegistry {
    pub fn new(
        policy: Box<dyn PolicyProvider>,
        firewall: Box<dyn FirewallBackend>,
        routing: Box<dyn RoutingBackend>,
    ) -> Self {
        Self::with_config(policy, firewall, routing, RegistryConfig::default())
    }

    pub fn with_config(
        policy: Box<dyn PolicyProvider>,
        firewall: Box<dyn FirewallBackend>,
        routing: Box<dyn RoutingBackend>,
        cfg: RegistryConfig,
    ) -> Self {
        let next_mark = cfg.initial_mark;
        Self {
            cfg,
            policy,
            firewall: Firewall::new(firewall),
            routing: Routing::new(routing),
            catalog: ServiceCatalog::new(),
            notifier: Notifier::new(),
            sessions: HashMap::new(),
            pending: HashMap::new(),
            next_ticket: 0,
            next_mark,
        }
    }

    fn session_path(owner: &str, notify_tag: Option<&str>) -> SessionPath {
        format!("/sessions/{owner}/{}", notify_tag.unwrap_or("0"))
    }

    fn path_taken(&self, path: &SessionPath) -> bool {
        self.sessions.contains_key(path) || self.pending.values().any(|p| p.path == *path)
    }

    fn ecall_holder(&self) -> Option<&Session> {
        self.sessions
            .values()
            .find(|session| session.policy.ecall && session.active)
    }

    // --- creation ---

    pub fn create_session(&mut self, req: SessionRequest) -> Result<CreateOutcome> {
        let user_bearers = bearer::parse_bearers(&req.allowed_bearers)?;
        let user_connection_type = bearer::parse_connection_type(&req.connection_type)?;
        let path = Self::session_path(&req.owner, req.notify_tag.as_deref());
        if self.path_taken(&path) {
            return Err(NsmError::AlreadyExists(path));
        }
        if let Some(holder) = self.ecall_holder() {
            if holder.owner != req.owner {
                return Err(NsmError::Busy(
                    "an emergency-call session is active".to_string(),
                ));
            }
        }

        let validated = ValidatedRequest {
            path: path.clone(),
            owner: req.owner,
            peer_uid: req.peer_uid,
            user_bearers,
            user_connection_type,
        };
        let ident = SessionIdentity {
            path,
            owner: validated.owner.clone(),
            peer_uid: validated.peer_uid,
        };
        match self.policy.create(&ident) {
            PolicyDecision::Ready(Ok(config)) => {
                Ok(CreateOutcome::Created(self.finish_create(validated, config)?))
            }
            PolicyDecision::Ready(Err(reason)) => Err(NsmError::PolicyRejected(reason)),
            PolicyDecision::Deferred => {
                self.next_ticket += 1;
                let ticket = self.next_ticket;
                debug!(session = %validated.path, ticket, "session creation deferred to policy");
                self.pending.insert(ticket, validated);
                Ok(CreateOutcome::Pending(ticket))
            }
        }
    }

    /// Finish a deferred creation. A ticket that was canceled in the
    /// meantime (or already completed) yields `Ok(None)`: the late result
    /// is discarded rather than applied to a removed entity.
    pub fn complete_create(
        &mut self,
        ticket: CreateTicket,
        decision: std::result::Result<PolicyConfig, String>,
    ) -> Result<Option<SessionHandle>> {
        let Some(request) = self.pending.remove(&ticket) else {
            debug!(ticket, "discarding late policy completion");
            return Ok(None);
        };
        match decision {
            Ok(config) => self.finish_create(request, config).map(Some),
            Err(reason) => Err(NsmError::PolicyRejected(reason)),
        }
    }

    /// Abandon a deferred creation. Returns whether the ticket was live.
    pub fn cancel_create(&mut self, ticket: CreateTicket) -> bool {
        self.pending.remove(&ticket).is_some()
    }

    fn finish_create(
        &mut self,
        req: ValidatedRequest,
        config: PolicyConfig,
    ) -> Result<SessionHandle> {
        if config.ecall && self.sessions.values().any(|s| s.policy.ecall) {
            return Err(NsmError::Busy(
                "an emergency-call session already exists".to_string(),
            ));
        }

        let mark = self.next_mark;
        self.next_mark += 1;

        // Marking resources only exist for sessions the policy ties to a
        // concrete OS identity.
        let mut fw_rule = None;
        let mut routes_up = false;
        if config.id.is_known() {
            let handle = self.firewall.open_session(&config.id, mark)?;
            if let Err(err) = self.routing.open_session(mark) {
                self.firewall.close_session(handle);
                return Err(err);
            }
            fw_rule = Some(handle);
            routes_up = true;
        }

        let session = Session {
            path: req.path.clone(),
            owner: req.owner,
            peer_uid: req.peer_uid,
            mark,
            policy: config,
            user_bearers: req.user_bearers,
            user_connection_type: req.user_connection_type,
            state: SessionState::Disconnected,
            active: false,
            service: None,
            fw_rule,
            routes_up,
            last_notified: None,
        };
        info!(session = %session.path, mark, "session created");

        let updates = self.notifier.register(&session.path);
        let path = session.path.clone();
        self.sessions.insert(path.clone(), session);
        self.evaluate_session(&path);
        // evaluate_session already sent the first (full) update
        Ok(SessionHandle {
            path,
            mark,
            updates,
        })
    }

    // --- client operations ---

    pub fn connect(&mut self, path: &SessionPath, requester: &str) -> Result<()> {
        let holder = self
            .ecall_holder()
            .map(|s| (s.path.clone(), s.owner.clone()));
        let session = self
            .sessions
            .get_mut(path)
            .ok_or_else(|| NsmError::SessionNotFound(path.clone()))?;
        if session.owner != requester {
            return Err(NsmError::PermissionDenied(
                "session belongs to another owner".to_string(),
            ));
        }
        if let Some((holder_path, holder_owner)) = holder {
            if holder_path != *path && (session.policy.ecall || session.owner != holder_owner) {
                return Err(NsmError::Busy(
                    "an emergency-call session is active".to_string(),
                ));
            }
        }
        let was_active = session.active;
        session.active = true;
        if !was_active {
            self.policy.session_changed(path, true);
        }
        self.evaluate_session(path);
        self.maybe_request_autoconnect(path, AutoconnectReason::SessionConnect);
        Ok(())
    }

    pub fn disconnect(&mut self, path: &SessionPath, requester: &str) -> Result<()> {
        let session = self
            .sessions
            .get_mut(path)
            .ok_or_else(|| NsmError::SessionNotFound(path.clone()))?;
        if session.owner != requester {
            return Err(NsmError::PermissionDenied(
                "session belongs to another owner".to_string(),
            ));
        }
        let was_active = session.active;
        session.active = false;
        let bound = session.service.clone();
        if !was_active && bound.is_none() {
            return Ok(());
        }
        if was_active {
            self.policy.session_changed(path, false);
        }
        if let Some(service_id) = bound {
            self.unbind(path, &service_id);
        }
        self.notify(path);
        Ok(())
    }

    pub fn change(
        &mut self,
        path: &SessionPath,
        requester: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let session = self
            .sessions
            .get(path)
            .ok_or_else(|| NsmError::SessionNotFound(path.clone()))?;
        if session.owner != requester {
            return Err(NsmError::PermissionDenied(
                "session belongs to another owner".to_string(),
            ));
        }
        match name {
            "AllowedBearers" => {
                let names = value
                    .as_array()
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|entry| {
                                entry
                                    .as_str()
                                    .map(str::to_string)
                                    .ok_or_else(|| {
                                        NsmError::InvalidArgument(
                                            "bearer names must be strings".to_string(),
                                        )
                                    })
                            })
                            .collect::<Result<Vec<String>>>()
                    })
                    .ok_or_else(|| {
                        NsmError::InvalidArgument("AllowedBearers expects an array".to_string())
                    })??;
                let bearers = bearer::parse_bearers(&names)?;
                if let Some(session) = self.sessions.get_mut(path) {
                    session.user_bearers = bearers;
                }
            }
            "ConnectionType" => {
                let raw = value.as_str().ok_or_else(|| {
                    NsmError::InvalidArgument("ConnectionType expects a string".to_string())
                })?;
                let kind = bearer::parse_connection_type(raw)?;
                if let Some(session) = self.sessions.get_mut(path) {
                    session.user_connection_type = kind;
                }
            }
            other => {
                return Err(NsmError::InvalidArgument(format!(
                    "unknown session setting '{other}'"
                )));
            }
        }
        self.evaluate_session(path);
        self.maybe_request_autoconnect(path, AutoconnectReason::ConfigChange);
        Ok(())
    }

    /// Provider-driven config update: the policy config is replaced
    /// wholesale, never edited in place. The owner identity is fixed at
    /// creation because the marking resources hang off it.
    pub fn update_policy(&mut self, path: &SessionPath, config: PolicyConfig) -> Result<()> {
        if config.ecall
            && self
                .sessions
                .values()
                .any(|s| s.policy.ecall && s.path != *path)
        {
            return Err(NsmError::Busy(
                "an emergency-call session already exists".to_string(),
            ));
        }
        let session = self
            .sessions
            .get_mut(path)
            .ok_or_else(|| NsmError::SessionNotFound(path.clone()))?;
        if config.id != session.policy.id {
            return Err(NsmError::InvalidArgument(
                "policy identity cannot change after creation".to_string(),
            ));
        }
        session.policy = config;
        self.evaluate_session(path);
        Ok(())
    }

    pub fn destroy_session(&mut self, path: &SessionPath, requester: &str) -> Result<()> {
        if !self.sessions.contains_key(path) {
            // A deferred creation can be abandoned by its owner before the
            // policy decision lands.
            let ticket = self
                .pending
                .iter()
                .find(|(_, p)| p.path == *path && p.owner == requester)
                .map(|(ticket, _)| *ticket);
            if let Some(ticket) = ticket {
                self.pending.remove(&ticket);
                debug!(session = %path, ticket, "pending session creation canceled");
                return Ok(());
            }
            return Err(NsmError::SessionNotFound(path.clone()));
        }

        let session = &self.sessions[path];
        if requester != session.owner {
            if session.policy.ecall {
                return Err(NsmError::Busy(
                    "emergency-call sessions are destroyed by their holder".to_string(),
                ));
            }
            let requester_is_holder = self
                .ecall_holder()
                .map(|holder| holder.owner == requester)
                .unwrap_or(false);
            if !requester_is_holder {
                return Err(NsmError::PermissionDenied(
                    "session belongs to another owner".to_string(),
                ));
            }
        }
        self.teardown_session(path, false);
        Ok(())
    }

    /// The owner's connection vanished: implicit, successful destroy of
    /// everything it held, including deferred creations.
    pub fn release_owner(&mut self, owner: &str) -> usize {
        let paths: Vec<SessionPath> = self
            .sessions
            .values()
            .filter(|s| s.owner == owner)
            .map(|s| s.path.clone())
            .collect();
        for path in &paths {
            self.teardown_session(path, false);
        }
        let tickets: Vec<CreateTicket> = self
            .pending
            .iter()
            .filter(|(_, p)| p.owner == owner)
            .map(|(ticket, _)| *ticket)
            .collect();
        for ticket in tickets {
            self.pending.remove(&ticket);
        }
        paths.len()
    }

    /// Registry teardown: release every session (owners get a Release
    /// event first) and drop the shared firewall context last.
    pub fn shutdown(&mut self) {
        let paths: Vec<SessionPath> = self.sessions.keys().cloned().collect();
        for path in &paths {
            self.teardown_session(path, true);
        }
        self.pending.clear();
        self.firewall.shutdown();
    }

    fn teardown_session(&mut self, path: &SessionPath, forced: bool) {
        // No further owner updates once destruction begins.
        if forced {
            self.notifier
                .send(path, Event::SessionRelease { path: path.clone() });
        }
        let Some(mut session) = self.sessions.remove(path) else {
            return;
        };
        if let Some(service_id) = session.service.take() {
            self.catalog.detach(&service_id, path);
        }
        // Reverse creation order; every step is attempted even if an
        // earlier one failed or its resource never existed.
        if session.routes_up {
            self.routing.close_session(session.mark);
        }
        if let Some(handle) = session.fw_rule.take() {
            self.firewall.close_session(handle);
        }
        self.policy.destroy(path);
        self.notifier.remove(path);
        info!(session = %path, mark = session.mark, "session destroyed");
    }

    // --- matching ---

    fn satisfies(&self, session: &Session, service: &Service) -> bool {
        let state_ok = match session.effective_connection_type() {
            ConnectionType::Internet => service.is_online(),
            ConnectionType::Any | ConnectionType::Local => service.is_connected(),
        };
        if !state_ok {
            return false;
        }
        match self.policy.allowed(&session.identity(), service) {
            Some(allowed) => allowed,
            None => session.effective_bearers().contains(&service.bearer),
        }
    }

    /// Re-run the matching step for one session. A still-satisfying
    /// current binding is kept; otherwise the first satisfying service in
    /// the configured order wins. Rebinding always goes through
    /// unbind-then-bind.
    fn evaluate_session(&mut self, path: &SessionPath) {
        let (current, target) = {
            let Some(session) = self.sessions.get(path) else {
                return;
            };
            let keep = session
                .service
                .as_deref()
                .and_then(|id| self.catalog.get(id).ok())
                .map(|service| self.satisfies(session, service))
                .unwrap_or(false);
            let target = if keep {
                session.service.clone()
            } else {
                self.catalog
                    .iter_ordered(self.cfg.match_order)
                    .find(|service| self.satisfies(session, service))
                    .map(|service| service.id.clone())
            };
            (session.service.clone(), target)
        };

        match (current, target) {
            (Some(old), Some(new)) if old == new => self.refresh_binding(path, &new, false),
            (Some(old), Some(new)) => {
                self.unbind(path, &old);
                self.bind(path, &new);
            }
            (Some(old), None) => self.unbind(path, &old),
            (None, Some(new)) => self.bind(path, &new),
            (None, None) => {}
        }
        self.notify(path);
    }

    fn bind(&mut self, path: &SessionPath, service_id: &str) {
        if self.catalog.attach(service_id, path).is_err() {
            return;
        }
        let new_state = match self.catalog.get(service_id) {
            Ok(service) => service_session_state(service.state),
            Err(_) => return,
        };
        let Some(session) = self.sessions.get_mut(path) else {
            self.catalog.detach(service_id, path);
            return;
        };
        session.service = Some(service_id.to_string());
        session.state = new_state;
        let (mark, routes_up) = (session.mark, session.routes_up);
        if routes_up {
            if let Ok(service) = self.catalog.get(service_id) {
                self.routing.set_default_route(mark, service);
            }
        }
        info!(session = %path, service = %service_id, state = ?new_state, "session bound");
    }

    fn unbind(&mut self, path: &SessionPath, service_id: &str) {
        self.catalog.detach(service_id, path);
        let Some(session) = self.sessions.get_mut(path) else {
            return;
        };
        session.service = None;
        session.state = SessionState::Disconnected;
        let (mark, routes_up) = (session.mark, session.routes_up);
        if routes_up {
            self.routing.clear_default_route(mark);
        }
        info!(session = %path, service = %service_id, "session unbound");
    }

    /// The binding stands; the service behind it may have moved between
    /// ready and online or changed addresses.
    fn refresh_binding(&mut self, path: &SessionPath, service_id: &str, force_route: bool) {
        let new_state = match self.catalog.get(service_id) {
            Ok(service) => service_session_state(service.state),
            Err(_) => return,
        };
        let Some(session) = self.sessions.get_mut(path) else {
            return;
        };
        let state_changed = session.state != new_state;
        session.state = new_state;
        let (mark, routes_up) = (session.mark, session.routes_up);
        if routes_up && (state_changed || force_route) {
            if let Ok(service) = self.catalog.get(service_id) {
                self.routing.set_default_route(mark, service);
            }
        }
        if state_changed {
            debug!(session = %path, state = ?new_state, "session state follows service");
        }
    }

    fn maybe_request_autoconnect(&mut self, path: &SessionPath, reason: AutoconnectReason) {
        let Some(session) = self.sessions.get(path) else {
            return;
        };
        if !session.active || session.service.is_some() {
            return;
        }
        if !self.policy.autoconnect(reason) {
            return;
        }
        let bearers = session.effective_bearers();
        debug!(session = %path, ?reason, "requesting autoconnect");
        self.notifier.send(
            path,
            Event::AutoconnectNeeded {
                path: path.clone(),
                bearers,
            },
        );
    }

    // --- notifications ---

    fn snapshot(&self, session: &Session) -> SessionSnapshot {
        let service = session
            .service
            .as_deref()
            .and_then(|id| self.catalog.get(id).ok())
            .map(|service| service.to_info())
            .unwrap_or_default();
        SessionSnapshot {
            state: session.state,
            connection_type: session.effective_connection_type(),
            allowed_bearers: session.effective_bearers(),
            service,
        }
    }

    fn notify(&mut self, path: &SessionPath) {
        let update = {
            let Some(session) = self.sessions.get(path) else {
                return;
            };
            let snapshot = self.snapshot(session);
            let update = match &session.last_notified {
                None => snapshot.full_update(),
                Some(last) => snapshot.diff_from(last),
            };
            if update.is_empty() {
                return;
            }
            if let Some(session) = self.sessions.get_mut(path) {
                session.last_notified = Some(snapshot);
            }
            update
        };
        self.notifier.send(
            path,
            Event::SessionUpdate {
                path: path.clone(),
                update,
            },
        );
    }

    // --- service feed ---

    pub fn add_service(&mut self, spec: ServiceSpec) -> Result<()> {
        self.catalog.add(spec)?;
        self.evaluate_all();
        Ok(())
    }

    pub fn set_service_state(&mut self, id: &str, state: ServiceState) -> Result<()> {
        self.catalog.set_state(id, state)?;
        self.evaluate_all();
        Ok(())
    }

    pub fn set_service_config(
        &mut self,
        id: &str,
        ipv4: Option<IpSettings>,
        ipv6: Option<IpSettings>,
    ) -> Result<()> {
        self.catalog.set_ip_settings(id, ipv4, ipv6)?;
        let bound: Vec<SessionPath> = self
            .sessions
            .values()
            .filter(|s| s.service.as_deref() == Some(id))
            .map(|s| s.path.clone())
            .collect();
        for path in bound {
            self.refresh_binding(&path, id, true);
            self.notify(&path);
        }
        Ok(())
    }

    pub fn remove_service(&mut self, id: &str) -> Result<()> {
        let orphans = self.catalog.remove(id)?;
        for path in orphans {
            if let Some(session) = self.sessions.get_mut(&path) {
                session.service = None;
                session.state = SessionState::Disconnected;
                let (mark, routes_up) = (session.mark, session.routes_up);
                if routes_up {
                    self.routing.clear_default_route(mark);
                }
            }
            // The session may rebind to whatever else satisfies it.
            self.evaluate_session(&path);
        }
        Ok(())
    }

    fn evaluate_all(&mut self) {
        let paths: Vec<SessionPath> = self.sessions.keys().cloned().collect();
        for path in paths {
            self.evaluate_session(&path);
        }
    }

    // --- introspection ---

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.values().map(Session::to_summary).collect()
    }

    pub fn session_summary(&self, path: &SessionPath) -> Result<SessionSummary> {
        self.sessions
            .get(path)
            .map(Session::to_summary)
            .ok_or_else(|| NsmError::SessionNotFound(path.clone()))
    }

    pub fn subscribe(&self, path: &SessionPath) -> Result<broadcast::Receiver<Event>> {
        self.notifier.subscribe(path)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }
}
