//! Per-session packet-mark rules against an abstract firewall backend.
//!
//! One process-wide context (the mark save/restore plumbing in INPUT and
//! POSTROUTING) is created lazily and shared by every session. Each session
//! with a known owner identity then gets a single rule marking its packets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{NsmError, Result};
use crate::policy::SessionOwnerId;

pub type Mark = u32;
pub type RuleHandle = u64;

/// A rule matching packets by session owner identity and tagging them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkRule {
    pub owner: SessionOwnerId,
    pub mark: Mark,
}

/// Abstract packet-filter backend.
pub trait FirewallBackend: Send {
    /// Install the shared mark save/restore context. Called at most once
    /// per backend lifetime.
    fn create_context(&mut self) -> Result<()>;

    /// Tear the shared context down.
    fn destroy_context(&mut self) -> Result<()>;

    fn add_rule(&mut self, table: &str, chain: &str, rule: &MarkRule) -> Result<RuleHandle>;

    /// Removing an already-removed rule must not be an error.
    fn remove_rule(&mut self, handle: RuleHandle) -> Result<()>;
}

/// Session-facing wrapper owning the backend and the shared-context flag.
pub struct Firewall {
    backend: Box<dyn FirewallBackend>,
    context_up: bool,
}

impl Firewall {
    pub fn new(backend: Box<dyn FirewallBackend>) -> Self {
        Self {
            backend,
            context_up: false,
        }
    }

    pub fn context_up(&self) -> bool {
        self.context_up
    }

    /// Install the marking rule for one session, creating the shared
    /// context first if this is the first session needing it.
    pub fn open_session(&mut self, owner: &SessionOwnerId, mark: Mark) -> Result<RuleHandle> {
        if !self.context_up {
            self.backend.create_context()?;
            self.context_up = true;
            debug!("firewall context created");
        }
        let rule = MarkRule {
            owner: owner.clone(),
            mark,
        };
        let handle = self.backend.add_rule("mangle", "OUTPUT", &rule)?;
        debug!(mark, handle, "session mark rule installed");
        Ok(handle)
    }

    /// Remove one session's rule. Failures are logged; the shared context
    /// is left intact for other sessions.
    pub fn close_session(&mut self, handle: RuleHandle) {
        if let Err(err) = self.backend.remove_rule(handle) {
            warn!(handle, "failed to remove session mark rule: {err}");
        }
    }

    /// Tear down the shared context. Only called on full registry teardown.
    pub fn shutdown(&mut self) {
        if !self.context_up {
            return;
        }
        if let Err(err) = self.backend.destroy_context() {
            warn!("failed to destroy firewall context: {err}");
        }
        self.context_up = false;
    }
}

#[derive(Default)]
struct MemoryFirewallState {
    rules: HashMap<RuleHandle, (String, String, MarkRule)>,
    next_handle: RuleHandle,
    context_creations: u32,
    context_destroyed: bool,
    fail_add: bool,
}

/// In-memory backend for tests. Clones share state, so a test can keep a
/// handle and inspect what the registry did through its boxed copy.
#[derive(Clone, Default)]
pub struct MemoryFirewall {
    state: Arc<Mutex<MemoryFirewallState>>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryFirewallState> {
        self.state.lock().expect("firewall state lock poisoned")
    }

    pub fn set_fail_add(&self, fail: bool) {
        self.state().fail_add = fail;
    }

    pub fn context_creations(&self) -> u32 {
        self.state().context_creations
    }

    pub fn context_destroyed(&self) -> bool {
        self.state().context_destroyed
    }

    pub fn rules_for_mark(&self, mark: Mark) -> usize {
        self.state()
            .rules
            .values()
            .filter(|(_, _, rule)| rule.mark == mark)
            .count()
    }

    pub fn rule_count(&self) -> usize {
        self.state().rules.len()
    }
}

impl FirewallBackend for MemoryFirewall {
    fn create_context(&mut self) -> Result<()> {
        self.state().context_creations += 1;
        Ok(())
    }

    fn destroy_context(&mut self) -> Result<()> {
        self.state().context_destroyed = true;
        Ok(())
    }

    fn add_rule(&mut self, table: &str, chain: &str, rule: &MarkRule) -> Result<RuleHandle> {
        let mut state = self.state();
        if state.fail_add {
            return Err(NsmError::ResourceExhausted(
                "firewall rule limit reached".to_string(),
            ));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state
            .rules
            .insert(handle, (table.to_string(), chain.to_string(), rule.clone()));
        Ok(handle)
    }

    fn remove_rule(&mut self, handle: RuleHandle) -> Result<()> {
        // Idempotent: a second remove of the same handle is a no-op.
        self.state().rules.remove(&handle);
        Ok(())
    }
}
