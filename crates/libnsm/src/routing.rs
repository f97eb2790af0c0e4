//! Per-session policy routing: fwmark rules steering marked packets into a
//! private table (numbered by the mark), and the default route installed in
//! that table while the session is bound to a service.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::catalog::Service;
use crate::error::{NsmError, Result};
use crate::firewall::Mark;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// Abstract policy-routing backend.
pub trait RoutingBackend: Send {
    fn add_fwmark_rule(&mut self, mark: Mark, family: Family, table: u32) -> Result<()>;

    /// Deleting an absent rule must not be an error.
    fn del_fwmark_rule(&mut self, mark: Mark, family: Family, table: u32) -> Result<()>;

    fn add_default_route(
        &mut self,
        table: u32,
        family: Family,
        ifindex: u32,
        gateway: Option<&str>,
    ) -> Result<()>;

    /// Deleting an absent route must not be an error.
    fn del_default_route(&mut self, table: u32, family: Family) -> Result<()>;
}

/// Session-facing wrapper over the routing backend.
pub struct Routing {
    backend: Box<dyn RoutingBackend>,
}

impl Routing {
    pub fn new(backend: Box<dyn RoutingBackend>) -> Self {
        Self { backend }
    }

    /// Install the IPv4 and IPv6 fwmark rules for a session. On partial
    /// failure the already-installed rule is rolled back.
    pub fn open_session(&mut self, mark: Mark) -> Result<()> {
        self.backend.add_fwmark_rule(mark, Family::V4, mark)?;
        if let Err(err) = self.backend.add_fwmark_rule(mark, Family::V6, mark) {
            if let Err(rollback) = self.backend.del_fwmark_rule(mark, Family::V4, mark) {
                warn!(mark, "fwmark rule rollback failed: {rollback}");
            }
            return Err(err);
        }
        debug!(mark, "fwmark rules installed");
        Ok(())
    }

    /// Point the session's private table at the bound service. The old
    /// route is removed first so a rebind never leaves two entries.
    pub fn set_default_route(&mut self, mark: Mark, service: &Service) {
        self.clear_default_route(mark);
        for (family, settings) in [(Family::V4, &service.ipv4), (Family::V6, &service.ipv6)] {
            if settings.address.is_none() && settings.gateway.is_none() {
                continue;
            }
            if let Err(err) = self.backend.add_default_route(
                mark,
                family,
                service.ifindex,
                settings.gateway.as_deref(),
            ) {
                warn!(mark, service = %service.id, ?family, "failed to install default route: {err}");
            }
        }
    }

    pub fn clear_default_route(&mut self, mark: Mark) {
        for family in [Family::V4, Family::V6] {
            if let Err(err) = self.backend.del_default_route(mark, family) {
                warn!(mark, ?family, "failed to remove default route: {err}");
            }
        }
    }

    /// Tear down everything the session installed. Every step is attempted
    /// regardless of earlier failures.
    pub fn close_session(&mut self, mark: Mark) {
        self.clear_default_route(mark);
        for family in [Family::V4, Family::V6] {
            if let Err(err) = self.backend.del_fwmark_rule(mark, family, mark) {
                warn!(mark, ?family, "failed to remove fwmark rule: {err}");
            }
        }
    }
}

#[derive(Default)]
struct MemoryRoutingState {
    fwmark_rules: HashSet<(Mark, Family, u32)>,
    routes: HashMap<(u32, Family), (u32, Option<String>)>,
    fail_v6_rule: bool,
}

/// In-memory backend for tests. Clones share state, so a test can keep a
/// handle and inspect what the registry did through its boxed copy.
#[derive(Clone, Default)]
pub struct MemoryRouting {
    state: Arc<Mutex<MemoryRoutingState>>,
}

impl MemoryRouting {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryRoutingState> {
        self.state.lock().expect("routing state lock poisoned")
    }

    pub fn set_fail_v6_rule(&self, fail: bool) {
        self.state().fail_v6_rule = fail;
    }

    pub fn fwmark_rule_count(&self, mark: Mark) -> usize {
        self.state()
            .fwmark_rules
            .iter()
            .filter(|(m, _, _)| *m == mark)
            .count()
    }

    pub fn route_for(&self, table: u32, family: Family) -> Option<(u32, Option<String>)> {
        self.state().routes.get(&(table, family)).cloned()
    }

    pub fn table_is_empty(&self, table: u32) -> bool {
        self.fwmark_rule_count(table) == 0
            && self.route_for(table, Family::V4).is_none()
            && self.route_for(table, Family::V6).is_none()
    }
}

impl RoutingBackend for MemoryRouting {
    fn add_fwmark_rule(&mut self, mark: Mark, family: Family, table: u32) -> Result<()> {
        let mut state = self.state();
        if state.fail_v6_rule && family == Family::V6 {
            return Err(NsmError::ResourceExhausted("rule table full".to_string()));
        }
        state.fwmark_rules.insert((mark, family, table));
        Ok(())
    }

    fn del_fwmark_rule(&mut self, mark: Mark, family: Family, table: u32) -> Result<()> {
        self.state().fwmark_rules.remove(&(mark, family, table));
        Ok(())
    }

    fn add_default_route(
        &mut self,
        table: u32,
        family: Family,
        ifindex: u32,
        gateway: Option<&str>,
    ) -> Result<()> {
        self.state()
            .routes
            .insert((table, family), (ifindex, gateway.map(str::to_string)));
        Ok(())
    }

    fn del_default_route(&mut self, table: u32, family: Family) -> Result<()> {
        self.state().routes.remove(&(table, family));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServiceCatalog;
    use nsm_protocol::{Bearer, IpSettings, ServiceSpec, ServiceState};

    fn catalog_with_wifi(gateway: Option<&str>) -> ServiceCatalog {
        let mut catalog = ServiceCatalog::new();
        catalog
            .add(ServiceSpec {
                id: "wifi-a".to_string(),
                bearer: Bearer::Wifi,
                ifindex: 3,
                ifname: "wlan0".to_string(),
                ipv4: IpSettings {
                    address: Some("192.168.1.40".to_string()),
                    prefix: Some(24),
                    gateway: gateway.map(str::to_string),
                },
                ipv6: IpSettings::default(),
            })
            .expect("add service");
        catalog
            .set_state("wifi-a", ServiceState::Ready)
            .expect("set state");
        catalog
    }

    #[test]
    fn rebind_replaces_route_without_duplicates() {
        let backend = MemoryRouting::new();
        let mut routing = Routing::new(Box::new(backend.clone()));
        routing.open_session(256).expect("open");

        let catalog = catalog_with_wifi(Some("192.168.1.1"));
        let service = catalog.get("wifi-a").expect("service");
        routing.set_default_route(256, service);
        routing.set_default_route(256, service);

        assert_eq!(
            backend.route_for(256, Family::V4),
            Some((3, Some("192.168.1.1".to_string())))
        );
        assert_eq!(backend.route_for(256, Family::V6), None);
    }

    #[test]
    fn close_session_empties_private_table_twice_over() {
        let backend = MemoryRouting::new();
        let mut routing = Routing::new(Box::new(backend.clone()));
        routing.open_session(256).expect("open");
        let catalog = catalog_with_wifi(Some("192.168.1.1"));
        routing.set_default_route(256, catalog.get("wifi-a").expect("service"));

        routing.close_session(256);
        routing.close_session(256);

        assert!(backend.table_is_empty(256));
    }

    #[test]
    fn partial_rule_failure_rolls_back() {
        let backend = MemoryRouting::new();
        backend.set_fail_v6_rule(true);
        let mut routing = Routing::new(Box::new(backend.clone()));

        assert!(routing.open_session(256).is_err());
        assert_eq!(backend.fwmark_rule_count(256), 0);
    }
}
