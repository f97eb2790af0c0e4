//! Known network services and the sessions bound to them.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use nsm_protocol::{Bearer, IpSettings, ServiceInfo, ServiceSpec, ServiceState, SessionPath};

use crate::error::{NsmError, Result};

/// How the catalog is scanned when looking for a satisfying service.
/// Iteration order is the documented tie-break between services that
/// satisfy the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchOrder {
    /// Oldest registration wins.
    #[default]
    OldestFirst,
    /// Newest registration wins.
    NewestFirst,
}

/// One known network service and the sessions currently bound to it.
#[derive(Debug)]
pub struct Service {
    pub id: String,
    pub bearer: Bearer,
    pub state: ServiceState,
    pub ifindex: u32,
    pub ifname: String,
    pub ipv4: IpSettings,
    pub ipv6: IpSettings,
    sessions: HashSet<SessionPath>,
}

impl Service {
    fn new(spec: ServiceSpec) -> Self {
        Self {
            id: spec.id,
            bearer: spec.bearer,
            state: ServiceState::Idle,
            ifindex: spec.ifindex,
            ifname: spec.ifname,
            ipv4: spec.ipv4,
            ipv6: spec.ipv6,
            sessions: HashSet::new(),
        }
    }

    /// Ready or beyond: usable for local reachability.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ServiceState::Ready | ServiceState::Online)
    }

    pub fn is_online(&self) -> bool {
        self.state == ServiceState::Online
    }

    pub fn bound_sessions(&self) -> impl Iterator<Item = &SessionPath> {
        self.sessions.iter()
    }

    pub fn to_info(&self) -> ServiceInfo {
        ServiceInfo {
            id: self.id.clone(),
            bearer: Some(self.bearer),
            ifname: self.ifname.clone(),
            ipv4: self.ipv4.clone(),
            ipv6: self.ipv6.clone(),
        }
    }
}

/// Registration-ordered catalog of services.
#[derive(Default)]
pub struct ServiceCatalog {
    services: HashMap<String, Service>,
    order: Vec<String>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: ServiceSpec) -> Result<()> {
        if self.services.contains_key(&spec.id) {
            return Err(NsmError::AlreadyExists(spec.id));
        }
        debug!(service = %spec.id, bearer = spec.bearer.name(), "service registered");
        self.order.push(spec.id.clone());
        self.services.insert(spec.id.clone(), Service::new(spec));
        Ok(())
    }

    /// Remove a service, returning the sessions that were bound to it so
    /// the registry can unbind them.
    pub fn remove(&mut self, id: &str) -> Result<Vec<SessionPath>> {
        let service = self
            .services
            .remove(id)
            .ok_or_else(|| NsmError::ServiceNotFound(id.to_string()))?;
        self.order.retain(|entry| entry != id);
        debug!(service = %id, "service removed");
        Ok(service.sessions.into_iter().collect())
    }

    pub fn set_state(&mut self, id: &str, state: ServiceState) -> Result<()> {
        let service = self.get_mut(id)?;
        if service.state != state {
            debug!(service = %id, from = ?service.state, to = ?state, "service state change");
            service.state = state;
        }
        Ok(())
    }

    pub fn set_ip_settings(
        &mut self,
        id: &str,
        ipv4: Option<IpSettings>,
        ipv6: Option<IpSettings>,
    ) -> Result<()> {
        let service = self.get_mut(id)?;
        if let Some(ipv4) = ipv4 {
            service.ipv4 = ipv4;
        }
        if let Some(ipv6) = ipv6 {
            service.ipv6 = ipv6;
        }
        Ok(())
    }

    pub fn attach(&mut self, id: &str, path: &SessionPath) -> Result<()> {
        self.get_mut(id)?.sessions.insert(path.clone());
        Ok(())
    }

    pub fn detach(&mut self, id: &str, path: &SessionPath) {
        // The service may already be gone; a stale detach is not an error.
        if let Some(service) = self.services.get_mut(id) {
            service.sessions.remove(path);
        }
    }

    pub fn get(&self, id: &str) -> Result<&Service> {
        self.services
            .get(id)
            .ok_or_else(|| NsmError::ServiceNotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Service> {
        self.services
            .get_mut(id)
            .ok_or_else(|| NsmError::ServiceNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.services.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Services in the configured match order.
    pub fn iter_ordered(&self, order: MatchOrder) -> impl Iterator<Item = &Service> {
        let ids: Vec<&String> = match order {
            MatchOrder::OldestFirst => self.order.iter().collect(),
            MatchOrder::NewestFirst => self.order.iter().rev().collect(),
        };
        ids.into_iter().filter_map(|id| self.services.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, bearer: Bearer) -> ServiceSpec {
        ServiceSpec {
            id: id.to_string(),
            bearer,
            ifindex: 2,
            ifname: format!("{id}0"),
            ipv4: IpSettings::default(),
            ipv6: IpSettings::default(),
        }
    }

    #[test]
    fn add_starts_idle_and_rejects_duplicates() {
        let mut catalog = ServiceCatalog::new();
        catalog.add(spec("wifi-a", Bearer::Wifi)).expect("add");
        assert_eq!(catalog.get("wifi-a").expect("get").state, ServiceState::Idle);

        let err = catalog
            .add(spec("wifi-a", Bearer::Wifi))
            .expect_err("duplicate should fail");
        assert!(matches!(err, NsmError::AlreadyExists(_)));
    }

    #[test]
    fn iteration_follows_registration_order() {
        let mut catalog = ServiceCatalog::new();
        catalog.add(spec("eth-a", Bearer::Ethernet)).expect("add");
        catalog.add(spec("wifi-a", Bearer::Wifi)).expect("add");
        catalog.add(spec("cell-a", Bearer::Cellular)).expect("add");

        let oldest: Vec<&str> = catalog
            .iter_ordered(MatchOrder::OldestFirst)
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(oldest, vec!["eth-a", "wifi-a", "cell-a"]);

        let newest: Vec<&str> = catalog
            .iter_ordered(MatchOrder::NewestFirst)
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(newest, vec!["cell-a", "wifi-a", "eth-a"]);
    }

    #[test]
    fn remove_returns_bound_sessions() {
        let mut catalog = ServiceCatalog::new();
        catalog.add(spec("wifi-a", Bearer::Wifi)).expect("add");
        catalog
            .attach("wifi-a", &"/sessions/a/0".to_string())
            .expect("attach");

        let orphans = catalog.remove("wifi-a").expect("remove");
        assert_eq!(orphans, vec!["/sessions/a/0".to_string()]);
        assert!(!catalog.contains("wifi-a"));
    }

    #[test]
    fn detach_tolerates_missing_service() {
        let mut catalog = ServiceCatalog::new();
        catalog.detach("gone", &"/sessions/a/0".to_string());
    }
}
