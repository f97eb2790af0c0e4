//! End-to-end walks through the public registry API: a policy-restricted
//! session following service churn, with the owner watching the update
//! stream.

use libnsm::{
    CreateOutcome, DefaultPolicy, MatchOrder, MemoryFirewall, MemoryRouting, PolicyEntry,
    RegistryConfig, SessionHandle, SessionRegistry, SessionRequest, StaticPolicy,
};
use nsm_protocol::{
    Bearer, ConnectionType, Event, IpSettings, ServiceSpec, ServiceState, SessionState,
    SessionUpdate,
};

fn request(owner: &str, bearers: &[&str], kind: &str) -> SessionRequest {
    SessionRequest {
        owner: owner.to_string(),
        peer_uid: Some(1000),
        notify_tag: None,
        allowed_bearers: bearers.iter().map(|b| b.to_string()).collect(),
        connection_type: kind.to_string(),
    }
}

fn create(registry: &mut SessionRegistry, req: SessionRequest) -> SessionHandle {
    match registry.create_session(req).expect("create session") {
        CreateOutcome::Created(handle) => handle,
        CreateOutcome::Pending(_) => panic!("unexpected deferred creation"),
    }
}

fn service(id: &str, bearer: Bearer, gateway: &str) -> ServiceSpec {
    ServiceSpec {
        id: id.to_string(),
        bearer,
        ifindex: 3,
        ifname: "wlan0".to_string(),
        ipv4: IpSettings {
            address: Some("10.0.0.2".to_string()),
            prefix: Some(24),
            gateway: Some(gateway.to_string()),
        },
        ipv6: IpSettings::default(),
    }
}

fn drain_updates(handle: &mut SessionHandle) -> Vec<SessionUpdate> {
    let mut updates = Vec::new();
    while let Ok(event) = handle.updates.try_recv() {
        if let Event::SessionUpdate { update, .. } = event {
            updates.push(update);
        }
    }
    updates
}

#[test]
fn session_follows_service_through_its_lifetime() {
    let routing = MemoryRouting::new();
    let mut registry = SessionRegistry::new(
        Box::new(StaticPolicy::new(vec![PolicyEntry {
            uid: 1000,
            allowed_bearers: vec![Bearer::Wifi, Bearer::Ethernet],
            connection_type: None,
            roaming_policy: None,
            priority: false,
            ecall: false,
        }])),
        Box::new(MemoryFirewall::new()),
        Box::new(routing.clone()),
    );

    let mut handle = create(&mut registry, request("app", &["wifi"], "any"));
    let first = drain_updates(&mut handle);
    assert_eq!(first.len(), 1, "creation sends exactly one full update");
    assert_eq!(first[0].allowed_bearers, Some(vec![Bearer::Wifi]));

    registry
        .add_service(service("wifi-home", Bearer::Wifi, "10.0.0.1"))
        .expect("add service");
    registry
        .set_service_state("wifi-home", ServiceState::Association)
        .expect("associating");
    // not yet ready: nothing visible changed
    assert!(drain_updates(&mut handle).is_empty());

    registry
        .set_service_state("wifi-home", ServiceState::Ready)
        .expect("ready");
    let updates = drain_updates(&mut handle);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].state, Some(SessionState::Connected));

    // the private table now routes through the bound service
    let summary = registry.session_summary(&handle.path).expect("summary");
    assert_eq!(
        routing
            .route_for(summary.mark, libnsm::Family::V4)
            .map(|(_, gw)| gw),
        Some(Some("10.0.0.1".to_string()))
    );

    registry
        .set_service_state("wifi-home", ServiceState::Online)
        .expect("online");
    let updates = drain_updates(&mut handle);
    assert_eq!(updates[0].state, Some(SessionState::Online));
    // coalescing: state moved but the bearer list did not
    assert!(updates[0].allowed_bearers.is_none());

    registry
        .set_service_state("wifi-home", ServiceState::Disconnect)
        .expect("disconnecting");
    let updates = drain_updates(&mut handle);
    assert_eq!(updates[0].state, Some(SessionState::Disconnected));
    assert_eq!(updates[0].service, Some(Default::default()));
    assert!(routing.route_for(summary.mark, libnsm::Family::V4).is_none());
}

#[test]
fn connect_without_candidates_requests_autoconnect() {
    let mut registry = SessionRegistry::new(
        Box::new(DefaultPolicy),
        Box::new(MemoryFirewall::new()),
        Box::new(MemoryRouting::new()),
    );
    let mut handle = create(&mut registry, request("app", &["cellular"], "any"));
    registry.connect(&handle.path, "app").expect("connect");

    let mut saw_autoconnect = false;
    while let Ok(event) = handle.updates.try_recv() {
        if let Event::AutoconnectNeeded { bearers, .. } = event {
            assert_eq!(bearers, vec![Bearer::Cellular]);
            saw_autoconnect = true;
        }
    }
    assert!(saw_autoconnect, "expected an autoconnect request");
}

#[test]
fn effective_type_clamp_survives_user_change() {
    let mut registry = SessionRegistry::new(
        Box::new(StaticPolicy::new(vec![PolicyEntry {
            uid: 1000,
            allowed_bearers: Vec::new(),
            connection_type: Some(ConnectionType::Local),
            roaming_policy: None,
            priority: false,
            ecall: false,
        }])),
        Box::new(MemoryFirewall::new()),
        Box::new(MemoryRouting::new()),
    );
    let handle = create(&mut registry, request("app", &[], "any"));
    let summary = registry.session_summary(&handle.path).expect("summary");
    assert_eq!(summary.connection_type, ConnectionType::Local);

    registry
        .change(
            &handle.path,
            "app",
            "ConnectionType",
            &serde_json::json!("internet"),
        )
        .expect("change");
    let summary = registry.session_summary(&handle.path).expect("summary");
    assert_eq!(summary.connection_type, ConnectionType::Local);
}

#[test]
fn two_sessions_share_one_service_until_it_goes_away() {
    let mut registry = SessionRegistry::with_config(
        Box::new(DefaultPolicy),
        Box::new(MemoryFirewall::new()),
        Box::new(MemoryRouting::new()),
        RegistryConfig {
            match_order: MatchOrder::OldestFirst,
            ..RegistryConfig::default()
        },
    );
    let a = create(&mut registry, request("a", &["wifi"], "any"));
    let b = create(&mut registry, request("b", &["wifi"], "any"));

    registry
        .add_service(service("wifi-home", Bearer::Wifi, "10.0.0.1"))
        .expect("add");
    registry
        .set_service_state("wifi-home", ServiceState::Ready)
        .expect("ready");

    for path in [&a.path, &b.path] {
        let summary = registry.session_summary(path).expect("summary");
        assert_eq!(summary.service_id.as_deref(), Some("wifi-home"));
    }

    registry.remove_service("wifi-home").expect("remove");
    for path in [&a.path, &b.path] {
        let summary = registry.session_summary(path).expect("summary");
        assert_eq!(summary.service_id, None);
        assert_eq!(summary.state, SessionState::Disconnected);
    }
}
