pub mod bearer;
pub mod catalog;
pub mod error;
pub mod firewall;
pub mod notify;
pub mod policy;
pub mod routing;
pub mod session;

pub use catalog::{MatchOrder, Service, ServiceCatalog};
pub use error::{NsmError, Result};
pub use firewall::{Firewall, FirewallBackend, Mark, MarkRule, MemoryFirewall, RuleHandle};
pub use notify::{Notifier, SessionSnapshot};
pub use policy::{
    AutoconnectReason, DefaultPolicy, PolicyConfig, PolicyDecision, PolicyEntry, PolicyProvider,
    SessionIdentity, SessionOwnerId, StaticPolicy,
};
pub use routing::{Family, MemoryRouting, Routing, RoutingBackend};
pub use session::{
    CreateOutcome, CreateTicket, RegistryConfig, SessionHandle, SessionRegistry, SessionRequest,
    INITIAL_MARK,
};
