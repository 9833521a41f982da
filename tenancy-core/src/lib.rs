//! tenancy-core: transport-agnostic types for multi-tenant session coordination.

pub mod config;
pub mod errors;
pub mod events;
pub mod session;
pub mod tenant;

pub use config::{TenancyConfig, TenancyConfigSnapshot};
pub use errors::{ErrorKind, TenancyError, TenancyResult};
pub use events::{EventListener, EventPat, ListenerId, TenancyEvent, TenancyEventHub, TenancyEventKind};
pub use session::{AuthChangeKind, AuthStateChange, Session, User, UserId};
pub use tenant::{
    ActiveTenantSelection, SessionToken, TenantContextBinding, TenantId, TenantMembership, TenantRole,
    TenantSummary,
};
