//! # tenancy-session
//!
//! Client-side coordination for multi-tenant sessions: who is signed in,
//! which tenants they belong to, which one is active, and whether the
//! connection is bound to it on the server.
//!
//! Four components, each the single authority for its state:
//!
//! - [`SessionTracker`]: mirrors the auth provider into a `watch` value
//! - [`TenantFetcher`]: loads memberships with single-flight, cancellation
//!   and exponential backoff
//! - [`TenantSelector`]: picks and reconciles the active tenant
//! - [`TenantContextSetter`]: binds the connection to a tenant, explicitly
//!
//! [`TenantSession`] wires them together over the three boundaries in
//! [`provider`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenancy_session::prelude::*;
//! use tenancy_session::backend::memory::{MemoryAuthProvider, MemoryContextProcedures, MemoryMembershipSource};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let session = TenantSession::new(
//!     Arc::new(MemoryAuthProvider::new()),
//!     Arc::new(MemoryMembershipSource::new()),
//!     Arc::new(MemoryContextProcedures::new()),
//!     SessionOptions::default(),
//! )?;
//! session.start().await;
//!
//! if let Some(tenant) = session.active_tenant().tenant_id {
//!     session.set_tenant_context(&tenant).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod coordinator;
pub mod fetcher;
pub mod options;
pub mod provider;
pub mod selector;
pub mod tracker;

#[cfg(feature = "memory")]
pub mod backend;

#[cfg(feature = "tracing-basic")]
pub mod observability;

pub use binding::TenantContextSetter;
pub use coordinator::{TenantSession, TenantSessionSnapshot};
pub use fetcher::{FetchState, TenantFetcher};
pub use options::{RetryPolicy, SessionOptions};
pub use provider::{AuthProvider, ContextProcedures, MembershipSource};
pub use selector::{auto_select, reconcile, TenantSelector};
pub use tracker::{SessionState, SessionTracker};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

pub mod prelude {
    pub use crate::{
        AuthProvider, ContextProcedures, FetchState, MembershipSource, RetryPolicy, SessionOptions, SessionState,
        TenantSession, TenantSessionSnapshot,
    };

    pub use tenancy_core::{
        ActiveTenantSelection, TenancyError, TenancyEvent, TenancyResult, TenantContextBinding, TenantId,
        TenantMembership, TenantRole,
    };

    pub use async_trait::async_trait;
}
