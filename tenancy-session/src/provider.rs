//! Boundaries the session components consume.
//!
//! Each is an opaque remote collaborator. Implementations report failures
//! as [`TenancyError`](tenancy_core::TenancyError) inside `anyhow::Error`
//! whenever they can classify them; anything else is treated as an
//! unexpected failure by the callers.

use async_trait::async_trait;
use tenancy_core::{AuthStateChange, Session, SessionToken, TenancyResult, TenantId, TenantMembership, UserId};
use tokio::sync::broadcast;

/// Auth/session provider: push-based state changes plus pull-based reads.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current session, if any. May refresh an expired one behind the scenes.
    async fn get_session(&self) -> TenancyResult<Option<Session>>;

    /// Exchange the cached refresh material for a new session.
    async fn refresh_session(&self) -> TenancyResult<Session>;

    /// Subscribe to provider-pushed events. Each call returns an independent receiver.
    fn subscribe(&self) -> broadcast::Receiver<AuthStateChange>;

    /// Wipe any client-side cached session artifacts. Never fails.
    async fn clear_local_session(&self);
}

/// Read-only membership query.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Active memberships of `user_id` joined with tenant summary,
    /// newest first.
    async fn list_memberships(&self, user_id: &UserId) -> TenancyResult<Vec<TenantMembership>>;
}

/// Server-side procedures that scope the caller's connection to a tenant.
///
/// Absence of a successful `bind` must mean unscoped/denied access.
#[async_trait]
pub trait ContextProcedures: Send + Sync {
    /// Bind this connection to `tenant_id`; returns the server's context id.
    async fn bind(&self, tenant_id: &TenantId, session_token: &SessionToken) -> TenancyResult<String>;

    /// Extend the existing binding. `Ok(false)` means the server rejected it.
    async fn refresh(&self) -> TenancyResult<bool>;

    /// The tenant the server believes this connection is bound to.
    async fn current(&self) -> TenancyResult<Option<TenantId>>;
}
