//! # tenancy-rest
//!
//! HTTP implementations of the `tenancy-session` boundaries for a
//! PostgREST + GoTrue style backend:
//!
//! - [`RestAuthProvider`]: password sign-in, refresh-token rotation, sign-out
//! - [`RestMembershipSource`]: `GET /rest/v1/{membership_table}`
//! - [`RestContextProcedures`]: `POST /rest/v1/rpc/{name}`
//!
//! HTTP statuses and PostgREST error bodies are mapped onto
//! [`TenancyError`](tenancy_core::TenancyError) kinds so the session layer
//! can tell transient failures from auth failures.

pub mod auth;
pub mod client;
pub mod context;
pub mod error;
pub mod memberships;
pub mod options;

use std::sync::Arc;

use tenancy_core::TenancyResult;
use tenancy_session::{SessionOptions, TenantSession};

pub use auth::RestAuthProvider;
pub use client::RestClient;
pub use context::RestContextProcedures;
pub use error::{map_error_body, RestError, RestResult};
pub use memberships::RestMembershipSource;
pub use options::RestOptions;

/// The three adapters sharing one client and one session cache.
#[derive(Clone)]
pub struct RestBackend {
    pub auth: Arc<RestAuthProvider>,
    pub memberships: Arc<RestMembershipSource>,
    pub procedures: Arc<RestContextProcedures>,
}

impl RestBackend {
    pub fn new(options: RestOptions) -> TenancyResult<Self> {
        let client = Arc::new(RestClient::new(options).map_err(RestError::into_anyhow)?);
        let auth = Arc::new(RestAuthProvider::new(client.clone()));
        Ok(Self {
            memberships: Arc::new(RestMembershipSource::new(client.clone(), auth.clone())),
            procedures: Arc::new(RestContextProcedures::new(client, auth.clone())),
            auth,
        })
    }

    /// Build a [`TenantSession`] over these adapters.
    pub fn session(&self, options: SessionOptions) -> TenancyResult<TenantSession> {
        TenantSession::new(
            self.auth.clone(),
            self.memberships.clone(),
            self.procedures.clone(),
            options,
        )
    }
}
