//! Tenant context setter: the client-side mirror of the server's tenant
//! binding for this connection.
//!
//! Binding is explicit. Nothing here reacts to selection changes; callers
//! decide when to bind. Bind, refresh and clear are serialized so the
//! single server-side slot and the local mirror cannot drift apart, and a
//! clear issued while a bind is outstanding wins over that bind's result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tenancy_core::{SessionToken, TenancyError, TenancyEvent, TenancyEventHub, TenantContextBinding, TenantId};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::provider::ContextProcedures;
use crate::tracker::SessionState;

pub const NOT_AUTHENTICATED: &str = "Not authenticated";
pub const CONTEXT_EXPIRED: &str = "Tenant context expired";

pub struct TenantContextSetter {
    procedures: Arc<dyn ContextProcedures>,
    auth: watch::Receiver<SessionState>,
    state: watch::Sender<TenantContextBinding>,
    op_lock: Mutex<()>,
    /// Bumped by `clear`; a bind that started under an older generation is discarded.
    generation: AtomicU64,
    events: Arc<TenancyEventHub>,
}

impl TenantContextSetter {
    pub fn new(
        procedures: Arc<dyn ContextProcedures>,
        auth: watch::Receiver<SessionState>,
        events: Arc<TenancyEventHub>,
    ) -> Self {
        let (state, _) = watch::channel(TenantContextBinding::default());
        Self {
            procedures,
            auth,
            state,
            op_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            events,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TenantContextBinding> {
        self.state.subscribe()
    }

    pub fn state(&self) -> TenantContextBinding {
        self.state.borrow().clone()
    }

    pub fn is_context_set(&self) -> bool {
        self.state.borrow().is_context_set
    }

    /// Bind this connection to `tenant_id` with a fresh session token.
    ///
    /// On failure the previous binding is discarded too: after `false`
    /// the connection must be treated as unscoped.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn set_tenant_context(&self, tenant_id: &TenantId) -> bool {
        let _op = self.op_lock.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        if !self.auth.borrow().is_authenticated() {
            warn!("Cannot bind tenant context without a session");
            self.fail(tenant_id, NOT_AUTHENTICATED.to_string());
            return false;
        }

        let token = SessionToken::generate();
        let result = self.procedures.bind(tenant_id, &token).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Tenant context cleared during bind, discarding result");
            return false;
        }

        match result {
            Ok(context_id) => {
                info!(context_id = %context_id, "Tenant context bound");
                self.replace(TenantContextBinding::bound(tenant_id.clone(), token, context_id));
                self.events.emit(&TenancyEvent::ContextBound {
                    tenant_id: tenant_id.clone(),
                });
                true
            }
            Err(e) => {
                let err = TenancyError::normalize(e);
                warn!(error = %err, "Tenant context bind failed");
                self.fail(tenant_id, err.message);
                false
            }
        }
    }

    /// Extend the current binding. A rejection or an error unbinds locally.
    #[instrument(skip(self))]
    pub async fn refresh_tenant_context(&self) -> bool {
        let _op = self.op_lock.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        let current = self.state();
        let Some(tenant_id) = current.current_tenant_id.filter(|_| current.is_context_set) else {
            return false;
        };
        if !self.auth.borrow().is_authenticated() {
            return false;
        }

        let result = self.procedures.refresh().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }

        let error = match result {
            Ok(true) => {
                debug!(tenant_id = %tenant_id, "Tenant context refreshed");
                return true;
            }
            Ok(false) => CONTEXT_EXPIRED.to_string(),
            Err(e) => TenancyError::normalize(e).message,
        };
        warn!(tenant_id = %tenant_id, error = %error, "Tenant context refresh failed, unbinding");
        self.fail(&tenant_id, error);
        false
    }

    /// Forget the local binding. No server call.
    pub fn clear_tenant_context(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.replace(TenantContextBinding::default()) {
            debug!("Tenant context cleared");
            self.events.emit(&TenancyEvent::ContextCleared);
        }
    }

    /// Ask the server which tenant it believes is bound.
    pub async fn get_current_tenant_id(&self) -> Option<TenantId> {
        match self.procedures.current().await {
            Ok(tenant) => tenant,
            Err(e) => {
                debug!(error = %TenancyError::normalize(e), "Current tenant query failed");
                None
            }
        }
    }

    fn fail(&self, tenant_id: &TenantId, error: String) {
        self.replace(TenantContextBinding::failed(error.clone()));
        self.events.emit(&TenancyEvent::ContextBindFailed {
            tenant_id: tenant_id.clone(),
            error,
        });
    }

    fn replace(&self, next: TenantContextBinding) -> bool {
        self.state.send_if_modified(|s| {
            let changed = *s != next;
            *s = next;
            changed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{Failure, MemoryContextProcedures};
    use chrono::Utc;
    use tenancy_core::{Session, User};

    fn auth(signed_in: bool) -> watch::Sender<SessionState> {
        let session = Session::new(User::new("u-1"), "token", Utc::now() + chrono::Duration::hours(1));
        let (tx, _) = watch::channel(SessionState {
            user: signed_in.then(|| session.user.clone()),
            session: signed_in.then_some(session),
            loading: false,
            error: None,
            is_connected: true,
            sign_ins: 1,
        });
        tx
    }

    fn setter(procedures: Arc<MemoryContextProcedures>, auth: &watch::Sender<SessionState>) -> TenantContextSetter {
        TenantContextSetter::new(procedures, auth.subscribe(), Arc::new(TenancyEventHub::new()))
    }

    #[tokio::test]
    async fn bind_requires_a_session() {
        let procedures = Arc::new(MemoryContextProcedures::new());
        let auth = auth(false);
        let setter = setter(procedures.clone(), &auth);

        assert!(!setter.set_tenant_context(&TenantId::from("a")).await);
        let state = setter.state();
        assert_eq!(state.error.as_deref(), Some(NOT_AUTHENTICATED));
        assert!(!state.is_context_set);
        assert_eq!(procedures.bind_count(), 0);
    }

    #[tokio::test]
    async fn successful_bind_stores_token_and_context() {
        let procedures = Arc::new(MemoryContextProcedures::new());
        let auth = auth(true);
        let setter = setter(procedures.clone(), &auth);

        assert!(setter.set_tenant_context(&TenantId::from("a")).await);
        let state = setter.state();
        assert!(state.is_context_set);
        assert_eq!(state.current_tenant_id, Some(TenantId::from("a")));
        assert!(state.session_token.is_some());
        assert!(state.context_id.is_some());
        assert_eq!(setter.get_current_tenant_id().await, Some(TenantId::from("a")));
    }

    #[tokio::test]
    async fn failed_bind_discards_previous_binding() {
        let procedures = Arc::new(MemoryContextProcedures::new());
        let auth = auth(true);
        let setter = setter(procedures.clone(), &auth);
        assert!(setter.set_tenant_context(&TenantId::from("a")).await);

        procedures.fail_next_bind(Failure::unavailable("rpc timed out"));
        assert!(!setter.set_tenant_context(&TenantId::from("b")).await);

        let state = setter.state();
        assert!(!state.is_context_set);
        assert_eq!(state.current_tenant_id, None);
        assert_eq!(state.error.as_deref(), Some("rpc timed out"));
    }

    #[tokio::test]
    async fn refresh_rejection_unbinds() {
        let procedures = Arc::new(MemoryContextProcedures::new());
        let auth = auth(true);
        let setter = setter(procedures.clone(), &auth);

        assert!(!setter.refresh_tenant_context().await);

        assert!(setter.set_tenant_context(&TenantId::from("a")).await);
        let token = setter.state().session_token;
        assert!(setter.refresh_tenant_context().await);
        assert_eq!(setter.state().session_token, token);

        procedures.reject_next_refresh();
        assert!(!setter.refresh_tenant_context().await);
        assert!(!setter.is_context_set());
        assert_eq!(setter.state().error.as_deref(), Some(CONTEXT_EXPIRED));
    }

    #[tokio::test]
    async fn clear_during_bind_wins() {
        let procedures = Arc::new(MemoryContextProcedures::new());
        let auth = auth(true);
        let setter = Arc::new(setter(procedures.clone(), &auth));
        procedures.hold_binds();

        let binding = {
            let setter = setter.clone();
            tokio::spawn(async move { setter.set_tenant_context(&TenantId::from("a")).await })
        };
        while procedures.bind_count() == 0 {
            tokio::task::yield_now().await;
        }
        setter.clear_tenant_context();
        procedures.release_binds();

        assert!(!binding.await.unwrap());
        assert_eq!(setter.state(), TenantContextBinding::default());
    }

    #[tokio::test]
    async fn current_tenant_is_none_on_error() {
        let procedures = Arc::new(MemoryContextProcedures::new());
        let auth = auth(true);
        let setter = setter(procedures.clone(), &auth);
        assert!(setter.set_tenant_context(&TenantId::from("a")).await);

        procedures.fail_next_current(Failure::unavailable("down"));
        assert_eq!(setter.get_current_tenant_id().await, None);
    }
}
