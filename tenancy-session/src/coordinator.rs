//! # TenantSession
//!
//! Composition root for the four session components. It owns one of each,
//! shares a single [`TenancyEventHub`] between them, and runs a driver task
//! that turns auth and fetch state changes into follow-up work:
//!
//! - a new signed-in identity, or a repeated sign-in, triggers a tenant fetch
//!   (token refreshes don't)
//! - losing the session clears tenants, selection and context binding
//! - auth recovering from an error retries a failed fetch after a debounce
//! - an auth failure that outlives the grace period raises `needs_recovery`
//! - every fetched membership set is reconciled into the selection
//!
//! The driver never binds a tenant context; callers opt in through
//! [`TenantSession::set_tenant_context`] or [`TenantSession::switch_and_bind`].

use std::sync::Arc;

use parking_lot::Mutex;
use tenancy_core::{
    bail_tenancy, ActiveTenantSelection, TenancyEvent, TenancyEventHub, TenancyResult, TenantContextBinding,
    TenantId, TenantMembership, UserId,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::binding::TenantContextSetter;
use crate::fetcher::{FetchState, TenantFetcher};
use crate::options::SessionOptions;
use crate::provider::{AuthProvider, ContextProcedures, MembershipSource};
use crate::selector::TenantSelector;
use crate::tracker::{SessionState, SessionTracker};

/// Everything a caller needs to render the tenancy state at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantSessionSnapshot {
    pub session: SessionState,
    pub tenants: FetchState,
    pub selection: ActiveTenantSelection,
    pub context: TenantContextBinding,
    /// Auth has been failing for longer than the grace period.
    pub needs_recovery: bool,
}

struct SessionInner {
    options: SessionOptions,
    events: Arc<TenancyEventHub>,
    tracker: SessionTracker,
    fetcher: TenantFetcher,
    selector: Arc<TenantSelector>,
    context: Arc<TenantContextSetter>,
    needs_recovery: Arc<watch::Sender<bool>>,
}

pub struct TenantSession {
    inner: Arc<SessionInner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TenantSession {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        memberships: Arc<dyn MembershipSource>,
        procedures: Arc<dyn ContextProcedures>,
        options: SessionOptions,
    ) -> TenancyResult<Self> {
        if let Err(e) = options.validate() {
            bail_tenancy!(bad_request, "Invalid session options: {}", e);
        }

        let events = Arc::new(TenancyEventHub::new());
        let tracker = SessionTracker::new(auth, events.clone());
        let fetcher = TenantFetcher::new(memberships, tracker.subscribe(), options.retry.clone(), events.clone());
        let selector = Arc::new(TenantSelector::new(events.clone()));
        let context = Arc::new(TenantContextSetter::new(procedures, tracker.subscribe(), events.clone()));
        let (needs_recovery, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(SessionInner {
                options,
                events,
                tracker,
                fetcher,
                selector,
                context,
                needs_recovery: Arc::new(needs_recovery),
            }),
            driver: Mutex::new(None),
        })
    }

    /// Spawn the driver, then attach the tracker to the provider and pull
    /// the current session. Calling it twice is a no-op.
    pub async fn start(&self) {
        {
            let mut driver = self.driver.lock();
            if driver.as_ref().is_some_and(|h| !h.is_finished()) {
                debug!("Tenant session already started");
                return;
            }
            let state = Driver::new(&self.inner);
            let auth_rx = self.inner.tracker.subscribe();
            let fetch_rx = self.inner.fetcher.subscribe();
            *driver = Some(tokio::spawn(state.run(auth_rx, fetch_rx)));
        }
        self.inner.tracker.start().await;
        info!("Tenant session started");
    }

    /// Stop the driver, the provider listener and any pending fetch work.
    /// Component state is left as it was.
    pub fn shutdown(&self) {
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.abort();
        }
        self.inner.tracker.stop();
        self.inner.fetcher.cancel();
        info!("Tenant session stopped");
    }

    pub fn snapshot(&self) -> TenantSessionSnapshot {
        TenantSessionSnapshot {
            session: self.inner.tracker.state(),
            tenants: self.inner.fetcher.state(),
            selection: self.inner.selector.current(),
            context: self.inner.context.state(),
            needs_recovery: *self.inner.needs_recovery.borrow(),
        }
    }

    pub fn events(&self) -> &TenancyEventHub {
        &self.inner.events
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.inner.tracker
    }

    pub fn fetcher(&self) -> &TenantFetcher {
        &self.inner.fetcher
    }

    pub fn selector(&self) -> &TenantSelector {
        &self.inner.selector
    }

    pub fn context(&self) -> &TenantContextSetter {
        &self.inner.context
    }

    pub fn subscribe_needs_recovery(&self) -> watch::Receiver<bool> {
        self.inner.needs_recovery.subscribe()
    }

    pub fn available_tenants(&self) -> Vec<TenantMembership> {
        self.inner.fetcher.state().available_tenants
    }

    pub fn active_tenant(&self) -> ActiveTenantSelection {
        self.inner.selector.current()
    }

    pub async fn fetch_user_tenants(&self) {
        self.inner.fetcher.fetch_user_tenants().await;
    }

    pub async fn force_session_recovery(&self) -> bool {
        self.inner.tracker.force_session_recovery().await
    }

    pub fn switch_tenant(&self, tenant_id: &TenantId) -> TenancyResult<ActiveTenantSelection> {
        self.inner.selector.switch_tenant(tenant_id)
    }

    pub async fn set_tenant_context(&self, tenant_id: &TenantId) -> bool {
        self.inner.context.set_tenant_context(tenant_id).await
    }

    pub async fn refresh_tenant_context(&self) -> bool {
        self.inner.context.refresh_tenant_context().await
    }

    pub fn clear_tenant_context(&self) {
        self.inner.context.clear_tenant_context();
    }

    pub async fn get_current_tenant_id(&self) -> Option<TenantId> {
        self.inner.context.get_current_tenant_id().await
    }

    /// Switch the active tenant and bind the connection to it.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn switch_and_bind(&self, tenant_id: &TenantId) -> bool {
        if let Err(e) = self.inner.selector.switch_tenant(tenant_id) {
            warn!(error = %e, "Tenant switch rejected");
            return false;
        }
        self.inner.context.set_tenant_context(tenant_id).await
    }
}

impl Drop for TenantSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
        self.inner.tracker.stop();
        self.inner.fetcher.cancel();
    }
}

/// State owned by the driver task. Timer tasks get clones of the
/// components they touch, never the session itself.
struct Driver {
    options: SessionOptions,
    events: Arc<TenancyEventHub>,
    fetcher: TenantFetcher,
    selector: Arc<TenantSelector>,
    context: Arc<TenantContextSetter>,
    needs_recovery: Arc<watch::Sender<bool>>,
    last_user: Option<UserId>,
    last_sign_ins: u64,
    had_session: bool,
    auth_errored: bool,
    last_tenants: Vec<TenantMembership>,
    recovery: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.cancel_recovery();
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
    }
}

impl Driver {
    fn new(inner: &SessionInner) -> Self {
        Self {
            options: inner.options.clone(),
            events: inner.events.clone(),
            fetcher: inner.fetcher.clone(),
            selector: inner.selector.clone(),
            context: inner.context.clone(),
            needs_recovery: inner.needs_recovery.clone(),
            last_user: None,
            last_sign_ins: 0,
            had_session: false,
            auth_errored: false,
            last_tenants: Vec::new(),
            recovery: None,
            grace: None,
        }
    }

    async fn run(mut self, mut auth_rx: watch::Receiver<SessionState>, mut fetch_rx: watch::Receiver<FetchState>) {
        let auth = auth_rx.borrow_and_update().clone();
        self.on_auth(auth).await;
        let tenants = fetch_rx.borrow_and_update().clone();
        self.on_fetch(tenants);

        loop {
            tokio::select! {
                changed = auth_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let auth = auth_rx.borrow_and_update().clone();
                    self.on_auth(auth).await;
                }
                changed = fetch_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let tenants = fetch_rx.borrow_and_update().clone();
                    self.on_fetch(tenants);
                }
            }
        }
        debug!("Tenant session driver exiting");
    }

    async fn on_auth(&mut self, auth: SessionState) {
        if auth.loading {
            return;
        }
        let user = auth.user_id().cloned();
        let had_session = std::mem::replace(&mut self.had_session, user.is_some());
        let signed_in_again = std::mem::replace(&mut self.last_sign_ins, auth.sign_ins) != auth.sign_ins;

        if let Some(error) = auth.error {
            self.cancel_recovery();
            self.auth_errored = true;
            if had_session && user.is_none() {
                self.clear_all();
            }
            // Runs the fetcher's auth guard only; returns without querying.
            self.fetcher.fetch_user_tenants().await;
            self.arm_grace(error);
            return;
        }

        let recovered = std::mem::take(&mut self.auth_errored);
        match user {
            None => {
                self.cancel_recovery();
                self.disarm_grace();
                if had_session || self.last_user.is_some() {
                    info!("Session ended, clearing tenant state");
                    self.clear_all();
                }
                self.last_user = None;
            }
            Some(user) if self.last_user.as_ref() != Some(&user) => {
                debug!(user_id = %user, "New identity, fetching tenants");
                self.last_user = Some(user);
                self.cancel_recovery();
                self.spawn_refetch();
            }
            Some(user) if signed_in_again => {
                debug!(user_id = %user, "Signed in again, refetching tenants");
                self.cancel_recovery();
                self.spawn_refetch();
            }
            Some(_) => {
                let tenants = self.fetcher.state();
                if recovered && (tenants.error.is_some() || tenants.auth_required) {
                    self.schedule_recovery();
                }
                if !tenants.auth_required {
                    self.disarm_grace();
                }
            }
        }
    }

    fn on_fetch(&mut self, tenants: FetchState) {
        if tenants.available_tenants != self.last_tenants {
            self.selector.apply(&tenants.available_tenants);
            self.last_tenants = tenants.available_tenants;
        }

        if tenants.auth_required {
            if let Some(error) = tenants.error {
                self.arm_grace(error);
            }
        } else if !self.auth_errored && !tenants.is_loading {
            self.disarm_grace();
        }
    }

    fn clear_all(&mut self) {
        self.fetcher.reset();
        self.selector.clear();
        self.context.clear_tenant_context();
        self.last_tenants.clear();
        self.disarm_grace();
    }

    fn spawn_refetch(&self) {
        let fetcher = self.fetcher.clone();
        tokio::spawn(async move { fetcher.refetch().await });
    }

    fn schedule_recovery(&mut self) {
        self.cancel_recovery();
        let fetcher = self.fetcher.clone();
        let debounce = self.options.recovery_debounce;
        debug!(debounce_ms = debounce.as_millis() as u64, "Auth recovered, scheduling tenant refetch");
        self.recovery = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            fetcher.fetch_user_tenants().await;
        }));
    }

    fn cancel_recovery(&mut self) {
        if let Some(recovery) = self.recovery.take() {
            recovery.abort();
        }
    }

    /// Start the grace timer unless one is already running or has fired.
    fn arm_grace(&mut self, error: String) {
        if self.grace.is_some() {
            return;
        }
        let needs_recovery = self.needs_recovery.clone();
        let events = self.events.clone();
        let grace = self.options.auth_grace_period;
        self.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            warn!(error = %error, "Auth failure outlived grace period, recovery needed");
            needs_recovery.send_replace(true);
            events.emit(&TenancyEvent::RecoveryNeeded { error });
        }));
    }

    fn disarm_grace(&mut self) {
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
        self.needs_recovery
            .send_if_modified(|needed| std::mem::replace(needed, false));
    }
}
