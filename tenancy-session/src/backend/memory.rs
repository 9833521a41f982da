use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tenancy_core::{
    AuthStateChange, ErrorKind, Session, SessionToken, TenancyError, TenancyResult, TenantId, TenantMembership,
    UserId,
};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::provider::{AuthProvider, ContextProcedures, MembershipSource};

/// A scripted failure returned by one of the in-memory boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    /// Raise a plain `anyhow` error instead of a `TenancyError`.
    pub unexpected: bool,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            unexpected: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn not_authenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAuthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn jwt_expired() -> Self {
        Self::new(ErrorKind::GeneralError, "JWT expired").with_code("PGRST301")
    }

    pub fn permission_denied(relation: &str) -> Self {
        Self::new(ErrorKind::GeneralError, format!("permission denied for table {relation}")).with_code("42501")
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self {
            unexpected: true,
            ..Self::new(ErrorKind::GeneralError, message)
        }
    }

    pub fn into_error(self) -> anyhow::Error {
        if self.unexpected {
            return anyhow::anyhow!(self.message);
        }
        let mut err = TenancyError::new(self.kind, self.message);
        if let Some(code) = self.code {
            err = err.with_code(code);
        }
        err.into_anyhow()
    }
}

#[derive(Default)]
struct FailureScript(Mutex<VecDeque<Failure>>);

impl FailureScript {
    fn push(&self, failure: Failure, times: usize) {
        let mut queue = self.0.lock();
        queue.extend(std::iter::repeat(failure).take(times));
    }

    fn take(&self) -> TenancyResult<()> {
        match self.0.lock().pop_front() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }
}

/// Open/closed latch used to hold calls until a test releases them.
struct Gate(watch::Sender<bool>);

impl Gate {
    fn open() -> Self {
        let (tx, _) = watch::channel(true);
        Self(tx)
    }

    fn set(&self, open: bool) {
        self.0.send_replace(open);
    }

    async fn pass(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// In-memory auth provider for testing and development
pub struct MemoryAuthProvider {
    session: RwLock<Option<Session>>,
    get_failures: FailureScript,
    refresh_failures: FailureScript,
    get_delay: Mutex<Option<Duration>>,
    events: broadcast::Sender<AuthStateChange>,
    clear_count: AtomicUsize,
}

impl Default for MemoryAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuthProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            session: RwLock::new(None),
            get_failures: FailureScript::default(),
            refresh_failures: FailureScript::default(),
            get_delay: Mutex::new(None),
            events,
            clear_count: AtomicUsize::new(0),
        }
    }

    /// Start with a cached session, as if restored from storage.
    pub fn with_session(self, session: Session) -> Self {
        *self.session.write() = Some(session);
        self
    }

    pub fn current(&self) -> Option<Session> {
        self.session.read().clone()
    }

    pub fn sign_in(&self, session: Session) {
        *self.session.write() = Some(session.clone());
        self.emit(AuthStateChange::signed_in(session));
    }

    pub fn sign_out(&self) {
        self.session.write().take();
        self.emit(AuthStateChange::signed_out());
    }

    /// Rotate the access token of the current session and announce it.
    pub fn refresh_token(&self) -> Option<Session> {
        let refreshed = self.rotate()?;
        self.emit(AuthStateChange::token_refreshed(refreshed.clone()));
        Some(refreshed)
    }

    /// Push an arbitrary change without touching the stored session.
    pub fn emit(&self, change: AuthStateChange) {
        let _ = self.events.send(change);
    }

    pub fn fail_next_get_session(&self, failure: Failure) {
        self.get_failures.push(failure, 1);
    }

    pub fn fail_next_refresh(&self, failure: Failure) {
        self.refresh_failures.push(failure, 1);
    }

    /// Make `get_session` take this long, to race it against pushed events.
    pub fn delay_get_session(&self, delay: Duration) {
        *self.get_delay.lock() = Some(delay);
    }

    pub fn clear_count(&self) -> usize {
        self.clear_count.load(Ordering::SeqCst)
    }

    fn rotate(&self) -> Option<Session> {
        let mut guard = self.session.write();
        let session = guard.as_mut()?;
        session.access_token = format!("access-{}", Uuid::new_v4());
        session.expires_at = Utc::now() + chrono::Duration::hours(1);
        Some(session.clone())
    }
}

#[async_trait]
impl AuthProvider for MemoryAuthProvider {
    async fn get_session(&self) -> TenancyResult<Option<Session>> {
        let delay = *self.get_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.get_failures.take()?;
        Ok(self.current())
    }

    async fn refresh_session(&self) -> TenancyResult<Session> {
        self.refresh_failures.take()?;
        match self.rotate() {
            Some(session) => {
                self.emit(AuthStateChange::token_refreshed(session.clone()));
                Ok(session)
            }
            None => Err(TenancyError::not_authenticated("Auth session missing!").into_anyhow()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthStateChange> {
        self.events.subscribe()
    }

    async fn clear_local_session(&self) {
        self.session.write().take();
        self.clear_count.fetch_add(1, Ordering::SeqCst);
    }
}

struct MembershipRow {
    membership: TenantMembership,
    active: bool,
}

/// Decrements the concurrency counter even when the call is dropped mid-wait.
struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory membership table with scripted failures and a call log.
pub struct MemoryMembershipSource {
    rows: RwLock<HashMap<UserId, Vec<MembershipRow>>>,
    failures: FailureScript,
    gate: Gate,
    calls: Mutex<Vec<Instant>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for MemoryMembershipSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMembershipSource {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            failures: FailureScript::default(),
            gate: Gate::open(),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn add_membership(&self, user_id: impl Into<UserId>, membership: TenantMembership) {
        self.insert(user_id.into(), membership, true);
    }

    /// Stored but filtered out of every listing.
    pub fn add_inactive_membership(&self, user_id: impl Into<UserId>, membership: TenantMembership) {
        self.insert(user_id.into(), membership, false);
    }

    pub fn remove_membership(&self, user_id: &UserId, tenant_id: &TenantId) {
        if let Some(rows) = self.rows.write().get_mut(user_id) {
            rows.retain(|r| &r.membership.tenant_id != tenant_id);
        }
    }

    pub fn fail_next(&self, failure: Failure) {
        self.failures.push(failure, 1);
    }

    pub fn fail_times(&self, times: usize, failure: Failure) {
        self.failures.push(failure, times);
    }

    /// Block every call until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.set(false);
    }

    pub fn release(&self) {
        self.gate.set(true);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Start instants of every call, in order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }

    /// Highest number of calls observed outstanding at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn insert(&self, user_id: UserId, membership: TenantMembership, active: bool) {
        self.rows
            .write()
            .entry(user_id)
            .or_default()
            .push(MembershipRow { membership, active });
    }
}

#[async_trait]
impl MembershipSource for MemoryMembershipSource {
    async fn list_memberships(&self, user_id: &UserId) -> TenancyResult<Vec<TenantMembership>> {
        self.calls.lock().push(Instant::now());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _call = ActiveCall(&self.active);

        self.gate.pass().await;
        self.failures.take()?;

        let mut memberships: Vec<TenantMembership> = self
            .rows
            .read()
            .get(user_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.active)
                    .map(|r| r.membership.clone())
                    .collect()
            })
            .unwrap_or_default();
        memberships.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(memberships)
    }
}

/// In-memory stand-in for the server-side context procedures.
pub struct MemoryContextProcedures {
    bound: Mutex<Option<(TenantId, String)>>,
    allowed: RwLock<Option<HashSet<TenantId>>>,
    bind_failures: FailureScript,
    refresh_failures: FailureScript,
    current_failures: FailureScript,
    refresh_rejections: AtomicUsize,
    bind_gate: Gate,
    bind_count: AtomicUsize,
}

impl Default for MemoryContextProcedures {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContextProcedures {
    pub fn new() -> Self {
        Self {
            bound: Mutex::new(None),
            allowed: RwLock::new(None),
            bind_failures: FailureScript::default(),
            refresh_failures: FailureScript::default(),
            current_failures: FailureScript::default(),
            refresh_rejections: AtomicUsize::new(0),
            bind_gate: Gate::open(),
            bind_count: AtomicUsize::new(0),
        }
    }

    /// Only these tenants may be bound; everything else is refused with 42501.
    pub fn allow_only<I, T>(&self, tenants: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<TenantId>,
    {
        *self.allowed.write() = Some(tenants.into_iter().map(Into::into).collect());
    }

    pub fn fail_next_bind(&self, failure: Failure) {
        self.bind_failures.push(failure, 1);
    }

    pub fn fail_next_refresh(&self, failure: Failure) {
        self.refresh_failures.push(failure, 1);
    }

    pub fn fail_next_current(&self, failure: Failure) {
        self.current_failures.push(failure, 1);
    }

    /// Answer the next refresh with `Ok(false)` and drop the server binding.
    pub fn reject_next_refresh(&self) {
        self.refresh_rejections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn hold_binds(&self) {
        self.bind_gate.set(false);
    }

    pub fn release_binds(&self) {
        self.bind_gate.set(true);
    }

    pub fn bound_tenant(&self) -> Option<TenantId> {
        self.bound.lock().as_ref().map(|(tenant, _)| tenant.clone())
    }

    pub fn bind_count(&self) -> usize {
        self.bind_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextProcedures for MemoryContextProcedures {
    async fn bind(&self, tenant_id: &TenantId, _session_token: &SessionToken) -> TenancyResult<String> {
        self.bind_count.fetch_add(1, Ordering::SeqCst);
        self.bind_gate.pass().await;
        self.bind_failures.take()?;

        let permitted = self
            .allowed
            .read()
            .as_ref()
            .map_or(true, |allowed| allowed.contains(tenant_id));
        if !permitted {
            return Err(TenancyError::forbidden(format!("permission denied for tenant {tenant_id}"))
                .with_code("42501")
                .into_anyhow());
        }

        let context_id = Uuid::new_v4().to_string();
        *self.bound.lock() = Some((tenant_id.clone(), context_id.clone()));
        Ok(context_id)
    }

    async fn refresh(&self) -> TenancyResult<bool> {
        self.refresh_failures.take()?;
        let rejected = self
            .refresh_rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            self.bound.lock().take();
            return Ok(false);
        }
        Ok(self.bound.lock().is_some())
    }

    async fn current(&self) -> TenancyResult<Option<TenantId>> {
        self.current_failures.take()?;
        Ok(self.bound_tenant())
    }
}
