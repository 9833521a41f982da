//! Tenant fetcher: loads the signed-in user's memberships.
//!
//! One logical fetch is a chain of at most `max_retries + 1` attempts.
//! Every attempt re-runs the auth guards, holds the single-flight flag
//! only while its query is outstanding, and owns a fresh cancellation
//! token. Retries are spawned timer tasks that re-enter the guarded entry
//! point, so they are strictly sequential and individually abortable.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tenancy_core::{TenancyError, TenancyEvent, TenancyEventHub, TenantMembership, UserId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::options::RetryPolicy;
use crate::provider::MembershipSource;
use crate::tracker::SessionState;

pub const AUTH_REQUIRED: &str = "Authentication required";
pub const UNEXPECTED_FAILURE: &str = "An unexpected error occurred while loading your organizations";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchState {
    pub available_tenants: Vec<TenantMembership>,
    pub is_loading: bool,
    pub error: Option<String>,
    /// The current error is an auth/permission failure; retrying won't help.
    pub auth_required: bool,
    /// 0-indexed attempt number of the most recent attempt.
    pub retry_count: u32,
}

impl FetchState {
    fn cleared(error: Option<String>, auth_required: bool) -> Self {
        Self {
            error,
            auth_required,
            ..Self::default()
        }
    }
}

enum AttemptOutcome {
    Done,
    Retry { next: u32, delay: Duration },
}

struct FetcherInner {
    source: Arc<dyn MembershipSource>,
    auth: watch::Receiver<SessionState>,
    policy: RetryPolicy,
    state: watch::Sender<FetchState>,
    events: Arc<TenancyEventHub>,
    /// Single-flight flag. A `watch` so `refetch` can wait for it to drop.
    in_flight: watch::Sender<bool>,
    current: Mutex<Option<CancellationToken>>,
    pending_retry: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the single-flight flag and the loading flag on every exit path,
/// including the attempt's future being dropped.
struct InFlightGuard<'a> {
    inner: &'a FetcherInner,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.send_replace(false);
        self.inner
            .state
            .send_if_modified(|s| std::mem::replace(&mut s.is_loading, false));
    }
}

#[derive(Clone)]
pub struct TenantFetcher {
    inner: Arc<FetcherInner>,
}

impl TenantFetcher {
    pub fn new(
        source: Arc<dyn MembershipSource>,
        auth: watch::Receiver<SessionState>,
        policy: RetryPolicy,
        events: Arc<TenancyEventHub>,
    ) -> Self {
        let (state, _) = watch::channel(FetchState::default());
        let (in_flight, _) = watch::channel(false);
        Self {
            inner: Arc::new(FetcherInner {
                source,
                auth,
                policy,
                state,
                events,
                in_flight,
                current: Mutex::new(None),
                pending_retry: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> FetchState {
        self.inner.state.borrow().clone()
    }

    pub fn is_in_flight(&self) -> bool {
        *self.inner.in_flight.borrow()
    }

    pub fn has_pending_retry(&self) -> bool {
        self.inner
            .pending_retry
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Start a logical fetch and wait for its first attempt.
    ///
    /// Dropped silently while another attempt is in flight. Retries, if
    /// any, continue in the background.
    pub async fn fetch_user_tenants(&self) {
        self.inner.clone().run(0).await;
    }

    /// Abort whatever is running, wait for the aborted attempt to release
    /// the single-flight flag, then start a fresh logical fetch for the
    /// current user.
    pub async fn refetch(&self) {
        self.inner.cancel();
        // `reset` and the auth guard clear `is_loading` before the aborted
        // attempt unwinds; only the flag itself is reliable.
        let mut busy = self.inner.in_flight.subscribe();
        let _ = busy.wait_for(|in_flight| !*in_flight).await;
        self.fetch_user_tenants().await;
    }

    /// Abort the in-flight attempt and any scheduled retry.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Cancel everything and forget the fetched tenants.
    pub fn reset(&self) {
        self.inner.cancel();
        self.inner.state.send_if_modified(|s| {
            let cleared = FetchState::default();
            let changed = *s != cleared;
            *s = cleared;
            changed
        });
    }
}

impl FetcherInner {
    fn run_boxed(self: Arc<Self>, retry_count: u32) -> BoxFuture<'static, ()> {
        self.run(retry_count).boxed()
    }

    async fn run(self: Arc<Self>, retry_count: u32) {
        if let AttemptOutcome::Retry { next, delay } = self.attempt(retry_count).await {
            self.schedule_retry(next, delay);
        }
    }

    #[instrument(skip(self))]
    async fn attempt(&self, retry_count: u32) -> AttemptOutcome {
        let auth = self.auth.borrow().clone();

        if auth.loading {
            debug!("Auth still loading, deferring tenant fetch");
            return AttemptOutcome::Done;
        }
        if auth.error.is_some() {
            self.cancel();
            self.replace_state(FetchState::cleared(Some(AUTH_REQUIRED.to_string()), true));
            return AttemptOutcome::Done;
        }
        let Some(user_id) = auth.user_id().cloned() else {
            self.cancel();
            self.replace_state(FetchState::default());
            return AttemptOutcome::Done;
        };

        let acquired = self.in_flight.send_if_modified(|busy| !std::mem::replace(busy, true));
        if !acquired {
            debug!("Tenant fetch already in flight, dropping request");
            return AttemptOutcome::Done;
        }
        let _guard = InFlightGuard { inner: self };

        if retry_count == 0 {
            // A fresh logical fetch supersedes a scheduled retry.
            self.abort_pending_retry();
        }

        let token = CancellationToken::new();
        let previous = self.current.lock().replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        self.state.send_modify(|s| {
            s.is_loading = true;
            s.retry_count = retry_count;
        });

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(TenancyError::aborted("Tenant fetch superseded").into_anyhow()),
            r = self.source.list_memberships(&user_id) => r,
        };

        if token.is_cancelled() {
            debug!("Tenant fetch aborted");
            return AttemptOutcome::Done;
        }
        let still_current = {
            let auth = self.auth.borrow();
            auth.error.is_none() && auth.user_id() == Some(&user_id)
        };
        if !still_current {
            debug!(user_id = %user_id, "Session changed during tenant fetch, discarding result");
            return AttemptOutcome::Done;
        }

        match result {
            Ok(tenants) => {
                info!(user_id = %user_id, count = tenants.len(), "Loaded tenant memberships");
                let count = tenants.len();
                self.state.send_modify(|s| {
                    s.available_tenants = tenants;
                    s.error = None;
                    s.auth_required = false;
                });
                self.events.emit(&TenancyEvent::TenantsLoaded { user_id, count });
                AttemptOutcome::Done
            }
            Err(e) => {
                let unexpected = TenancyError::from_anyhow(&e).is_none();
                let err = TenancyError::normalize(e);
                self.on_failure(&user_id, retry_count, err, unexpected)
            }
        }
    }

    fn on_failure(&self, user_id: &UserId, retry_count: u32, err: TenancyError, unexpected: bool) -> AttemptOutcome {
        if err.is_aborted() {
            debug!("Tenant fetch aborted by source");
            return AttemptOutcome::Done;
        }

        if err.is_auth_failure() {
            warn!(user_id = %user_id, error = %err, "Tenant fetch rejected, not retrying");
            let message = format!("{}: {}", AUTH_REQUIRED, err.message);
            self.replace_state(FetchState::cleared(Some(message.clone()), true));
            self.events.emit(&TenancyEvent::FetchFailed { error: message });
            return AttemptOutcome::Done;
        }

        if self.policy.should_retry(retry_count) {
            let delay = self.policy.delay_for(retry_count);
            warn!(
                user_id = %user_id,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Tenant fetch failed, scheduling retry"
            );
            self.events.emit(&TenancyEvent::FetchRetryScheduled {
                retry_count: retry_count + 1,
                delay_ms: delay.as_millis() as u64,
                error: err.message.clone(),
            });
            return AttemptOutcome::Retry {
                next: retry_count + 1,
                delay,
            };
        }

        let message = if unexpected {
            UNEXPECTED_FAILURE.to_string()
        } else {
            format!(
                "Failed to load organizations after {} attempts: {}",
                retry_count + 1,
                err.message
            )
        };
        warn!(user_id = %user_id, error = %err, "Tenant fetch failed, giving up");
        self.state.send_modify(|s| {
            s.error = Some(message.clone());
            s.auth_required = false;
        });
        self.events.emit(&TenancyEvent::FetchFailed { error: message });
        AttemptOutcome::Done
    }

    fn schedule_retry(self: Arc<Self>, next: u32, delay: Duration) {
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detach before re-entering so a superseding fetch can't abort us mid-attempt.
            inner.pending_retry.lock().take();
            inner.run_boxed(next).await;
        });
        let previous = self.pending_retry.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn abort_pending_retry(&self) {
        let pending = self.pending_retry.lock().take();
        if let Some(pending) = pending {
            pending.abort();
        }
    }

    fn cancel(&self) {
        let token = self.current.lock().take();
        if let Some(token) = token {
            token.cancel();
        }
        self.abort_pending_retry();
    }

    fn replace_state(&self, next: FetchState) {
        self.state.send_if_modified(|s| {
            let changed = *s != next;
            *s = next;
            changed
        });
    }
}
