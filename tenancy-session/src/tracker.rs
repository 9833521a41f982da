//! Session tracker: mirrors the auth provider's state into an observable value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tenancy_core::{
    AuthChangeKind, AuthStateChange, Session, TenancyError, TenancyEvent, TenancyEventHub, User, UserId,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::provider::AuthProvider;

/// Provider messages that mean the cached session can never be revived.
const DEAD_SESSION_MARKERS: &[&str] = &[
    "invalid refresh token",
    "refresh token not found",
    "refresh_token_not_found",
    "session_not_found",
    "session not found",
    "auth session missing",
    "invalid session",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub user: Option<User>,
    pub session: Option<Session>,
    pub loading: bool,
    pub error: Option<String>,
    pub is_connected: bool,
    /// Explicit sign-ins applied so far. Moves even when the same user signs
    /// in again; token refreshes leave it alone.
    pub sign_ins: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            user: None,
            session: None,
            loading: true,
            error: None,
            is_connected: false,
            sign_ins: 0,
        }
    }
}

impl SessionState {
    pub fn user_id(&self) -> Option<&UserId> {
        match (&self.user, &self.session) {
            (Some(user), Some(_)) => Some(&user.id),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id().is_some()
    }

    /// Loading finished, whatever the outcome.
    pub fn is_settled(&self) -> bool {
        !self.loading
    }
}

pub(crate) fn indicates_dead_session(err: &TenancyError) -> bool {
    let lower = err.message.to_lowercase();
    DEAD_SESSION_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_transport_failure(err: &TenancyError) -> bool {
    err.kind.is_transient()
}

struct TrackerInner {
    provider: Arc<dyn AuthProvider>,
    state: watch::Sender<SessionState>,
    events: Arc<TenancyEventHub>,
    /// Bumped by every pushed event; a pull that started before a push is stale.
    epoch: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Tracks the provider's user/session and exposes them as a `watch` value.
///
/// Pushed events and the initial pull both land in [`apply_session`], so
/// delivering the same session twice produces no change notification.
#[derive(Clone)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

impl SessionTracker {
    pub fn new(provider: Arc<dyn AuthProvider>, events: Arc<TenancyEventHub>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            inner: Arc::new(TrackerInner {
                provider,
                state,
                events,
                epoch: AtomicU64::new(0),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Register the provider listener, then pull the current session once.
    pub async fn start(&self) {
        let rx = self.inner.provider.subscribe();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.listen(rx).await });

        let previous = self.inner.listener.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        self.inner.load_current().await;
    }

    /// Detach from the provider. State is left as is.
    pub fn stop(&self) {
        let handle = self.inner.listener.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Try to revive the session. `false` means the caller should send the
    /// user back to sign-in; cached artifacts are already wiped by then.
    #[instrument(skip(self))]
    pub async fn force_session_recovery(&self) -> bool {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        match self.inner.provider.refresh_session().await {
            Ok(session) => {
                info!(user_id = %session.user_id(), "Session recovered");
                self.inner.apply_session(Some(session), false);
                true
            }
            Err(e) => {
                let err = TenancyError::normalize(e);
                warn!(error = %err, "Session recovery failed");
                self.inner.provider.clear_local_session().await;
                self.inner.apply_failure(&err, true);
                false
            }
        }
    }
}

impl TrackerInner {
    async fn listen(&self, mut rx: broadcast::Receiver<AuthStateChange>) {
        loop {
            match rx.recv().await {
                Ok(change) => self.handle_change(change).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed events; the provider's current session is the last word.
                    warn!(skipped, "Auth listener lagged, resynchronizing");
                    self.load_current().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Auth event stream closed");
                    break;
                }
            }
        }
    }

    async fn handle_change(&self, change: AuthStateChange) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        debug!(event = %change.kind, has_session = change.session.is_some(), "Auth state change");

        if change.kind == AuthChangeKind::SignedOut && change.session.is_none() {
            self.provider.clear_local_session().await;
        }
        self.apply_session(change.session, change.kind == AuthChangeKind::SignedIn);
    }

    async fn load_current(&self) {
        let started_at = self.epoch.load(Ordering::SeqCst);
        let result = self.provider.get_session().await;

        if self.epoch.load(Ordering::SeqCst) != started_at {
            // A pushed event landed while we were waiting; it is newer.
            debug!("Discarding stale session pull");
            self.state.send_if_modified(|s| std::mem::replace(&mut s.loading, false));
            return;
        }

        match result {
            Ok(session) => self.apply_session(session, false),
            Err(e) => {
                let err = TenancyError::normalize(e);
                warn!(error = %err, "Failed to load current session");
                if indicates_dead_session(&err) {
                    self.provider.clear_local_session().await;
                }
                self.apply_failure(&err, false);
            }
        }
    }

    fn apply_session(&self, session: Option<Session>, sign_in: bool) {
        let user = session.as_ref().map(|s| s.user.clone());
        let mut signed_out = false;

        let changed = self.state.send_if_modified(|s| {
            let changed = sign_in
                || s.session != session
                || s.user != user
                || s.loading
                || s.error.is_some()
                || !s.is_connected;
            if sign_in {
                s.sign_ins += 1;
            }
            signed_out = s.session.is_some() && session.is_none();
            s.session = session.clone();
            s.user = user.clone();
            s.loading = false;
            s.error = None;
            s.is_connected = true;
            changed
        });

        if changed {
            self.events.emit(&TenancyEvent::SessionChanged {
                user_id: user.map(|u| u.id),
            });
        }
        if signed_out {
            info!("Signed out");
            self.events.emit(&TenancyEvent::SignedOut);
        }
    }

    fn apply_failure(&self, err: &TenancyError, drop_session: bool) {
        let connected = !is_transport_failure(err);
        self.state.send_modify(|s| {
            if drop_session {
                s.session = None;
                s.user = None;
            }
            s.loading = false;
            s.error = Some(err.message.clone());
            s.is_connected = connected;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_session_markers_match_provider_messages() {
        assert!(indicates_dead_session(&TenancyError::not_authenticated(
            "Invalid Refresh Token: Refresh Token Not Found"
        )));
        assert!(indicates_dead_session(&TenancyError::bad_request("Auth session missing!")));
        assert!(!indicates_dead_session(&TenancyError::unavailable("connection refused")));
    }

    #[test]
    fn user_id_requires_both_user_and_session() {
        let state = SessionState {
            user: Some(User::new("u-1")),
            ..SessionState::default()
        };
        assert!(state.user_id().is_none());
        assert!(!state.is_settled());
    }
}
