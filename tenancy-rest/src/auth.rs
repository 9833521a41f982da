//! GoTrue-style password/refresh-token auth with a local session cache.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tenancy_core::{AuthChangeKind, AuthStateChange, Session, TenancyResult, User};
use tenancy_session::AuthProvider;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::client::RestClient;
use crate::error::{RestError, RestResult};

const DEFAULT_EXPIRES_IN: i64 = 3600;

#[derive(Debug, Deserialize)]
pub(crate) struct WireUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: WireUser,
}

impl TokenResponse {
    pub(crate) fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .unwrap_or_else(|| {
                Utc::now() + chrono::Duration::seconds(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN))
            });

        let mut user = User::new(self.user.id);
        if let Some(email) = self.user.email {
            user = user.with_email(email);
        }

        let session = Session::new(user, self.access_token, expires_at);
        match self.refresh_token {
            Some(refresh) => session.with_refresh_token(refresh),
            None => session,
        }
    }
}

/// Auth provider backed by the `/auth/v1` endpoints.
///
/// The current session lives in memory only; persisting it between runs is
/// up to the caller (see [`RestAuthProvider::restore`]).
pub struct RestAuthProvider {
    client: Arc<RestClient>,
    session: RwLock<Option<Session>>,
    events: broadcast::Sender<AuthStateChange>,
}

impl RestAuthProvider {
    pub fn new(client: Arc<RestClient>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            client,
            session: RwLock::new(None),
            events,
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.session.read().clone()
    }

    pub(crate) fn access_token(&self) -> RestResult<String> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or(RestError::NoSession)
    }

    /// Install a previously persisted session.
    pub fn restore(&self, session: Session) {
        *self.session.write() = Some(session.clone());
        self.emit(AuthStateChange::new(AuthChangeKind::InitialSession, Some(session)));
    }

    #[instrument(skip(self, password))]
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> TenancyResult<Session> {
        let request = self
            .client
            .request(Method::POST, "/auth/v1/token", None)
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }));

        let token: TokenResponse = self
            .client
            .send_json(request)
            .await
            .map_err(RestError::into_anyhow)?;
        let session = token.into_session();

        info!(user_id = %session.user_id(), "Signed in");
        *self.session.write() = Some(session.clone());
        self.emit(AuthStateChange::signed_in(session.clone()));
        Ok(session)
    }

    /// Revoke the session server-side (best effort) and forget it locally.
    pub async fn sign_out(&self) {
        if let Ok(token) = self.access_token() {
            let request = self.client.request(Method::POST, "/auth/v1/logout", Some(token.as_str()));
            if let Err(e) = self.client.send_empty(request).await {
                warn!(error = %e, "Server-side sign-out failed");
            }
        }
        self.session.write().take();
        self.emit(AuthStateChange::signed_out());
    }

    fn emit(&self, change: AuthStateChange) {
        debug!(event = %change.kind, "Auth event");
        let _ = self.events.send(change);
    }
}

#[async_trait]
impl AuthProvider for RestAuthProvider {
    async fn get_session(&self) -> TenancyResult<Option<Session>> {
        let Some(session) = self.current() else {
            return Ok(None);
        };
        if !session.is_expired() {
            return Ok(Some(session));
        }
        debug!(user_id = %session.user_id(), "Cached session expired, refreshing");
        self.refresh_session().await.map(Some)
    }

    #[instrument(skip(self))]
    async fn refresh_session(&self) -> TenancyResult<Session> {
        let refresh_token = self
            .session
            .read()
            .as_ref()
            .and_then(|s| s.refresh_token.clone())
            .ok_or_else(|| RestError::NoSession.into_anyhow())?;

        let request = self
            .client
            .request(Method::POST, "/auth/v1/token", None)
            .query(&[("grant_type", "refresh_token")])
            .json(&json!({ "refresh_token": refresh_token }));

        let token: TokenResponse = self
            .client
            .send_json(request)
            .await
            .map_err(RestError::into_anyhow)?;
        let session = token.into_session();

        *self.session.write() = Some(session.clone());
        self.emit(AuthStateChange::token_refreshed(session.clone()));
        Ok(session)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthStateChange> {
        self.events.subscribe()
    }

    async fn clear_local_session(&self) {
        self.session.write().take();
    }
}
