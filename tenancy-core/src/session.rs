//! Authenticated user and session types, and the auth events that replace them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Opaque credential bundle issued by the auth provider.
///
/// Replaced wholesale on every provider event; never mutated in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: User,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user: User, access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            user,
            access_token: access_token.into(),
            refresh_token: None,
            expires_at,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Provider-side event names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthChangeKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
    Other(String),
}

impl AuthChangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            AuthChangeKind::InitialSession => "INITIAL_SESSION",
            AuthChangeKind::SignedIn => "SIGNED_IN",
            AuthChangeKind::SignedOut => "SIGNED_OUT",
            AuthChangeKind::TokenRefreshed => "TOKEN_REFRESHED",
            AuthChangeKind::UserUpdated => "USER_UPDATED",
            AuthChangeKind::PasswordRecovery => "PASSWORD_RECOVERY",
            AuthChangeKind::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "INITIAL_SESSION" => AuthChangeKind::InitialSession,
            "SIGNED_IN" => AuthChangeKind::SignedIn,
            "SIGNED_OUT" => AuthChangeKind::SignedOut,
            "TOKEN_REFRESHED" => AuthChangeKind::TokenRefreshed,
            "USER_UPDATED" => AuthChangeKind::UserUpdated,
            "PASSWORD_RECOVERY" => AuthChangeKind::PasswordRecovery,
            other => AuthChangeKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AuthChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pushed auth event: event name plus the session it carries, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStateChange {
    pub kind: AuthChangeKind,
    pub session: Option<Session>,
}

impl AuthStateChange {
    pub fn new(kind: AuthChangeKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }

    pub fn signed_in(session: Session) -> Self {
        Self::new(AuthChangeKind::SignedIn, Some(session))
    }

    pub fn signed_out() -> Self {
        Self::new(AuthChangeKind::SignedOut, None)
    }

    pub fn token_refreshed(session: Session) -> Self {
        Self::new(AuthChangeKind::TokenRefreshed, Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn debug_does_not_leak_tokens() {
        let session = Session::new(User::new("u-1"), "secret-access", Utc::now())
            .with_refresh_token("secret-refresh");
        let printed = format!("{session:?}");
        assert!(!printed.contains("secret"));
        assert!(printed.contains("u-1"));
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = Utc::now();
        let session = Session::new(User::new("u-1"), "t", now);
        assert!(session.is_expired_at(now));
        assert!(!session.is_expired_at(now - Duration::seconds(1)));
    }

    #[test]
    fn event_names_parse() {
        assert_eq!(AuthChangeKind::parse("signed_out"), AuthChangeKind::SignedOut);
        assert_eq!(AuthChangeKind::parse("MFA_CHALLENGE_VERIFIED"), AuthChangeKind::Other("MFA_CHALLENGE_VERIFIED".into()));
        assert_eq!(AuthChangeKind::TokenRefreshed.to_string(), "TOKEN_REFRESHED");
    }
}
