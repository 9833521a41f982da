//! Core multi-tenant types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant identifier as issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Access role of a user inside one tenant.
///
/// Unknown roles are kept verbatim and rank below every known role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TenantRole {
    Owner,
    Admin,
    User,
    Other(String),
}

impl TenantRole {
    /// Selection priority: lower wins.
    pub fn rank(&self) -> u8 {
        match self {
            TenantRole::Owner => 1,
            TenantRole::Admin => 2,
            TenantRole::User => 3,
            TenantRole::Other(_) => 4,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TenantRole::Owner => "owner",
            TenantRole::Admin => "admin",
            TenantRole::User => "user",
            TenantRole::Other(s) => s,
        }
    }
}

impl From<String> for TenantRole {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "owner" => TenantRole::Owner,
            "admin" => TenantRole::Admin,
            "user" => TenantRole::User,
            _ => TenantRole::Other(s),
        }
    }
}

impl From<&str> for TenantRole {
    fn from(s: &str) -> Self {
        TenantRole::from(s.to_string())
    }
}

impl From<TenantRole> for String {
    fn from(role: TenantRole) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for TenantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denormalized tenant fields carried on each membership row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSummary {
    pub id: TenantId,
    pub name: String,
    #[serde(default)]
    pub business_type: Option<String>,
}

/// One (user, tenant, role) association. Read-only on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMembership {
    pub id: String,
    pub tenant_id: TenantId,
    pub role: TenantRole,
    pub created_at: DateTime<Utc>,
    #[serde(alias = "tenants")]
    pub tenant: TenantSummary,
}

impl TenantMembership {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<TenantId>,
        role: impl Into<TenantRole>,
        created_at: DateTime<Utc>,
        tenant_name: impl Into<String>,
    ) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            id: id.into(),
            tenant: TenantSummary {
                id: tenant_id.clone(),
                name: tenant_name.into(),
                business_type: None,
            },
            tenant_id,
            role: role.into(),
            created_at,
        }
    }

    pub fn with_business_type(mut self, business_type: impl Into<String>) -> Self {
        self.tenant.business_type = Some(business_type.into());
        self
    }
}

/// The tenant the caller is currently operating against.
///
/// Both fields are `None` when there is no session or no membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTenantSelection {
    pub tenant_id: Option<TenantId>,
    pub role: Option<TenantRole>,
}

impl ActiveTenantSelection {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of(membership: &TenantMembership) -> Self {
        Self {
            tenant_id: Some(membership.tenant_id.clone()),
            role: Some(membership.role.clone()),
        }
    }

    pub fn is_selected(&self) -> bool {
        self.tenant_id.is_some()
    }
}

/// Random handshake value sent with every context bind.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Local mirror of the server-side tenant binding for this connection.
///
/// `is_context_set == true` is the only state in which tenant-scoped
/// queries may be assumed scoped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantContextBinding {
    pub current_tenant_id: Option<TenantId>,
    pub session_token: Option<SessionToken>,
    pub context_id: Option<String>,
    pub is_context_set: bool,
    pub error: Option<String>,
}

impl TenantContextBinding {
    pub fn bound(tenant_id: TenantId, session_token: SessionToken, context_id: String) -> Self {
        Self {
            current_tenant_id: Some(tenant_id),
            session_token: Some(session_token),
            context_id: Some(context_id),
            is_context_set: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_rank_orders_known_roles() {
        assert!(TenantRole::Owner.rank() < TenantRole::Admin.rank());
        assert!(TenantRole::Admin.rank() < TenantRole::User.rank());
        assert!(TenantRole::User.rank() < TenantRole::from("receptionist").rank());
    }

    #[test]
    fn role_round_trips_unknown_values() {
        let role: TenantRole = serde_json::from_value(json!("Stylist")).unwrap();
        assert_eq!(role, TenantRole::Other("Stylist".to_string()));
        assert_eq!(serde_json::to_value(&role).unwrap(), json!("Stylist"));
        let owner: TenantRole = serde_json::from_value(json!("OWNER")).unwrap();
        assert_eq!(owner, TenantRole::Owner);
    }

    #[test]
    fn membership_accepts_joined_tenants_field() {
        let row = json!({
            "id": "m-1",
            "tenant_id": "t-1",
            "role": "admin",
            "created_at": "2024-03-01T10:00:00Z",
            "tenants": { "id": "t-1", "name": "Salon One", "business_type": "salon" }
        });
        let m: TenantMembership = serde_json::from_value(row).unwrap();
        assert_eq!(m.tenant_id, TenantId::from("t-1"));
        assert_eq!(m.role, TenantRole::Admin);
        assert_eq!(m.tenant.business_type.as_deref(), Some("salon"));
    }

    #[test]
    fn session_token_debug_hides_value() {
        let token = SessionToken::generate();
        assert_eq!(format!("{token:?}"), "SessionToken(..)");
        assert_ne!(token, SessionToken::generate());
    }
}
