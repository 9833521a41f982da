use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tenancy_core::{SessionToken, TenancyResult, TenantId};
use tenancy_session::ContextProcedures;
use tracing::instrument;

use crate::auth::RestAuthProvider;
use crate::client::RestClient;
use crate::error::{RestError, RestResult};

/// Calls the tenant-context stored procedures over `/rest/v1/rpc`.
pub struct RestContextProcedures {
    client: Arc<RestClient>,
    auth: Arc<RestAuthProvider>,
}

impl RestContextProcedures {
    pub fn new(client: Arc<RestClient>, auth: Arc<RestAuthProvider>) -> Self {
        Self { client, auth }
    }

    async fn rpc(&self, name: &str, args: Value) -> RestResult<Value> {
        let token = self.auth.access_token()?;
        let request = self
            .client
            .request(Method::POST, &format!("/rest/v1/rpc/{name}"), Some(token.as_str()))
            .json(&args);
        self.client.send_json(request).await
    }
}

/// The bind procedure may answer with a bare id or a row carrying one.
fn context_id_from(value: Value) -> RestResult<String> {
    match value {
        Value::String(id) => Ok(id),
        Value::Object(mut row) => match row.remove("context_id") {
            Some(Value::String(id)) => Ok(id),
            Some(other) if !other.is_null() => Ok(other.to_string()),
            _ => Err(RestError::Decode("bind response has no context_id".to_string())),
        },
        Value::Number(n) => Ok(n.to_string()),
        other => Err(RestError::Decode(format!("unexpected bind response: {other}"))),
    }
}

#[async_trait]
impl ContextProcedures for RestContextProcedures {
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    async fn bind(&self, tenant_id: &TenantId, session_token: &SessionToken) -> TenancyResult<String> {
        let name = self.client.options().bind_rpc.clone();
        let args = json!({
            "p_tenant_id": tenant_id.as_str(),
            "p_session_token": session_token.as_str(),
        });
        self.rpc(&name, args)
            .await
            .and_then(context_id_from)
            .map_err(RestError::into_anyhow)
    }

    async fn refresh(&self) -> TenancyResult<bool> {
        let name = self.client.options().refresh_rpc.clone();
        let value = self.rpc(&name, json!({})).await.map_err(RestError::into_anyhow)?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn current(&self) -> TenancyResult<Option<TenantId>> {
        let name = self.client.options().current_rpc.clone();
        let value = self.rpc(&name, json!({})).await.map_err(RestError::into_anyhow)?;
        Ok(value.as_str().map(TenantId::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_id_accepts_bare_and_row_shapes() {
        assert_eq!(context_id_from(json!("ctx-1")).unwrap(), "ctx-1");
        assert_eq!(context_id_from(json!({ "context_id": "ctx-2" })).unwrap(), "ctx-2");
        assert_eq!(context_id_from(json!({ "context_id": 42 })).unwrap(), "42");
        assert!(context_id_from(json!({ "ok": true })).is_err());
        assert!(context_id_from(Value::Null).is_err());
    }
}
