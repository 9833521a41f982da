use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tenancy_core::{bail_tenancy, TenancyConfigSnapshot, TenancyResult};

/// Connection settings for a PostgREST + GoTrue style backend
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestOptions {
    /// Project base URL, e.g. `https://xyz.example.co`
    pub url: String,
    /// Public (anon) API key sent as the `apikey` header
    pub api_key: String,
    pub membership_table: String,
    /// PostgREST `select` for the membership query, including the tenant join
    pub membership_select: String,
    pub bind_rpc: String,
    pub refresh_rpc: String,
    pub current_rpc: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl RestOptions {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            membership_table: "tenant_users".to_string(),
            membership_select: "id,tenant_id,role,created_at,tenants(id,name,business_type)".to_string(),
            bind_rpc: "set_tenant_context".to_string(),
            refresh_rpc: "refresh_tenant_context".to_string(),
            current_rpc: "get_current_tenant_id".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Read `rest.*` keys. `rest.url` and `rest.api_key` are required.
    pub fn from_config(config: &TenancyConfigSnapshot) -> TenancyResult<Self> {
        let Some(url) = config.get_string("rest.url") else {
            bail_tenancy!(bad_request, "Missing configuration key rest.url");
        };
        let Some(api_key) = config.get_string("rest.api_key") else {
            bail_tenancy!(bad_request, "Missing configuration key rest.api_key");
        };

        let mut options = Self::new(url, api_key);
        if let Some(table) = config.get_string("rest.membership_table") {
            options.membership_table = table;
        }
        if let Some(select) = config.get_string("rest.membership_select") {
            options.membership_select = select;
        }
        if let Some(rpc) = config.get_string("rest.bind_rpc") {
            options.bind_rpc = rpc;
        }
        if let Some(rpc) = config.get_string("rest.refresh_rpc") {
            options.refresh_rpc = rpc;
        }
        if let Some(rpc) = config.get_string("rest.current_rpc") {
            options.current_rpc = rpc;
        }
        if let Some(timeout) = config.get_duration_ms("rest.timeout_ms") {
            options.timeout = timeout;
        }
        Ok(options)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_membership_table(mut self, table: impl Into<String>) -> Self {
        self.membership_table = table.into();
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

impl fmt::Debug for RestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestOptions")
            .field("url", &self.url)
            .field("membership_table", &self.membership_table)
            .field("bind_rpc", &self.bind_rpc)
            .field("refresh_rpc", &self.refresh_rpc)
            .field("current_rpc", &self.current_rpc)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
