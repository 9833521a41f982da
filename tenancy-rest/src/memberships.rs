use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use tenancy_core::{TenancyResult, TenantMembership, UserId};
use tenancy_session::MembershipSource;
use tracing::{debug, instrument};

use crate::auth::RestAuthProvider;
use crate::client::RestClient;
use crate::error::RestError;

/// Reads active memberships from the membership table, joined with the
/// tenant summary, newest first.
pub struct RestMembershipSource {
    client: Arc<RestClient>,
    auth: Arc<RestAuthProvider>,
}

impl RestMembershipSource {
    pub fn new(client: Arc<RestClient>, auth: Arc<RestAuthProvider>) -> Self {
        Self { client, auth }
    }
}

#[async_trait]
impl MembershipSource for RestMembershipSource {
    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn list_memberships(&self, user_id: &UserId) -> TenancyResult<Vec<TenantMembership>> {
        let token = self.auth.access_token().map_err(RestError::into_anyhow)?;
        let options = self.client.options();
        let user_filter = format!("eq.{user_id}");

        let request = self
            .client
            .request(Method::GET, &format!("/rest/v1/{}", options.membership_table), Some(token.as_str()))
            .query(&[
                ("select", options.membership_select.as_str()),
                ("user_id", user_filter.as_str()),
                ("is_active", "eq.true"),
                ("order", "created_at.desc"),
            ]);

        let memberships: Vec<TenantMembership> = self
            .client
            .send_json(request)
            .await
            .map_err(RestError::into_anyhow)?;
        debug!(count = memberships.len(), "Fetched memberships");
        Ok(memberships)
    }
}
