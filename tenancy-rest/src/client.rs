use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{map_error_body, RestError, RestResult};
use crate::options::RestOptions;

/// Thin wrapper over `reqwest::Client` that knows the project URL and key.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    options: RestOptions,
}

impl RestClient {
    pub fn new(options: RestOptions) -> RestResult<Self> {
        if options.url.trim().is_empty() {
            return Err(RestError::Config("url must not be empty".to_string()));
        }
        let http = reqwest::Client::builder().timeout(options.timeout).build()?;
        Ok(Self { http, options })
    }

    pub fn options(&self) -> &RestOptions {
        &self.options
    }

    /// Request with the `apikey` header and, when given, a bearer token.
    pub(crate) fn request(&self, method: Method, path: &str, bearer: Option<&str>) -> RequestBuilder {
        let builder = self
            .http
            .request(method, self.options.endpoint(path))
            .header("apikey", self.options.api_key.as_str());
        match bearer {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send and decode a JSON body, mapping non-2xx answers to [`RestError::Api`].
    pub(crate) async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> RestResult<T> {
        let response = request.send().await?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url().path(), "REST response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_body(status.as_u16(), &body));
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| RestError::Decode(e.to_string()))
    }

    /// Send and ignore the body of a successful answer.
    pub(crate) async fn send_empty(&self, request: RequestBuilder) -> RestResult<()> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_body(status.as_u16(), &body));
        }
        Ok(())
    }
}
