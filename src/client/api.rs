use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::models::entitlement::{ConsumeOutcome, FeatureDecision, TokenBalances};
use crate::models::feature::Feature;
use crate::models::subscription::SubscriptionResponse;

/// Per-request network budget. Distinct from the post-purchase
/// reconciliation backoff budget, which spans several requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("server responded {status}: {message}")]
    Http { status: u16, message: String },
    #[error("no auth token available")]
    Unauthenticated,
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// Timeouts and connection failures are recoverable by falling back to
    /// cache or retrying; everything else is the server answering.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Timeout | ApiError::Network(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

/// Thin typed client over the entitlement HTTP surface. Holds the bearer
/// token behind a lock so the surrounding auth layer can install it when it
/// becomes ready; calls made before that fail fast instead of hanging.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    bearer: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer: Arc::new(RwLock::new(None)),
        }
    }

    #[cfg(test)]
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let mut client = Self::new(base_url);
        client.http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        client
    }

    pub fn set_bearer(&self, token: Option<String>) {
        *self.bearer.write().unwrap() = token;
    }

    pub fn has_bearer(&self) -> bool {
        self.bearer.read().unwrap().is_some()
    }

    fn token(&self) -> Result<String, ApiError> {
        self.bearer
            .read()
            .unwrap()
            .clone()
            .ok_or(ApiError::Unauthenticated)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or_else(|| status.to_string());
            return Err(ApiError::Http {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let token = self.token()?;
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await?;
        Self::decode_response(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let token = self.token()?;
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        Self::decode_response(response).await
    }

    pub async fn fetch_subscription(&self) -> Result<SubscriptionResponse, ApiError> {
        self.get_json("/api/subscription").await
    }

    pub async fn fetch_token_balance(&self) -> Result<TokenBalances, ApiError> {
        self.get_json("/api/tokens/balance").await
    }

    pub async fn check_feature(
        &self,
        feature: Feature,
        quantity: i64,
    ) -> Result<FeatureDecision, ApiError> {
        self.post_json(
            "/api/features/check",
            &json!({ "feature": feature, "quantity": quantity }),
        )
        .await
    }

    pub async fn consume_feature(
        &self,
        feature: Feature,
        quantity: i64,
        use_tokens: bool,
    ) -> Result<ConsumeOutcome, ApiError> {
        self.post_json(
            "/api/features/consume",
            &json!({ "feature": feature, "quantity": quantity, "useTokens": use_tokens }),
        )
        .await
    }

    pub async fn create_checkout(
        &self,
        plan: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, ApiError> {
        let body: serde_json::Value = self
            .post_json(
                "/api/subscription/checkout",
                &json!({ "plan": plan, "successUrl": success_url, "cancelUrl": cancel_url }),
            )
            .await?;
        body.get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode("checkout response missing url".into()))
    }

    pub async fn purchase_tokens(
        &self,
        product_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, ApiError> {
        let body: serde_json::Value = self
            .post_json(
                "/api/tokens/purchase",
                &json!({ "productId": product_id, "successUrl": success_url, "cancelUrl": cancel_url }),
            )
            .await?;
        body.get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode("purchase response missing url".into()))
    }
}
