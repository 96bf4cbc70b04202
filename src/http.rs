//! REST requester.
//!
//! All outbound HTTP calls go through [`RestClient`] so that auth headers,
//! rate-limit bookkeeping, and error handling live in one place.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::commands::CommandClient;
use crate::error::HttpError;
use crate::ratelimiter::RateLimiter;
use crate::types::{CreateMessage, Guild, Message, RateLimitInfo};

pub const BASE_URL: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = concat!("DiscordBot (https://github.com, ", env!("CARGO_PKG_VERSION"), ")");
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Issues authenticated REST calls, consulting the shared [`RateLimiter`]
/// before every request and updating it from every response.
pub struct RestClient {
    http: reqwest::Client,
    token: String,
    limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient").field("token", &"<redacted>").finish()
    }
}

impl RestClient {
    pub fn new(token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            http,
            token: token.into(),
            limiter: Arc::new(RateLimiter::new()),
        }
    }

    /// Issue one REST call, returning the raw response body.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<bytes::Bytes, HttpError> {
        let route = format!("{method}{path}");

        if self.limiter.is_rate_limited(&route) {
            tokio::time::sleep(self.limiter.retry_after(&route)).await;
        }

        let mut req = self
            .http
            .request(method, format!("{BASE_URL}{path}"))
            .header("Authorization", format!("Bot {}", self.token))
            .header("User-Agent", USER_AGENT);
        if let Some(body) = &body {
            req = req.header("Content-Type", "application/json").json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        let info = parse_rate_limit_headers(&response);
        let limiter_key = info.bucket.clone().unwrap_or_else(|| route.clone());
        if let Some(reset_after) = info.reset_after {
            self.limiter.update_limit(
                &limiter_key,
                info.remaining.unwrap_or(0) as i64,
                Duration::from_secs_f64(reset_after.max(0.0)),
                info.is_global,
            );
        }

        let status = response.status();
        let body_bytes = response
            .bytes()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            let parsed: Value = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);
            let retry_after = parsed
                .get("retry_after")
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            let global = parsed.get("global").and_then(|v| v.as_bool()).unwrap_or(false);
            let retry_after = Duration::from_secs_f64(retry_after.max(0.0));
            self.limiter.update_limit(&limiter_key, 0, retry_after, global);
            warn!(route = %route, retry_after_ms = retry_after.as_millis(), "rate limited");
            return Err(HttpError::RateLimited { route, retry_after });
        }

        if !status.is_success() {
            return Err(HttpError::Api {
                status: status.as_u16(),
                route,
                body: String::from_utf8_lossy(&body_bytes).into_owned(),
            });
        }

        Ok(body_bytes)
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, HttpError> {
        let bytes = self.request(method, path, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `POST /channels/{channel_id}/messages`.
    pub async fn send_message(
        &self,
        channel_id: &str,
        body: CreateMessage,
    ) -> Result<Message, HttpError> {
        let json = serde_json::to_value(&body)?;
        self.request_json(
            Method::POST,
            &format!("/channels/{channel_id}/messages"),
            Some(json),
        )
        .await
    }

    /// `GET /guilds/{guild_id}`.
    pub async fn get_guild(&self, guild_id: &str) -> Result<Guild, HttpError> {
        self.request_json(Method::GET, &format!("/guilds/{guild_id}"), None)
            .await
    }
}

#[async_trait]
impl CommandClient for RestClient {
    async fn send_message(&self, channel_id: &str, body: CreateMessage) -> Result<Message, HttpError> {
        RestClient::send_message(self, channel_id, body).await
    }
}

fn parse_rate_limit_headers(response: &reqwest::Response) -> RateLimitInfo {
    let headers = response.headers();
    let header_f64 = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).and_then(|s| s.parse::<f64>().ok());
    let header_u32 = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).and_then(|s| s.parse::<u32>().ok());

    RateLimitInfo {
        remaining: header_u32("x-ratelimit-remaining"),
        reset_after: header_f64("x-ratelimit-reset-after"),
        bucket: headers
            .get("x-ratelimit-bucket")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        is_global: headers
            .get("x-ratelimit-global")
            .and_then(|v| v.to_str().ok())
            == Some("true"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_token_in_debug_output() {
        let client = RestClient::new("super-secret-token");
        let debug = format!("{client:?}");
        assert!(!debug.contains("super-secret-token"));
    }
}
