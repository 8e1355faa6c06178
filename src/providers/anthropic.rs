use crate::error::AppError;
use crate::models::{parse_timestamp, percent_of, UsagePatch, WindowPatch};
use crate::providers::{ProviderContext, QuotaProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

const TOKENS_LIMIT: &str = "anthropic-ratelimit-tokens-limit";
const TOKENS_REMAINING: &str = "anthropic-ratelimit-tokens-remaining";
const TOKENS_RESET: &str = "anthropic-ratelimit-tokens-reset";

/// Reads the token rate-limit headers returned by a one-token request.
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    fn messages_endpoint() -> &'static str {
        "https://api.anthropic.com/v1/messages"
    }

    fn resolve_messages_url(base_url: Option<&str>) -> Result<String, AppError> {
        let Some(base) = base_url else {
            return Ok(Self::messages_endpoint().to_string());
        };

        let mut parsed = url::Url::parse(base)?;
        let path = parsed.path().to_string();
        if path.ends_with("/v1/messages") {
            return Ok(parsed.to_string());
        }
        if path.is_empty() || path == "/" || path == "/v1" || path == "/v1/" {
            parsed.set_path("/v1/messages");
            return Ok(parsed.to_string());
        }
        Ok(parsed.join("v1/messages")?.to_string())
    }

    fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Session patch in percentage points of the token limit. `None` when the
    /// response carried no usable limit.
    fn patch_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<UsagePatch> {
        let limit = Self::header_u64(headers, TOKENS_LIMIT).filter(|l| *l > 0)?;
        let remaining = Self::header_u64(headers, TOKENS_REMAINING).unwrap_or(0);
        let consumed = limit.saturating_sub(remaining);

        let resets_at = headers
            .get(TOKENS_RESET)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_timestamp)
            .filter(|at| *at > now);

        let mut patch = UsagePatch::default();
        *patch.entry("session") = WindowPatch {
            used: Some(percent_of(consumed as f64, limit as f64) as f64),
            limit: Some(100.0),
            resets_at,
        };
        Some(patch)
    }
}

#[async_trait]
impl QuotaProvider for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn fetch_quota(
        &self,
        client: &Client,
        ctx: &ProviderContext,
    ) -> Result<UsagePatch, AppError> {
        let url = Self::resolve_messages_url(ctx.settings.base_url.as_deref())?;

        let response = client
            .post(url)
            .header("x-api-key", &ctx.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": ctx.settings.model,
                "max_tokens": 1,
                "messages": [{ "role": "user", "content": "hi" }],
            }))
            .send()
            .await?;

        let status = response.status();
        debug!(status = %status, "anthropic rate-limit probe answered");
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AppError::Config(
                "Anthropic rejected credentials (unauthorized).".into(),
            ));
        }

        Self::patch_from_headers(response.headers(), ctx.now).ok_or_else(|| {
            AppError::Config(format!(
                "Anthropic response (HTTP status {status}) carried no token rate-limit headers."
            ))
        })
    }
}
