use crate::config::ApiSettings;
use crate::error::AppError;
use crate::models::UsagePatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;

pub mod anthropic;

#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub api_key: String,
    pub settings: ApiSettings,
    pub now: DateTime<Utc>,
}

/// An authoritative source of quota figures. Results are applied as absolute
/// overrides, never as deltas.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_quota(
        &self,
        client: &Client,
        ctx: &ProviderContext,
    ) -> Result<UsagePatch, AppError>;
}
