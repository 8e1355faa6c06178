use crate::config::{get_api_key, AppConfig};
use crate::error::AppError;
use crate::models::{Source, UsageView};
use crate::providers::anthropic::AnthropicAdapter;
use crate::providers::{ProviderContext, QuotaProvider};
use crate::tracker::QuotaTracker;
use chrono::Utc;
use reqwest::Client;
use std::time::Instant;
use tracing::info;

/// Polls the authoritative quota source and feeds the result into the
/// tracker's absolute-set path.
pub struct QuotaService {
    client: Client,
    provider: Box<dyn QuotaProvider>,
}

impl QuotaService {
    pub fn new() -> Result<Self, AppError> {
        Self::with_provider(Box::new(AnthropicAdapter))
    }

    pub fn with_provider(provider: Box<dyn QuotaProvider>) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client, provider })
    }

    pub async fn poll(&self, cfg: &AppConfig, tracker: &QuotaTracker) -> Result<UsageView, AppError> {
        let api_key = get_api_key()?;
        self.poll_with_key(cfg, tracker, api_key).await
    }

    pub async fn poll_with_key(
        &self,
        cfg: &AppConfig,
        tracker: &QuotaTracker,
        api_key: String,
    ) -> Result<UsageView, AppError> {
        let ctx = ProviderContext {
            api_key,
            settings: cfg.api.clone(),
            now: Utc::now(),
        };

        let started = Instant::now();
        let patch = self.provider.fetch_quota(&self.client, &ctx).await?;
        info!(
            provider = self.provider.name(),
            periods = patch.windows.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "quota poll succeeded"
        );

        tracker.set_usage(&patch, Source::Api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsagePatch;
    use crate::storage::MemoryBackend;
    use async_trait::async_trait;

    struct FixedProvider(UsagePatch);

    #[async_trait]
    impl QuotaProvider for FixedProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn fetch_quota(
            &self,
            _client: &Client,
            ctx: &ProviderContext,
        ) -> Result<UsagePatch, AppError> {
            assert_eq!(ctx.api_key, "sk-test");
            Ok(self.0.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl QuotaProvider for FailingProvider {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn fetch_quota(
            &self,
            _client: &Client,
            _ctx: &ProviderContext,
        ) -> Result<UsagePatch, AppError> {
            Err(AppError::Config("upstream unavailable".into()))
        }
    }

    #[tokio::test]
    async fn poll_applies_patch_as_api_source() {
        let tracker = QuotaTracker::with_defaults(Box::new(MemoryBackend::new()));
        tracker.add_usage(5.0).expect("seed");
        let service = QuotaService::with_provider(Box::new(FixedProvider(
            UsagePatch::default().set_used("session", 64.0),
        )))
        .expect("service");

        let view = service
            .poll_with_key(&AppConfig::default(), &tracker, "sk-test".into())
            .await
            .expect("poll");

        assert_eq!(view.windows["session"].used, 64.0);
        assert_eq!(view.windows["daily"].used, 5.0);
        assert_eq!(view.source, Source::Api);
    }

    #[tokio::test]
    async fn poll_failure_leaves_state_untouched() {
        let tracker = QuotaTracker::with_defaults(Box::new(MemoryBackend::new()));
        tracker.add_usage(5.0).expect("seed");
        let service = QuotaService::with_provider(Box::new(FailingProvider)).expect("service");

        let err = service
            .poll_with_key(&AppConfig::default(), &tracker, "sk-test".into())
            .await
            .expect_err("poll should fail");
        assert!(err.to_string().contains("upstream unavailable"));

        let view = tracker.read().expect("read");
        assert_eq!(view.windows["session"].used, 5.0);
        assert_eq!(view.source, Source::None);
    }
}
