use crate::config::{db_path, state_path, AppConfig, BackendKind};
use crate::error::AppError;
use crate::models::{
    PeriodSpec, QuotaRecord, QuotaWindow, Source, UsagePatch, UsageView, DEFAULT_LIMIT,
};
use crate::relay::parse_status_text;
use crate::schedule::next_reset;
use crate::storage::{JsonFileBackend, MemoryBackend, SqliteBackend, StateBackend};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

/// Zeroes every window whose reset instant has passed and recomputes its
/// reset. Missing periods are synthesized. Returns whether anything changed.
pub fn reconcile_expired(
    record: &mut QuotaRecord,
    periods: &[PeriodSpec],
    default_limit: f64,
    now: DateTime<Utc>,
) -> bool {
    let mut changed = false;

    for spec in periods {
        let Some(window) = record.windows.get_mut(&spec.key) else {
            record.windows.insert(
                spec.key.clone(),
                QuotaWindow::fresh(spec, default_limit, now),
            );
            changed = true;
            continue;
        };

        if now >= window.resets_at {
            debug!(period = %spec.key, expired_at = %window.resets_at, "quota window reset");
            window.used = 0.0;
            window.resets_at = next_reset(spec.rule, now);
            changed = true;
        }
    }

    changed
}

pub fn serialize_record(record: &QuotaRecord) -> Result<String, AppError> {
    Ok(serde_json::to_string_pretty(record)?)
}

/// Owns the persisted quota record. Each operation runs its whole
/// load/reconcile/mutate/persist cycle under one lock.
pub struct QuotaTracker {
    backend: Mutex<Box<dyn StateBackend>>,
    periods: Vec<PeriodSpec>,
    default_limit: f64,
}

impl QuotaTracker {
    pub fn new(backend: Box<dyn StateBackend>, periods: Vec<PeriodSpec>, default_limit: f64) -> Self {
        let default_limit = if default_limit.is_finite() && default_limit > 0.0 {
            default_limit
        } else {
            DEFAULT_LIMIT
        };
        Self {
            backend: Mutex::new(backend),
            periods,
            default_limit,
        }
    }

    pub fn with_defaults(backend: Box<dyn StateBackend>) -> Self {
        Self::new(backend, PeriodSpec::built_ins(4), DEFAULT_LIMIT)
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self, AppError> {
        let backend: Box<dyn StateBackend> = match cfg.backend {
            BackendKind::Json => Box::new(JsonFileBackend::new(state_path()?)),
            BackendKind::Sqlite => Box::new(SqliteBackend::open(&db_path()?)?),
            BackendKind::Memory => Box::new(MemoryBackend::new()),
        };
        Ok(Self::new(backend, cfg.periods(), cfg.default_limit()))
    }

    pub fn periods(&self) -> &[PeriodSpec] {
        &self.periods
    }

    pub fn describe_backend(&self) -> String {
        self.backend.lock().describe()
    }

    /// Stored record, or a fresh default when nothing usable is stored.
    pub fn load(&self) -> QuotaRecord {
        self.load_at(Utc::now())
    }

    pub fn load_at(&self, now: DateTime<Utc>) -> QuotaRecord {
        let backend = self.backend.lock();
        self.load_from(&**backend, now)
    }

    fn load_from(&self, backend: &dyn StateBackend, now: DateTime<Utc>) -> QuotaRecord {
        let fresh = || QuotaRecord::fresh(&self.periods, self.default_limit, now);

        let raw = match backend.load() {
            Ok(Some(raw)) => raw,
            Ok(None) => return fresh(),
            Err(err) => {
                warn!(error = %err, "failed to read quota state, starting from defaults");
                return fresh();
            }
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "quota state is not valid JSON, starting from defaults");
                return fresh();
            }
        };

        QuotaRecord::from_value(&value, &self.periods, self.default_limit, now).unwrap_or_else(
            || {
                warn!("quota state is not a JSON object, starting from defaults");
                fresh()
            },
        )
    }

    pub fn read(&self) -> Result<UsageView, AppError> {
        self.read_at(Utc::now())
    }

    pub fn read_at(&self, now: DateTime<Utc>) -> Result<UsageView, AppError> {
        self.apply(now, |_| false)
    }

    /// Adds `tokens` to every window at once. Negative values act as credits
    /// and never push a window below zero.
    pub fn add_usage(&self, tokens: f64) -> Result<UsageView, AppError> {
        self.add_usage_at(tokens, Utc::now())
    }

    pub fn add_usage_at(&self, tokens: f64, now: DateTime<Utc>) -> Result<UsageView, AppError> {
        if !tokens.is_finite() {
            return Err(AppError::InvalidInput(
                "tokens must be a finite number".into(),
            ));
        }

        self.apply(now, |record| {
            for window in record.windows.values_mut() {
                window.used = (window.used + tokens).max(0.0);
            }
            true
        })
    }

    /// Authoritative overwrite of the periods present in `patch`.
    pub fn set_usage(&self, patch: &UsagePatch, source: Source) -> Result<UsageView, AppError> {
        self.set_usage_at(patch, source, Utc::now())
    }

    pub fn set_usage_at(
        &self,
        patch: &UsagePatch,
        source: Source,
        now: DateTime<Utc>,
    ) -> Result<UsageView, AppError> {
        self.apply(now, |record| {
            for (key, update) in &patch.windows {
                let Some(window) = record.windows.get_mut(key) else {
                    debug!(period = %key, "ignoring update for untracked period");
                    continue;
                };

                if let Some(used) = update.used.filter(|v| v.is_finite()) {
                    window.used = used.max(0.0);
                }
                if let Some(limit) = update.limit.filter(|v| v.is_finite() && *v > 0.0) {
                    window.limit = limit;
                }
                if let Some(resets_at) = update.resets_at.filter(|at| *at > now) {
                    window.resets_at = resets_at;
                }
            }
            record.source = source;
            true
        })
    }

    /// Applies whatever `N% left` segments can be found in `text`. Periods
    /// without a match keep their values.
    pub fn update_from_text(&self, text: &str) -> Result<UsageView, AppError> {
        self.update_from_text_at(text, Utc::now())
    }

    pub fn update_from_text_at(
        &self,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<UsageView, AppError> {
        let relayed = parse_status_text(text);
        if relayed.is_empty() {
            debug!("relayed status text had no usage figures");
        }

        self.apply(now, |record| {
            let mut applied = false;
            for entry in &relayed {
                let Some(window) = record.windows.get_mut(&entry.key) else {
                    continue;
                };
                window.used = window.limit * (100.0 - entry.percent_left) / 100.0;
                if let Some(resets_at) = entry
                    .reset_after
                    .and_then(|d| now.checked_add_signed(d))
                {
                    window.resets_at = resets_at;
                }
                applied = true;
            }
            if applied {
                record.source = Source::RelayedText;
            }
            applied
        })
    }

    fn apply<F>(&self, now: DateTime<Utc>, mutate: F) -> Result<UsageView, AppError>
    where
        F: FnOnce(&mut QuotaRecord) -> bool,
    {
        let mut backend = self.backend.lock();
        let mut record = self.load_from(&**backend, now);

        let reconciled = reconcile_expired(&mut record, &self.periods, self.default_limit, now);
        let mutated = mutate(&mut record);

        if reconciled || mutated {
            record.last_updated = now;
            backend.store(&serialize_record(&record)?)?;
        }

        Ok(UsageView::new(&record, now))
    }
}
