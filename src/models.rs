use crate::schedule::next_reset;
use chrono::{DateTime, Duration, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

pub const BUILT_IN_PERIODS: [&str; 4] = ["session", "daily", "weekly", "monthly"];

pub const DEFAULT_LIMIT: f64 = 100.0;

/// How a window computes its next reset instant. All arithmetic is UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetRule {
    Rolling { hours: i64 },
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodSpec {
    pub key: String,
    pub rule: ResetRule,
}

impl PeriodSpec {
    pub fn new(key: &str, rule: ResetRule) -> Self {
        Self {
            key: key.to_string(),
            rule,
        }
    }

    pub fn built_ins(session_hours: i64) -> Vec<PeriodSpec> {
        vec![
            PeriodSpec::new(
                "session",
                ResetRule::Rolling {
                    hours: session_hours,
                },
            ),
            PeriodSpec::new("daily", ResetRule::Daily),
            PeriodSpec::new("weekly", ResetRule::Weekly),
            PeriodSpec::new("monthly", ResetRule::Monthly),
        ]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    #[default]
    None,
    #[serde(alias = "anthropic-api")]
    Api,
    RelayedText,
    Manual,
}

impl Source {
    pub fn as_label(self) -> &'static str {
        match self {
            Source::None => "none",
            Source::Api => "api",
            Source::RelayedText => "relayed-text",
            Source::Manual => "manual",
        }
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Source::None),
            "api" | "anthropic-api" => Ok(Source::Api),
            "relayed-text" | "relayed" | "text" => Ok(Source::RelayedText),
            "manual" => Ok(Source::Manual),
            other => Err(format!(
                "Unsupported source '{other}'. Use none, api, relayed-text or manual."
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaWindow {
    pub used: f64,
    pub limit: f64,
    pub resets_at: DateTime<Utc>,
}

impl QuotaWindow {
    pub fn fresh(spec: &PeriodSpec, limit: f64, now: DateTime<Utc>) -> Self {
        Self {
            used: 0.0,
            limit,
            resets_at: next_reset(spec.rule, now),
        }
    }

    fn from_value(
        value: Option<&Value>,
        spec: &PeriodSpec,
        default_limit: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let Some(obj) = value.and_then(Value::as_object) else {
            return Self::fresh(spec, default_limit, now);
        };

        let used = obj
            .get("used")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
            .max(0.0);
        let limit = obj
            .get("limit")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(default_limit);

        let resets_at = obj
            .get("resetsAt")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(|| next_reset(spec.rule, now));

        Self {
            used,
            limit,
            resets_at,
        }
    }
}

/// Full persisted state: one window per tracked period plus write metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaRecord {
    pub windows: BTreeMap<String, QuotaWindow>,
    pub last_updated: DateTime<Utc>,
    pub source: Source,
}

impl QuotaRecord {
    pub fn fresh(periods: &[PeriodSpec], default_limit: f64, now: DateTime<Utc>) -> Self {
        let windows = periods
            .iter()
            .map(|spec| (spec.key.clone(), QuotaWindow::fresh(spec, default_limit, now)))
            .collect();
        Self {
            windows,
            last_updated: now,
            source: Source::None,
        }
    }

    /// Lenient decode of a stored record. Unknown keys are dropped and every
    /// configured period ends up present.
    pub fn from_value(
        value: &Value,
        periods: &[PeriodSpec],
        default_limit: f64,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let obj = value.as_object()?;

        let windows = periods
            .iter()
            .map(|spec| {
                (
                    spec.key.clone(),
                    QuotaWindow::from_value(obj.get(&spec.key), spec, default_limit, now),
                )
            })
            .collect();

        let last_updated = obj
            .get("lastUpdated")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or(now);
        let source: Source = obj
            .get("source")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Some(Self {
            windows,
            last_updated,
            source,
        })
    }
}

impl Serialize for QuotaRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.windows.len() + 2))?;
        for (key, window) in &self.windows {
            map.serialize_entry(key, window)?;
        }
        map.serialize_entry("lastUpdated", &self.last_updated)?;
        map.serialize_entry("source", &self.source)?;
        map.end()
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowPatch {
    pub used: Option<f64>,
    pub limit: Option<f64>,
    pub resets_at: Option<DateTime<Utc>>,
}

/// Absolute overrides keyed by period. Absent periods are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsagePatch {
    pub windows: BTreeMap<String, WindowPatch>,
}

impl UsagePatch {
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn entry(&mut self, key: &str) -> &mut WindowPatch {
        self.windows.entry(key.to_ascii_lowercase()).or_default()
    }

    pub fn set_used(mut self, key: &str, used: f64) -> Self {
        self.entry(key).used = Some(used);
        self
    }

    pub fn set_limit(mut self, key: &str, limit: f64) -> Self {
        self.entry(key).limit = Some(limit);
        self
    }

    /// Accepts the nested shape `{"daily": {"used": 40, "limit": 200}}` and the
    /// flat dashboard shape `{"daily": 40, "dailyLimit": 200}`. Fields that are
    /// not numbers are skipped.
    pub fn from_json(value: &Value) -> Self {
        let mut patch = UsagePatch::default();
        let Some(obj) = value.as_object() else {
            return patch;
        };

        for (key, field) in obj {
            if key == "source" || key == "lastUpdated" {
                continue;
            }
            if let Some(period) = key.strip_suffix("Limit").filter(|p| !p.is_empty()) {
                if let Some(limit) = field.as_f64() {
                    patch.entry(period).limit = Some(limit);
                }
                continue;
            }
            match field {
                Value::Number(n) => {
                    if let Some(used) = n.as_f64() {
                        patch.entry(key).used = Some(used);
                    }
                }
                Value::Object(inner) => patch.merge_object(key, inner),
                _ => {}
            }
        }

        patch.windows.retain(|_, w| *w != WindowPatch::default());
        patch
    }

    fn merge_object(&mut self, key: &str, inner: &Map<String, Value>) {
        let entry = self.entry(key);
        if let Some(used) = inner.get("used").and_then(Value::as_f64) {
            entry.used = Some(used);
        }
        if let Some(limit) = inner.get("limit").and_then(Value::as_f64) {
            entry.limit = Some(limit);
        }
        if let Some(at) = inner
            .get("resetsAt")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
        {
            entry.resets_at = Some(at);
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowView {
    pub used: f64,
    pub limit: f64,
    pub resets_at: DateTime<Utc>,
    pub percent: i64,
    pub remaining: f64,
    pub time_until_reset: String,
    pub resets_in: String,
}

impl WindowView {
    pub fn new(window: &QuotaWindow, now: DateTime<Utc>) -> Self {
        let time_until_reset = humanize(window.resets_at - now);
        Self {
            used: window.used,
            limit: window.limit,
            resets_at: window.resets_at,
            percent: percent_of(window.used, window.limit),
            remaining: window.limit - window.used,
            resets_in: time_until_reset.clone(),
            time_until_reset,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageView {
    #[serde(flatten)]
    pub windows: BTreeMap<String, WindowView>,
    pub last_updated: DateTime<Utc>,
    pub source: Source,
}

impl UsageView {
    pub fn new(record: &QuotaRecord, now: DateTime<Utc>) -> Self {
        Self {
            windows: record
                .windows
                .iter()
                .map(|(k, w)| (k.clone(), WindowView::new(w, now)))
                .collect(),
            last_updated: record.last_updated,
            source: record.source,
        }
    }

    pub fn window(&self, key: &str) -> Option<&WindowView> {
        self.windows.get(key)
    }
}

pub fn percent_of(used: f64, limit: f64) -> i64 {
    if limit <= 0.0 {
        return 0;
    }
    (used / limit * 100.0).round() as i64
}

pub fn humanize(delta: Duration) -> String {
    if delta <= Duration::zero() {
        return "now".into();
    }

    let hours = delta.num_hours();
    let minutes = delta.num_minutes() % 60;

    if hours >= 24 {
        return format!("{}d {}h", hours / 24, hours % 24);
    }
    format!("{hours}h {minutes}m")
}
