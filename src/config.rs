use crate::error::AppError;
use crate::models::{PeriodSpec, ResetRule, BUILT_IN_PERIODS};
use crate::schedule::MAX_ROLLING_HOURS;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "quota-meter";
pub const API_KEY_ACCOUNT: &str = "provider:anthropic";

pub fn normalize_period_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("QUOTA_METER_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "neubell", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".quota-meter"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Json,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub refresh_seconds: u64,
    pub session_hours: i64,
    pub default_limit: f64,
    pub backend: BackendKind,
    pub listen: String,
    pub api: ApiSettings,
    pub extra_periods: Vec<ExtraPeriod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: Option<String>,
    pub model: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "claude-3-haiku-20240307".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtraPeriod {
    pub key: String,
    pub every_hours: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            refresh_seconds: 60,
            session_hours: 4,
            default_limit: 100.0,
            backend: BackendKind::Json,
            listen: "127.0.0.1:3000".into(),
            api: ApiSettings::default(),
            extra_periods: vec![],
        }
    }
}

impl AppConfig {
    /// Period keys tracked by this configuration, built-ins first.
    pub fn periods(&self) -> Vec<PeriodSpec> {
        let mut periods = PeriodSpec::built_ins(self.session_hours.max(1));

        for extra in &self.extra_periods {
            periods.push(PeriodSpec::new(
                &extra.key,
                ResetRule::Rolling {
                    hours: extra.every_hours,
                },
            ));
        }
        periods
    }

    pub fn default_limit(&self) -> f64 {
        if self.default_limit.is_finite() && self.default_limit > 0.0 {
            self.default_limit
        } else {
            100.0
        }
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn state_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("usage.json"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("usage.sqlite"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn migrate_legacy_api_key(raw: &mut toml::Value) -> Result<bool, AppError> {
    let Some(api) = raw.get_mut("api").and_then(toml::Value::as_table_mut) else {
        return Ok(false);
    };

    let api_key = api
        .get("api_key")
        .and_then(toml::Value::as_str)
        .map(ToString::to_string);

    if let Some(key) = api_key {
        if !key.is_empty() {
            set_api_key(&key)?;
        }
        api.remove("api_key");
        return Ok(true);
    }

    Ok(false)
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    if config.session_hours < 1 {
        config.session_hours = 4;
        changed = true;
    } else if config.session_hours > MAX_ROLLING_HOURS {
        config.session_hours = MAX_ROLLING_HOURS;
        changed = true;
    }

    let mut extras: Vec<ExtraPeriod> = Vec::new();
    for period in std::mem::take(&mut config.extra_periods) {
        let key = normalize_period_key(&period.key);
        if key != period.key {
            changed = true;
        }
        let reserved = BUILT_IN_PERIODS.contains(&key.as_str())
            || key == "lastupdated"
            || key == "source";
        if key.is_empty()
            || reserved
            || period.every_hours < 1
            || extras.iter().any(|p| p.key == key)
        {
            changed = true;
            continue;
        }
        if period.every_hours > MAX_ROLLING_HOURS {
            changed = true;
        }
        extras.push(ExtraPeriod {
            key,
            every_hours: period.every_hours.min(MAX_ROLLING_HOURS),
        });
    }
    config.extra_periods = extras;

    changed
}

pub fn load_config() -> Result<AppConfig, AppError> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let raw_str = fs::read_to_string(&path)?;
    let mut raw_toml: toml::Value = toml::from_str(&raw_str)?;
    let migrated = migrate_legacy_api_key(&mut raw_toml)?;

    let mut parsed: AppConfig = raw_toml.clone().try_into()?;
    let normalized = normalize_config(&mut parsed);

    if normalized {
        save_config(&parsed)?;
    } else if migrated {
        fs::write(path, toml::to_string_pretty(&raw_toml)?)?;
    }

    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

pub fn set_api_key(key: &str) -> Result<(), AppError> {
    let entry = keyring::Entry::new(SERVICE_NAME, API_KEY_ACCOUNT)?;
    entry.set_password(key)?;
    Ok(())
}

pub fn get_api_key() -> Result<String, AppError> {
    if let Ok(value) = std::env::var("ANTHROPIC_API_KEY") {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    let entry = keyring::Entry::new(SERVICE_NAME, API_KEY_ACCOUNT)?;
    if let Ok(value) = entry.get_password() {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    Err(AppError::Config(
        "ANTHROPIC_API_KEY not found. Run `quota-meter set-key` or set the env var.".into(),
    ))
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_period_key_trims_and_lowercases() {
        assert_eq!(normalize_period_key(" FiveHour "), "fivehour");
    }

    #[test]
    fn normalize_config_drops_reserved_and_duplicate_periods() {
        let mut cfg = AppConfig {
            session_hours: 0,
            extra_periods: vec![
                ExtraPeriod {
                    key: " Opus ".into(),
                    every_hours: 5,
                },
                ExtraPeriod {
                    key: "opus".into(),
                    every_hours: 8,
                },
                ExtraPeriod {
                    key: "Daily".into(),
                    every_hours: 24,
                },
                ExtraPeriod {
                    key: "burst".into(),
                    every_hours: 0,
                },
            ],
            ..AppConfig::default()
        };

        let changed = normalize_config(&mut cfg);
        assert!(changed);
        assert_eq!(cfg.session_hours, 4);
        assert_eq!(
            cfg.extra_periods,
            vec![ExtraPeriod {
                key: "opus".into(),
                every_hours: 5,
            }]
        );
    }

    #[test]
    fn normalize_config_caps_oversized_rolling_hours() {
        let mut cfg = AppConfig {
            session_hours: i64::MAX,
            extra_periods: vec![ExtraPeriod {
                key: "opus".into(),
                every_hours: i64::MAX,
            }],
            ..AppConfig::default()
        };

        assert!(normalize_config(&mut cfg));
        assert_eq!(cfg.session_hours, MAX_ROLLING_HOURS);
        assert_eq!(cfg.extra_periods[0].every_hours, MAX_ROLLING_HOURS);
        assert!(!normalize_config(&mut cfg));
    }

    #[test]
    fn periods_lists_built_ins_then_extras() {
        let cfg = AppConfig {
            session_hours: 5,
            extra_periods: vec![ExtraPeriod {
                key: "opus".into(),
                every_hours: 12,
            }],
            ..AppConfig::default()
        };

        let periods = cfg.periods();
        let keys: Vec<&str> = periods.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["session", "daily", "weekly", "monthly", "opus"]);
        assert_eq!(periods[0].rule, ResetRule::Rolling { hours: 5 });
        assert_eq!(periods[4].rule, ResetRule::Rolling { hours: 12 });
    }

    #[test]
    fn default_limit_falls_back_when_not_positive() {
        let cfg = AppConfig {
            default_limit: -3.0,
            ..AppConfig::default()
        };
        assert_eq!(cfg.default_limit(), 100.0);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let cfg = AppConfig {
            backend: BackendKind::Sqlite,
            ..AppConfig::default()
        };
        let raw = toml::to_string_pretty(&cfg).expect("serialize config");
        let parsed: AppConfig = toml::from_str(&raw).expect("parse config");
        assert_eq!(parsed.backend, BackendKind::Sqlite);
        assert_eq!(parsed.listen, "127.0.0.1:3000");
    }
}
