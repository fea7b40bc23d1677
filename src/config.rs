//! Configuration for caps, cost table, breakers and the fallback queue.
//!
//! Loaded from a YAML file (every field has a default) and then overridden
//! by `COSTGUARD_*` environment variables so operators can tune caps without
//! editing files.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::budget::{CostTable, MAX_AMOUNT_USD};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "COSTGUARD_CONFIG";

/// Longest accepted reservation TTL (30 days).
pub const MAX_RESERVATION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Fallback queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Attempts after which a job becomes terminally `failed`.
    pub max_attempts: u32,
    /// A `processing` job untouched for this long is assumed abandoned.
    pub processing_lease_secs: u64,
    /// Sleep between drain passes when running continuously.
    pub poll_interval_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            processing_lease_secs: 600,
            poll_interval_secs: 30,
        }
    }
}

impl QueueSettings {
    pub fn processing_lease(&self) -> Duration {
        Duration::from_secs(self.processing_lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database shared by every process using the gates.
    pub db_path: PathBuf,

    pub daily_cap_usd: f64,
    pub monthly_cap_usd: f64,

    /// Offset of the time zone that defines calendar days, e.g. `+02:00`.
    pub utc_offset: String,

    /// Reservations not settled within this many seconds stop counting.
    pub reservation_ttl_secs: u64,

    /// service -> operation -> estimated unit cost (USD).
    pub cost_table: BTreeMap<String, BTreeMap<String, f64>>,

    /// Breaker defaults applied to every service.
    pub breaker: BreakerConfig,

    /// Per-service breaker overrides.
    pub breakers: HashMap<String, BreakerConfig>,

    pub queue: QueueSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".costguard/costguard.db"),
            daily_cap_usd: 25.0,
            monthly_cap_usd: 500.0,
            utc_offset: "+00:00".to_string(),
            reservation_ttl_secs: 900,
            cost_table: BTreeMap::new(),
            breaker: BreakerConfig::default(),
            breakers: HashMap::new(),
            queue: QueueSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// `path` wins over `COSTGUARD_CONFIG`. A missing file is only an error
    /// when it was named explicitly; otherwise defaults apply. Environment
    /// overrides are applied last and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `COSTGUARD_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup("COSTGUARD_DB") {
            self.db_path = PathBuf::from(db);
        }
        if let Some(raw) = lookup("COSTGUARD_DAILY_CAP_USD") {
            self.daily_cap_usd = parse_usd("COSTGUARD_DAILY_CAP_USD", &raw)?;
        }
        if let Some(raw) = lookup("COSTGUARD_MONTHLY_CAP_USD") {
            self.monthly_cap_usd = parse_usd("COSTGUARD_MONTHLY_CAP_USD", &raw)?;
        }
        if let Some(offset) = lookup("COSTGUARD_UTC_OFFSET") {
            self.utc_offset = offset;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_cap("daily_cap_usd", self.daily_cap_usd)?;
        check_cap("monthly_cap_usd", self.monthly_cap_usd)?;
        self.offset()?;

        if !(1..=MAX_RESERVATION_TTL_SECS).contains(&self.reservation_ttl_secs) {
            return Err(ConfigError::invalid(
                "reservation_ttl_secs",
                format!("must be between 1 and {}", MAX_RESERVATION_TTL_SECS),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "queue.max_attempts",
                "must be at least 1",
            ));
        }

        self.breaker
            .validate()
            .map_err(|reason| ConfigError::invalid("breaker", reason))?;
        for (name, breaker) in &self.breakers {
            breaker
                .validate()
                .map_err(|reason| ConfigError::invalid(format!("breakers.{}", name), reason))?;
        }

        for (service, ops) in &self.cost_table {
            for (operation, cost) in ops {
                if !cost.is_finite() || !(0.0..=MAX_AMOUNT_USD).contains(cost) {
                    return Err(ConfigError::invalid(
                        format!("cost_table.{}.{}", service, operation),
                        format!("cost must be between 0 and {}", MAX_AMOUNT_USD),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Time zone offset defining calendar day and month boundaries.
    pub fn offset(&self) -> Result<FixedOffset, ConfigError> {
        parse_offset(&self.utc_offset)
            .ok_or_else(|| ConfigError::invalid("utc_offset", format!("'{}' is not ±HH:MM", self.utc_offset)))
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn cost_table(&self) -> CostTable {
        CostTable::from_nested(&self.cost_table)
    }
}

fn parse_usd(key: &str, raw: &str) -> Result<f64, ConfigError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|e| ConfigError::invalid(key, e.to_string()))
}

fn check_cap(key: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(key, "cap must be a non-negative number"));
    }
    Ok(())
}

/// Parse `Z`, `UTC`, `+HH:MM`, `-HH:MM` or `+HHMM`.
fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.daily_cap_usd, 25.0);
        assert_eq!(config.monthly_cap_usd, 500.0);
        assert_eq!(config.offset().unwrap().local_minus_utc(), 0);
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
daily_cap_usd: 10.5
utc_offset: "-05:00"
cost_table:
  image-gen:
    generate: 0.04
breaker:
  failure_threshold: 5
breakers:
  doc-render:
    failure_threshold: 2
    reset_timeout_ms: 1000
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.daily_cap_usd, 10.5);
        assert_eq!(config.monthly_cap_usd, 500.0);
        assert_eq!(config.offset().unwrap().local_minus_utc(), -5 * 3600);
        assert_eq!(config.breaker.failure_threshold, 5);
        // Unset breaker fields keep their defaults
        assert_eq!(config.breaker.call_timeout_ms, BreakerConfig::default().call_timeout_ms);

        let doc = &config.breakers["doc-render"];
        assert_eq!(doc.failure_threshold, 2);
        assert_eq!(doc.reset_timeout_ms, 1000);
        assert!(!config.breakers.contains_key("image-gen"));

        let table = config.cost_table();
        assert_eq!(table.get("image-gen", "generate"), Some(0.04));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("COSTGUARD_DB", "/tmp/ledger.db"),
            ("COSTGUARD_DAILY_CAP_USD", "12.5"),
            ("COSTGUARD_UTC_OFFSET", "+09:30"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/ledger.db"));
        assert_eq!(config.daily_cap_usd, 12.5);
        assert_eq!(config.offset().unwrap().local_minus_utc(), 9 * 3600 + 30 * 60);
    }

    #[test]
    fn test_bad_env_cap_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "COSTGUARD_MONTHLY_CAP_USD").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("COSTGUARD_MONTHLY_CAP_USD"));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.daily_cap_usd = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.utc_offset = "CET".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config
            .cost_table
            .entry("svc".to_string())
            .or_default()
            .insert("op".to_string(), f64::NAN);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reservation_ttl_bounds() {
        let mut config = Config::default();
        config.reservation_ttl_secs = 0;
        assert!(config.validate().is_err());

        config.reservation_ttl_secs = 100_000_000_000_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reservation_ttl_secs"));

        config.reservation_ttl_secs = MAX_RESERVATION_TTL_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_cost_table_entry_is_rejected() {
        let mut config = Config::default();
        config
            .cost_table
            .entry("svc".to_string())
            .or_default()
            .insert("op".to_string(), 1e13);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_offset_forms() {
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("+0200").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_offset("-03:30").unwrap().local_minus_utc(), -12600);
        assert!(parse_offset("+25:00").is_none());
        assert!(parse_offset("02:00").is_none());
    }

    #[test]
    fn test_missing_explicit_file_errors() {
        let err = Config::load(Some(Path::new("/nonexistent/costguard.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
