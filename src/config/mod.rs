use garde::Validate;
use serde::Deserialize;
use std::path::Path;

use crate::models::variant::{CatalogError, VariantCatalog, VariantDefinition};
use crate::services::batcher::BatcherSettings;
use crate::services::planner::SLOT_CAP;
use crate::services::rate_limiter::RateLimiterSettings;
use crate::services::retry::{Backoff, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Failed to read variants file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid variants file: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Rate limiter min delay {min}s is above max delay {max}s")]
    DelayRange { min: f64, max: f64 },
}

/// Longest delay, in seconds, any backoff or limiter setting may ask for.
const MAX_DELAY_SECS: f64 = 3600.0;

fn delay_secs(value: &f64, _ctx: &()) -> garde::Result {
    if value.is_finite() && (0.0..=MAX_DELAY_SECS).contains(value) {
        Ok(())
    } else {
        Err(garde::Error::new(format!("must be between 0 and {MAX_DELAY_SECS} seconds")))
    }
}

fn growth_factor(value: &f64, _ctx: &()) -> garde::Result {
    if value.is_finite() && (1.0..=10.0).contains(value) {
        Ok(())
    } else {
        Err(garde::Error::new("must be between 1 and 10"))
    }
}

fn shrink_factor(value: &f64, _ctx: &()) -> garde::Result {
    if value.is_finite() && *value > 0.0 && *value <= 1.0 {
        Ok(())
    } else {
        Err(garde::Error::new("must be above 0 and at most 1"))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[garde(skip)]
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(skip)]
    pub database_url: String,

    /// Base url of the ads platform REST API, including the version segment
    #[garde(skip)]
    #[serde(default = "default_ads_api_base_url")]
    pub ads_api_base_url: String,

    #[garde(skip)]
    pub ads_developer_token: String,

    /// OAuth access token sent as a bearer token
    #[garde(skip)]
    pub ads_access_token: String,

    /// Manager account the requests are made on behalf of
    #[garde(skip)]
    #[serde(default)]
    pub ads_login_customer_id: Option<String>,

    #[garde(range(min = 1, max = 100))]
    #[serde(default = "default_max_concurrent_customers")]
    pub max_concurrent_customers: usize,

    #[garde(range(min = 1, max = 10_000))]
    #[serde(default = "default_query_chunk_size")]
    pub query_chunk_size: usize,

    #[garde(range(min = 1, max = 10_000))]
    #[serde(default = "default_mutation_chunk_size")]
    pub mutation_chunk_size: usize,

    #[garde(range(min = 1, max = 10_000))]
    #[serde(default = "default_mutation_floor_size")]
    pub mutation_floor_size: usize,

    #[garde(skip)]
    #[serde(default = "default_true")]
    pub partial_failure: bool,

    #[garde(custom(delay_secs))]
    #[serde(default = "default_initial_delay")]
    pub rate_limiter_initial_delay_secs: f64,

    #[garde(custom(delay_secs))]
    #[serde(default = "default_min_delay")]
    pub rate_limiter_min_delay_secs: f64,

    #[garde(custom(delay_secs))]
    #[serde(default = "default_max_delay")]
    pub rate_limiter_max_delay_secs: f64,

    #[garde(custom(growth_factor))]
    #[serde(default = "default_increase_factor")]
    pub rate_limiter_increase_factor: f64,

    #[garde(custom(shrink_factor))]
    #[serde(default = "default_decrease_factor")]
    pub rate_limiter_decrease_factor: f64,

    #[garde(range(min = 1, max = 10))]
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[garde(custom(delay_secs))]
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: f64,

    #[garde(custom(growth_factor))]
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,

    #[garde(custom(delay_secs))]
    #[serde(default = "default_rate_limited_base_delay")]
    pub rate_limited_base_delay_secs: f64,

    #[garde(custom(growth_factor))]
    #[serde(default = "default_rate_limited_backoff_factor")]
    pub rate_limited_backoff_factor: f64,

    /// Buffered item updates written per store round-trip
    #[garde(range(min = 1))]
    #[serde(default = "default_status_flush_threshold")]
    pub status_flush_threshold: usize,

    /// Batch size recorded on repair jobs created by the audit
    #[garde(range(min = 1, max = 10_000))]
    #[serde(default = "default_repair_batch_size")]
    pub repair_batch_size: i32,

    /// JSON array of variant definitions; the built-in catalogue when unset
    #[garde(skip)]
    #[serde(default)]
    pub variants_path: Option<String>,

    /// Group label marking groups that passed the audit
    #[garde(length(min = 1, max = 80))]
    #[serde(default = "default_audited_label")]
    pub audited_label: String,

    #[garde(skip)]
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    /// Plan and report without sending mutations
    #[garde(skip)]
    #[serde(default)]
    pub dry_run: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_ads_api_base_url() -> String {
    "https://googleads.googleapis.com/v17".to_string()
}

fn default_max_concurrent_customers() -> usize {
    5
}

fn default_query_chunk_size() -> usize {
    5000
}

fn default_mutation_chunk_size() -> usize {
    1000
}

fn default_mutation_floor_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_initial_delay() -> f64 {
    2.0
}

fn default_min_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    30.0
}

fn default_increase_factor() -> f64 {
    2.0
}

fn default_decrease_factor() -> f64 {
    0.98
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> f64 {
    2.0
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

fn default_rate_limited_base_delay() -> f64 {
    60.0
}

fn default_rate_limited_backoff_factor() -> f64 {
    3.0
}

fn default_status_flush_threshold() -> usize {
    1000
}

fn default_repair_batch_size() -> i32 {
    100
}

fn default_audited_label() -> String {
    "THEMES_CHECK_DONE".to_string()
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    /// Field rules plus the limiter's min/max ordering.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.rate_limiter_min_delay_secs > self.rate_limiter_max_delay_secs {
            return Err(ConfigError::DelayRange {
                min: self.rate_limiter_min_delay_secs,
                max: self.rate_limiter_max_delay_secs,
            });
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_concurrent_customers: self.max_concurrent_customers.max(1),
            query_chunk_size: self.query_chunk_size.max(1),
            mutation_chunk_size: self.mutation_chunk_size.max(1),
            mutation_floor_size: self.mutation_floor_size.max(1),
            partial_failure: self.partial_failure,
            dry_run: self.dry_run,
            rate_limiter: RateLimiterSettings {
                initial_delay_secs: self.rate_limiter_initial_delay_secs,
                min_delay_secs: self.rate_limiter_min_delay_secs,
                max_delay_secs: self.rate_limiter_max_delay_secs,
                increase_factor: self.rate_limiter_increase_factor,
                decrease_factor: self.rate_limiter_decrease_factor,
            },
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts.max(1),
                rate_limited: Backoff {
                    base_delay_secs: self.rate_limited_base_delay_secs,
                    factor: self.rate_limited_backoff_factor,
                },
                transient: Backoff {
                    base_delay_secs: self.retry_base_delay_secs,
                    factor: self.retry_backoff_factor,
                },
            },
            status_flush_threshold: self.status_flush_threshold.max(1),
            repair_batch_size: self.repair_batch_size,
            audited_label: self.audited_label.clone(),
            slot_cap: SLOT_CAP,
        }
    }

    /// Variants from `variants_path`, or the built-in catalogue.
    pub fn variant_catalog(&self) -> Result<VariantCatalog, ConfigError> {
        match &self.variants_path {
            Some(path) => load_catalog(Path::new(path)),
            None => Ok(VariantCatalog::builtin()),
        }
    }
}

pub fn load_catalog(path: &Path) -> Result<VariantCatalog, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let definitions: Vec<VariantDefinition> = serde_json::from_str(&raw)?;
    Ok(VariantCatalog::new(definitions)?)
}

/// Runtime knobs of the engine, independent of where they were read from.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub max_concurrent_customers: usize,
    pub query_chunk_size: usize,
    pub mutation_chunk_size: usize,
    pub mutation_floor_size: usize,
    pub partial_failure: bool,
    pub dry_run: bool,
    pub rate_limiter: RateLimiterSettings,
    pub retry: RetryPolicy,
    pub status_flush_threshold: usize,
    pub repair_batch_size: i32,
    pub audited_label: String,
    pub slot_cap: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_customers: default_max_concurrent_customers(),
            query_chunk_size: default_query_chunk_size(),
            mutation_chunk_size: default_mutation_chunk_size(),
            mutation_floor_size: default_mutation_floor_size(),
            partial_failure: true,
            dry_run: false,
            rate_limiter: RateLimiterSettings::default(),
            retry: RetryPolicy::default(),
            status_flush_threshold: default_status_flush_threshold(),
            repair_batch_size: default_repair_batch_size(),
            audited_label: default_audited_label(),
            slot_cap: SLOT_CAP,
        }
    }
}

impl EngineSettings {
    pub fn batcher_settings(&self) -> BatcherSettings {
        BatcherSettings {
            chunk_size: self.mutation_chunk_size,
            floor_size: self.mutation_floor_size,
            partial_failure: self.partial_failure,
            dry_run: self.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_env() -> Vec<(String, String)> {
        vec![
            ("DATABASE_URL".into(), "postgres://localhost/adslot".into()),
            ("ADS_DEVELOPER_TOKEN".into(), "dev".into()),
            ("ADS_ACCESS_TOKEN".into(), "token".into()),
        ]
    }

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config: AppConfig = envy::from_iter(minimal_env()).unwrap();
        assert_eq!(config.engine_settings(), EngineSettings::default());
        assert_eq!(config.worker_poll_interval_ms, 1000);
        assert!(config.variants_path.is_none());
    }

    #[test]
    fn test_overrides_flow_into_engine_settings() {
        let mut env = minimal_env();
        env.push(("MAX_CONCURRENT_CUSTOMERS".into(), "2".into()));
        env.push(("RATE_LIMITER_MIN_DELAY_SECS".into(), "0.5".into()));
        env.push(("DRY_RUN".into(), "true".into()));

        let settings = envy::from_iter::<_, AppConfig>(env).unwrap().engine_settings();
        assert_eq!(settings.max_concurrent_customers, 2);
        assert_eq!(settings.rate_limiter.min_delay_secs, 0.5);
        assert!(settings.batcher_settings().dry_run);
    }

    #[test]
    fn test_defaults_pass_checks() {
        let config: AppConfig = envy::from_iter(minimal_env()).unwrap();
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_bad_delays_and_factors_rejected() {
        for (key, value) in [
            ("RATE_LIMITER_MIN_DELAY_SECS", "-1"),
            ("RETRY_BASE_DELAY_SECS", "NaN"),
            ("RATE_LIMITED_BASE_DELAY_SECS", "inf"),
            ("RATE_LIMITER_DECREASE_FACTOR", "0"),
            ("RETRY_BACKOFF_FACTOR", "0.5"),
            ("RETRY_MAX_ATTEMPTS", "0"),
        ] {
            let mut env = minimal_env();
            env.push((key.into(), value.into()));
            let config: AppConfig = envy::from_iter(env).unwrap();
            assert!(
                matches!(config.check(), Err(ConfigError::Invalid(_))),
                "{key}={value} accepted"
            );
        }
    }

    #[test]
    fn test_min_delay_above_max_rejected() {
        let mut env = minimal_env();
        env.push(("RATE_LIMITER_MIN_DELAY_SECS".into(), "40".into()));
        let config: AppConfig = envy::from_iter(env).unwrap();
        assert!(matches!(
            config.check(),
            Err(ConfigError::DelayRange { min, max }) if min == 40.0 && max == 30.0
        ));
    }

    #[test]
    fn test_builtin_catalog_without_path() {
        let config: AppConfig = envy::from_iter(minimal_env()).unwrap();
        assert_eq!(config.variant_catalog().unwrap().names().len(), 5);
    }

    #[test]
    fn test_load_catalog_from_file() {
        let path = std::env::temp_dir().join(format!("variants-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"name": "summer", "marker_label": "THEME_SU", "done_label": "THEME_SU_DONE"}]"#,
        )
        .unwrap();

        let catalog = load_catalog(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(catalog.names(), vec!["summer".to_string()]);
    }
}
