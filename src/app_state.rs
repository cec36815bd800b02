use sqlx::PgPool;
use std::sync::Arc;

use crate::config::{AppConfig, ConfigError, EngineSettings};
use crate::db::queries::PgJobStore;
use crate::db::store::JobStore;
use crate::models::variant::VariantCatalog;
use crate::services::ads_api::{ApiError, RestAdsClient};
use crate::services::batcher::MutationBatcher;
use crate::services::processor::JobProcessor;
use crate::services::rate_limiter::{AdaptiveRateLimiter, TokioSleeper};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build ads platform client: {0}")]
    Client(#[from] ApiError),
}

/// Wire the Postgres job store, the REST platform client and the shared
/// rate limiter into a processor. Used by both the server and the worker.
pub fn build_processor(config: &AppConfig, pool: PgPool) -> Result<JobProcessor, StartupError> {
    let settings = config.engine_settings();
    let catalog = config.variant_catalog()?;
    tracing::info!(variants = ?catalog.names(), dry_run = settings.dry_run, "Variant catalogue loaded");

    let client = RestAdsClient::new(
        &config.ads_api_base_url,
        &config.ads_developer_token,
        &config.ads_access_token,
        config.ads_login_customer_id.as_deref(),
    )?;
    let limiter = Arc::new(AdaptiveRateLimiter::new(settings.rate_limiter.clone()));
    let batcher = MutationBatcher::new(
        Arc::new(client),
        limiter,
        Arc::new(TokioSleeper),
        settings.retry.clone(),
        settings.batcher_settings(),
    );

    Ok(JobProcessor::new(
        Arc::new(PgJobStore::new(pool)),
        Arc::new(batcher),
        Arc::new(catalog),
        settings,
    ))
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub processor: JobProcessor,
}

impl AppState {
    pub fn new(processor: JobProcessor) -> Self {
        Self { processor }
    }

    pub fn store(&self) -> &dyn JobStore {
        self.processor.store().as_ref()
    }

    pub fn batcher(&self) -> &MutationBatcher {
        self.processor.batcher()
    }

    pub fn catalog(&self) -> &VariantCatalog {
        self.processor.catalog()
    }

    pub fn settings(&self) -> &EngineSettings {
        self.processor.settings()
    }
}
