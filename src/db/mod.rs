use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Connection pool for the job store. Each customer pipeline holds at most
/// one connection while flushing, plus a few for the API and pause checks.
pub async fn init_pool(database_url: &str, concurrent_customers: usize) -> Result<PgPool, sqlx::Error> {
    let max_connections = u32::try_from(concurrent_customers).unwrap_or(u32::MAX).saturating_add(4);
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
}

/// Apply `migrations/` (jobs and work items).
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

pub mod memory;
pub mod queries;
pub mod store;

pub use memory::MemoryJobStore;
pub use queries::PgJobStore;
pub use store::{JobStore, StoreError};
