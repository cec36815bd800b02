use adslot_engine::{app_state, app_state::AppState, config::AppConfig, db, routes};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

fn describe_metrics() {
    metrics::describe_counter!("mutation_batches_total", "Mutate calls by outcome");
    metrics::describe_counter!("mutation_operations_total", "Mutate operations by outcome");
    metrics::describe_counter!("work_items_total", "Work items recorded by terminal status");
    metrics::describe_counter!("remote_retries_total", "Retried platform calls by error kind");
    metrics::describe_counter!("dedup_ads_removed_total", "Duplicate ads removed");
    metrics::describe_counter!("audit_violations_total", "Groups whose done label had no marker ad");
    metrics::describe_gauge!("rate_limiter_delay_seconds", "Current delay between mutate calls");
    metrics::describe_histogram!(
        "customer_pipeline_seconds",
        "Wall time of one customer's pipeline within a job run"
    );
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing adslot-engine server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.max_concurrent_customers)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let processor = app_state::build_processor(&config, db_pool).expect("Failed to initialize engine");
    let state = AppState::new(processor);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/jobs",
            post(routes::jobs::create_job).get(routes::jobs::list_jobs),
        )
        .route(
            "/api/v1/jobs/{job_id}",
            get(routes::jobs::get_job).delete(routes::jobs::delete_job),
        )
        .route("/api/v1/jobs/{job_id}/pause", post(routes::jobs::pause_job))
        .route("/api/v1/jobs/{job_id}/resume", post(routes::jobs::resume_job))
        .route("/api/v1/audit", post(routes::maintenance::run_audit))
        .route("/api/v1/audit/reset", post(routes::maintenance::reset_audit))
        .route("/api/v1/dedup", post(routes::maintenance::run_dedup))
        .route("/api/v1/activate", post(routes::maintenance::activate))
        .route("/api/v1/deactivate", post(routes::maintenance::deactivate))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024 * 1024)); // bulk job submissions

    tracing::info!("Starting adslot-engine on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
