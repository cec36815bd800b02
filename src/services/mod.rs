pub mod activation;
pub mod ads_api;
pub mod audit;
pub mod batcher;
pub mod dedup;
pub mod labels;
pub mod planner;
pub mod prefetch;
pub mod processor;
pub mod rate_limiter;
pub mod retry;
