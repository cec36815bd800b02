//! Bulk ad-variant engine.
//!
//! Adds seasonal variant ads to ad groups across many advertiser accounts
//! while respecting the platform's per-group slot cap, and keeps the result
//! consistent afterwards: done-label audits with repair jobs, duplicate
//! removal and bulk activation. Jobs are persisted item by item so a paused
//! or crashed run resumes where it stopped.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
