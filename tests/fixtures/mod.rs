//! Scenario builders shared by the pipeline tests.
#![allow(dead_code)]

use adslot_engine::config::EngineSettings;
use adslot_engine::db::{JobStore, MemoryJobStore};
use adslot_engine::models::job::NewWorkItem;
use adslot_engine::models::remote::{AdContent, AdStatus};
use adslot_engine::models::variant::VariantCatalog;
use adslot_engine::services::ads_api::AdsPlatform;
use adslot_engine::services::batcher::MutationBatcher;
use adslot_engine::services::processor::JobProcessor;
use adslot_engine::services::rate_limiter::{AdaptiveRateLimiter, RecordingSleeper, Sleeper};
use std::sync::Arc;

use crate::helpers::FakeAdsPlatform;

pub const CUSTOMER: &str = "1111111111";
pub const OTHER_CUSTOMER: &str = "2222222222";

pub struct Engine {
    pub platform: Arc<FakeAdsPlatform>,
    pub store: Arc<MemoryJobStore>,
    pub sleeper: Arc<RecordingSleeper>,
    pub processor: JobProcessor,
}

impl Engine {
    pub fn batcher(&self) -> &MutationBatcher {
        self.processor.batcher()
    }

    pub fn catalog(&self) -> &VariantCatalog {
        self.processor.catalog()
    }
}

/// Small flush threshold so buffered writes are exercised.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        status_flush_threshold: 2,
        max_concurrent_customers: 2,
        ..EngineSettings::default()
    }
}

pub fn engine() -> Engine {
    engine_with(test_settings())
}

pub fn engine_with(settings: EngineSettings) -> Engine {
    let platform = Arc::new(FakeAdsPlatform::new());
    let store = Arc::new(MemoryJobStore::new());
    let sleeper = Arc::new(RecordingSleeper::new());

    let batcher = MutationBatcher::new(
        platform.clone() as Arc<dyn AdsPlatform>,
        Arc::new(AdaptiveRateLimiter::new(settings.rate_limiter.clone())),
        sleeper.clone() as Arc<dyn Sleeper>,
        settings.retry.clone(),
        settings.batcher_settings(),
    );
    let processor = JobProcessor::new(
        store.clone() as Arc<dyn JobStore>,
        Arc::new(batcher),
        Arc::new(VariantCatalog::builtin()),
        settings,
    );

    Engine {
        platform,
        store,
        sleeper,
        processor,
    }
}

/// Text of an ordinary (unmarked) ad.
pub fn baseline_content(n: u32) -> AdContent {
    AdContent {
        headlines: vec![
            format!("Running Shoes {n}"),
            "Free Shipping".to_string(),
            "Order Today".to_string(),
            "Top Brands".to_string(),
        ],
        descriptions: vec![format!("Shoes for every run, model {n}."), "Easy returns.".to_string()],
        final_urls: vec![format!("https://shop.example/shoes/{n}")],
        path1: "shoes".to_string(),
        path2: String::new(),
    }
}

pub fn work_item(customer_id: &str, group_id: &str, variant: &str) -> NewWorkItem {
    NewWorkItem {
        customer_id: customer_id.to_string(),
        group_id: group_id.to_string(),
        campaign_id: Some("900".to_string()),
        campaign_name: Some("Shoes".to_string()),
        variant_name: variant.to_string(),
    }
}

/// G1 (101) full of protected ads, G2 (102) full with a paused other-variant
/// ad whose done label it carries, G3 (103) already done for black friday.
pub fn seed_three_groups(platform: &FakeAdsPlatform) {
    for n in 1..=3 {
        platform.add_ad(CUSTOMER, "101", AdStatus::Enabled, baseline_content(n), &[]);
    }

    platform.add_ad(CUSTOMER, "102", AdStatus::Enabled, baseline_content(4), &[]);
    platform.add_ad(CUSTOMER, "102", AdStatus::Enabled, baseline_content(5), &[]);
    platform.add_ad(CUSTOMER, "102", AdStatus::Paused, baseline_content(6), &["THEME_CM"]);
    platform.add_group_label(CUSTOMER, "102", "THEME_CM_DONE");

    platform.add_ad(CUSTOMER, "103", AdStatus::Enabled, baseline_content(7), &[]);
    platform.add_group_label(CUSTOMER, "103", "THEME_BF_DONE");
}

pub fn three_group_items() -> Vec<NewWorkItem> {
    ["101", "102", "103"]
        .iter()
        .map(|g| work_item(CUSTOMER, g, "black_friday"))
        .collect()
}

/// `count` groups starting at `first_group`, each with one enabled baseline ad.
pub fn seed_simple_groups(platform: &FakeAdsPlatform, customer_id: &str, first_group: u32, count: u32) -> Vec<String> {
    (0..count)
        .map(|i| {
            let group = (first_group + i).to_string();
            platform.add_ad(customer_id, &group, AdStatus::Enabled, baseline_content(i), &[]);
            group
        })
        .collect()
}
