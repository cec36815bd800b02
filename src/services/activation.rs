//! Bulk switching of which ads serve in a group.
//!
//! Activating a variant pauses the baseline ads and ads of other variants,
//! then enables the variant's own paused ads. Deactivating does the reverse
//! for a single variant. Groups without any ad of the variant are left alone.

use serde::Serialize;

use crate::models::remote::{group_resource, AdStatus, MutateOperation, RemoteGroup};
use crate::models::variant::{VariantCatalog, VariantDefinition};
use crate::services::ads_api::ApiError;
use crate::services::batcher::MutationBatcher;
use crate::services::prefetch::PrefetchCache;

/// Groups switched per round of pause/enable calls.
pub const ACTIVATION_WAVE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("Ads platform error: {0}")]
    Api(#[from] ApiError),

    #[error("Unknown variant: {0}")]
    UnknownVariant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Activate,
    Deactivate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPlan {
    pub pause: Vec<String>,
    pub enable: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub customer_id: String,
    pub variant_name: String,
    pub direction: Direction,
    pub groups_switched: usize,
    pub paused: usize,
    pub enabled: usize,
    pub failed: usize,
}

pub fn plan_status_changes(
    group: &RemoteGroup,
    target: &VariantDefinition,
    catalog: &VariantCatalog,
    direction: Direction,
) -> StatusPlan {
    let mut plan = StatusPlan::default();
    if !group.live_ads.iter().any(|ad| ad.has_label(&target.marker_label)) {
        return plan;
    }

    for ad in &group.live_ads {
        let is_target = ad.has_label(&target.marker_label);
        let is_baseline = catalog.marker_count(ad) == 0;
        match (direction, ad.status) {
            (Direction::Activate, AdStatus::Enabled) if !is_target => plan.pause.push(ad.resource.clone()),
            (Direction::Activate, AdStatus::Paused) if is_target => plan.enable.push(ad.resource.clone()),
            (Direction::Deactivate, AdStatus::Enabled) if is_target => plan.pause.push(ad.resource.clone()),
            (Direction::Deactivate, AdStatus::Paused) if is_baseline => plan.enable.push(ad.resource.clone()),
            _ => {}
        }
    }
    plan
}

pub async fn switch_variant(
    batcher: &MutationBatcher,
    catalog: &VariantCatalog,
    customer_id: &str,
    variant_name: &str,
    direction: Direction,
    group_ids: &[String],
    chunk_size: usize,
) -> Result<ActivationReport, ActivationError> {
    let target = catalog
        .get(variant_name)
        .ok_or_else(|| ActivationError::UnknownVariant(variant_name.to_string()))?;

    let cache = if group_ids.is_empty() {
        PrefetchCache::load_account_ads(batcher, customer_id).await?
    } else {
        let groups: Vec<String> = group_ids.iter().map(|g| group_resource(customer_id, g)).collect();
        PrefetchCache::load(batcher, customer_id, &groups, chunk_size).await?
    };

    let mut keys: Vec<&String> = cache.groups.keys().collect();
    keys.sort();
    let plans: Vec<StatusPlan> = keys
        .into_iter()
        .map(|key| plan_status_changes(&cache.groups[key], target, catalog, direction))
        .filter(|plan| !plan.pause.is_empty() || !plan.enable.is_empty())
        .collect();

    let mut report = ActivationReport {
        customer_id: customer_id.to_string(),
        variant_name: target.name.clone(),
        direction,
        groups_switched: plans.len(),
        paused: 0,
        enabled: 0,
        failed: 0,
    };

    for (wave_index, wave) in plans.chunks(ACTIVATION_WAVE).enumerate() {
        let pause: Vec<MutateOperation> = wave
            .iter()
            .flat_map(|plan| plan.pause.iter())
            .map(|ad| MutateOperation::UpdateAdStatus {
                ad_resource: ad.clone(),
                status: AdStatus::Paused,
            })
            .collect();
        let outcome = batcher.execute(customer_id, &pause).await?;
        report.paused += outcome.succeeded();
        report.failed += outcome.failed();

        let enable: Vec<MutateOperation> = wave
            .iter()
            .flat_map(|plan| plan.enable.iter())
            .map(|ad| MutateOperation::UpdateAdStatus {
                ad_resource: ad.clone(),
                status: AdStatus::Enabled,
            })
            .collect();
        let outcome = batcher.execute(customer_id, &enable).await?;
        report.enabled += outcome.succeeded();
        report.failed += outcome.failed();

        tracing::debug!(customer_id, wave = wave_index, groups = wave.len(), "Status wave applied");
    }

    tracing::info!(
        customer_id,
        variant = %report.variant_name,
        direction = ?direction,
        groups = report.groups_switched,
        paused = report.paused,
        enabled = report.enabled,
        failed = report.failed,
        "Variant switch finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::remote::{AdContent, RemoteAd};

    fn ad(id: u64, status: AdStatus, labels: &[&str]) -> RemoteAd {
        RemoteAd {
            resource: format!("customers/1/adGroupAds/10~{id}"),
            group_resource: "customers/1/adGroups/10".into(),
            status,
            content: AdContent::default(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn group(ads: Vec<RemoteAd>) -> RemoteGroup {
        RemoteGroup {
            group_resource: "customers/1/adGroups/10".into(),
            live_ads: ads,
            ..Default::default()
        }
    }

    #[test]
    fn test_activate_pauses_everything_else() {
        let catalog = VariantCatalog::builtin();
        let target = catalog.get("black_friday").unwrap();
        let g = group(vec![
            ad(1, AdStatus::Enabled, &[]),
            ad(2, AdStatus::Enabled, &["THEME_CM"]),
            ad(3, AdStatus::Paused, &["THEME_BF"]),
        ]);

        let plan = plan_status_changes(&g, target, &catalog, Direction::Activate);
        assert_eq!(
            plan.pause,
            vec!["customers/1/adGroupAds/10~1", "customers/1/adGroupAds/10~2"]
        );
        assert_eq!(plan.enable, vec!["customers/1/adGroupAds/10~3"]);
    }

    #[test]
    fn test_deactivate_restores_baseline() {
        let catalog = VariantCatalog::builtin();
        let target = catalog.get("black_friday").unwrap();
        let g = group(vec![
            ad(1, AdStatus::Paused, &[]),
            ad(2, AdStatus::Paused, &["THEME_CM"]),
            ad(3, AdStatus::Enabled, &["THEME_BF"]),
        ]);

        let plan = plan_status_changes(&g, target, &catalog, Direction::Deactivate);
        assert_eq!(plan.pause, vec!["customers/1/adGroupAds/10~3"]);
        assert_eq!(plan.enable, vec!["customers/1/adGroupAds/10~1"]);
    }

    #[test]
    fn test_group_without_variant_untouched() {
        let catalog = VariantCatalog::builtin();
        let target = catalog.get("black_friday").unwrap();
        let g = group(vec![ad(1, AdStatus::Enabled, &[]), ad(2, AdStatus::Paused, &["THEME_CM"])]);

        let plan = plan_status_changes(&g, target, &catalog, Direction::Activate);
        assert_eq!(plan, StatusPlan::default());
    }
}
