//! Removal of ads whose text duplicates another live ad in the same group.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::models::remote::{group_resource, AdStatus, MutateOperation, RemoteAd, RemoteGroup};
use crate::models::variant::VariantCatalog;
use crate::services::ads_api::ApiError;
use crate::services::batcher::MutationBatcher;
use crate::services::prefetch::PrefetchCache;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupReport {
    pub customer_id: String,
    pub groups_scanned: usize,
    pub duplicate_sets: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Keep-priority of an ad within a duplicate set.
pub fn score(ad: &RemoteAd, catalog: &VariantCatalog) -> u32 {
    let markers = catalog.marker_count(ad) as u32;
    markers * 100 + u32::from(markers > 0) * 10 + u32::from(ad.status == AdStatus::Enabled)
}

/// Ads to remove from `group`: every member of a duplicate set except the
/// highest-scoring one. Equal scores keep the lowest ad id.
pub fn plan_dedup<'a>(group: &'a RemoteGroup, catalog: &VariantCatalog) -> (usize, Vec<&'a RemoteAd>) {
    let mut by_signature: BTreeMap<String, Vec<&RemoteAd>> = BTreeMap::new();
    for ad in group.live_ads.iter().filter(|ad| ad.status.is_servable()) {
        by_signature.entry(ad.content.signature()).or_default().push(ad);
    }

    let mut sets = 0;
    let mut removals = Vec::new();
    for members in by_signature.into_values().filter(|m| m.len() > 1) {
        sets += 1;
        let keeper = members
            .iter()
            .max_by_key(|ad| (score(ad, catalog), Reverse(ad.ad_id())))
            .map(|ad| ad.resource.clone());
        removals.extend(members.into_iter().filter(|ad| Some(&ad.resource) != keeper.as_ref()));
    }
    removals.sort_by_key(|ad| ad.ad_id());
    (sets, removals)
}

/// Deduplicate the given groups, or every group of the account when
/// `group_ids` is empty.
pub async fn run_dedup(
    batcher: &MutationBatcher,
    catalog: &VariantCatalog,
    customer_id: &str,
    group_ids: &[String],
    chunk_size: usize,
) -> Result<DedupReport, ApiError> {
    let cache = if group_ids.is_empty() {
        PrefetchCache::load_account_ads(batcher, customer_id).await?
    } else {
        let groups: Vec<String> = group_ids.iter().map(|g| group_resource(customer_id, g)).collect();
        PrefetchCache::load(batcher, customer_id, &groups, chunk_size).await?
    };

    let mut report = DedupReport {
        customer_id: customer_id.to_string(),
        groups_scanned: cache.groups.len(),
        ..Default::default()
    };

    let mut group_keys: Vec<&String> = cache.groups.keys().collect();
    group_keys.sort();
    let mut operations = Vec::new();
    for key in group_keys {
        let (sets, removals) = plan_dedup(&cache.groups[key], catalog);
        report.duplicate_sets += sets;
        operations.extend(removals.into_iter().map(|ad| MutateOperation::RemoveAd {
            ad_resource: ad.resource.clone(),
        }));
    }

    let outcome = batcher.execute(customer_id, &operations).await?;
    report.removed = outcome.succeeded();
    report.failed = outcome.failed();
    metrics::counter!("dedup_ads_removed_total").increment(report.removed as u64);

    tracing::info!(
        customer_id,
        groups = report.groups_scanned,
        duplicate_sets = report.duplicate_sets,
        removed = report.removed,
        failed = report.failed,
        "Dedup finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::remote::AdContent;

    fn ad(id: u64, status: AdStatus, headlines: &[&str], labels: &[&str]) -> RemoteAd {
        RemoteAd {
            resource: format!("customers/1/adGroupAds/10~{id}"),
            group_resource: "customers/1/adGroups/10".into(),
            status,
            content: AdContent {
                headlines: headlines.iter().map(|h| h.to_string()).collect(),
                descriptions: vec!["Same description".into()],
                ..Default::default()
            },
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
    fn test_score_weights() {
        let catalog = VariantCatalog::builtin();
        assert_eq!(score(&ad(1, AdStatus::Paused, &[], &[]), &catalog), 0);
        assert_eq!(score(&ad(1, AdStatus::Enabled, &[], &[]), &catalog), 1);
        assert_eq!(score(&ad(1, AdStatus::Paused, &[], &["THEME_BF"]), &catalog), 110);
        assert_eq!(
            score(&ad(1, AdStatus::Enabled, &[], &["THEME_BF", "THEME_CM", "OTHER"]), &catalog),
            211
        );
    }

    #[test]
    fn test_highest_score_kept() {
        let catalog = VariantCatalog::builtin();
        let g = group(vec![
            ad(1, AdStatus::Enabled, &["A", "B"], &[]),
            ad(2, AdStatus::Paused, &["B", "A"], &["THEME_BF"]),
            ad(3, AdStatus::Enabled, &["C"], &[]),
        ]);

        let (sets, removals) = plan_dedup(&g, &catalog);
        assert_eq!(sets, 1);
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].ad_id(), 1);
    }

    #[test]
    fn test_ties_keep_lowest_id() {
        let catalog = VariantCatalog::builtin();
        let g = group(vec![
            ad(7, AdStatus::Enabled, &["A"], &[]),
            ad(4, AdStatus::Enabled, &["A"], &[]),
            ad(9, AdStatus::Enabled, &["A"], &[]),
        ]);

        let (_, removals) = plan_dedup(&g, &catalog);
        let ids: Vec<u64> = removals.iter().map(|a| a.ad_id()).collect();
        assert_eq!(ids, vec![7, 9]);
    }

    #[test]
    fn test_unique_ads_untouched() {
        let catalog = VariantCatalog::builtin();
        let g = group(vec![ad(1, AdStatus::Enabled, &["A"], &[]), ad(2, AdStatus::Enabled, &["B"], &[])]);
        let (sets, removals) = plan_dedup(&g, &catalog);
        assert_eq!(sets, 0);
        assert!(removals.is_empty());
    }
}
