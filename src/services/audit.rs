//! After-the-fact verification of done labels.
//!
//! A group carrying a variant's done label must hold a live ad with that
//! variant's marker. Violations lose the done label and are queued as a
//! repair job; clean groups get the audited label so later passes skip them.

use serde::Serialize;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::db::store::{JobStore, StoreError};
use crate::models::job::NewWorkItem;
use crate::models::remote::resource_id;
use crate::models::variant::{VariantCatalog, VariantDefinition};
use crate::services::ads_api::ApiError;
use crate::services::batcher::MutationBatcher;
use crate::services::labels::{ensure_labels, LabelReconciler};
use crate::services::prefetch::{fetch_groups_with_labels, fetch_labels, PrefetchCache};

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Ads platform error: {0}")]
    Api(#[from] ApiError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown variant: {0}")]
    UnknownVariant(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub group_resource: String,
    pub variant_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub customer_id: String,
    pub groups_checked: usize,
    pub groups_already_audited: usize,
    /// Candidates whose prefetch failed; neither judged nor marked.
    pub groups_unreadable: usize,
    pub violations: Vec<Violation>,
    pub labels_removed: usize,
    pub groups_marked_audited: usize,
    pub repair_job_id: Option<Uuid>,
}

/// Variants named in `names`, or the whole catalogue when empty.
pub fn select_variants<'a>(
    catalog: &'a VariantCatalog,
    names: &[String],
) -> Result<Vec<&'a VariantDefinition>, String> {
    if names.is_empty() {
        return Ok(catalog.iter().collect());
    }
    names
        .iter()
        .map(|name| catalog.get(name).ok_or_else(|| name.clone()))
        .collect()
}

pub async fn run_audit(
    batcher: &MutationBatcher,
    store: &dyn JobStore,
    catalog: &VariantCatalog,
    settings: &EngineSettings,
    customer_id: &str,
    variant_names: &[String],
) -> Result<AuditReport, AuditError> {
    let variants = select_variants(catalog, variant_names).map_err(AuditError::UnknownVariant)?;
    let mut report = AuditReport {
        customer_id: customer_id.to_string(),
        ..Default::default()
    };

    let mut labels = fetch_labels(batcher, customer_id).await?;
    ensure_labels(batcher, customer_id, &mut labels, &[settings.audited_label.clone()]).await?;

    let audited_resource = labels.resource(&settings.audited_label).map(str::to_string);
    let mut wanted: Vec<String> = variants
        .iter()
        .filter_map(|v| labels.resource(&v.done_label).map(str::to_string))
        .collect();
    if wanted.is_empty() {
        tracing::info!(customer_id, "No done labels exist yet, nothing to audit");
        return Ok(report);
    }
    wanted.extend(audited_resource.clone());

    let carrying = fetch_groups_with_labels(batcher, customer_id, wanted).await?;
    let mut candidates: BTreeSet<String> = BTreeSet::new();
    for (group, resources) in &carrying {
        let audited = audited_resource
            .as_ref()
            .is_some_and(|res| resources.contains(res));
        if audited {
            report.groups_already_audited += 1;
        } else {
            candidates.insert(group.clone());
        }
    }
    let candidates: Vec<String> = candidates.into_iter().collect();
    let cache = PrefetchCache::load(batcher, customer_id, &candidates, settings.query_chunk_size).await?;

    let mut clean: Vec<(String, String)> = Vec::new();
    for group_resource in &candidates {
        if !cache.is_readable(group_resource) {
            report.groups_unreadable += 1;
            continue;
        }
        let Some(group) = cache.group(group_resource) else {
            continue;
        };
        report.groups_checked += 1;

        let mut violated = false;
        for variant in &variants {
            if !group.labels.contains(&variant.done_label) {
                continue;
            }
            let has_marker_ad = group.live_ads.iter().any(|ad| ad.has_label(&variant.marker_label));
            if !has_marker_ad {
                violated = true;
                report.violations.push(Violation {
                    group_resource: group_resource.clone(),
                    variant_name: variant.name.clone(),
                });
            }
        }
        if !violated {
            clean.push((group_resource.clone(), settings.audited_label.clone()));
        }
    }

    metrics::counter!("audit_violations_total").increment(report.violations.len() as u64);

    let reconciler = LabelReconciler::new(batcher, customer_id, &cache.labels);
    let stale: Vec<(String, String)> = report
        .violations
        .iter()
        .filter_map(|v| {
            catalog
                .get(&v.variant_name)
                .map(|variant| (v.group_resource.clone(), variant.done_label.clone()))
        })
        .collect();
    let removed = reconciler.remove_group_labels(&stale).await?;
    report.labels_removed = removed.iter().filter(|r| r.is_ok()).count();

    let marked = reconciler.attach_group_labels(&clean).await?;
    report.groups_marked_audited = marked.iter().filter(|r| r.is_ok()).count();

    if !report.violations.is_empty() && !settings.dry_run {
        let items: Vec<NewWorkItem> = report
            .violations
            .iter()
            .map(|v| NewWorkItem {
                customer_id: customer_id.to_string(),
                group_id: resource_id(&v.group_resource).to_string(),
                campaign_id: None,
                campaign_name: None,
                variant_name: v.variant_name.clone(),
            })
            .collect();
        let job = store.create_job(&items, settings.repair_batch_size, true).await?;
        report.repair_job_id = Some(job.id);
    }

    tracing::info!(
        customer_id,
        checked = report.groups_checked,
        already_audited = report.groups_already_audited,
        unreadable = report.groups_unreadable,
        violations = report.violations.len(),
        labels_removed = report.labels_removed,
        marked = report.groups_marked_audited,
        repair_job_id = ?report.repair_job_id,
        "Audit finished"
    );
    Ok(report)
}

/// Remove the audited label from every group of the account so the next
/// audit re-checks them. Returns the number of groups reset.
pub async fn reset_audit_markers(
    batcher: &MutationBatcher,
    customer_id: &str,
    audited_label: &str,
) -> Result<usize, ApiError> {
    let labels = fetch_labels(batcher, customer_id).await?;
    let Some(resource) = labels.resource(audited_label) else {
        return Ok(0);
    };

    let groups = fetch_groups_with_labels(batcher, customer_id, vec![resource.to_string()]).await?;
    let mut pairs: Vec<(String, String)> = groups
        .into_keys()
        .map(|group| (group, audited_label.to_string()))
        .collect();
    pairs.sort();

    let results = LabelReconciler::new(batcher, customer_id, &labels)
        .remove_group_labels(&pairs)
        .await?;
    let reset = results.iter().filter(|r| r.is_ok()).count();
    tracing::info!(customer_id, reset, "Audit markers reset");
    Ok(reset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_variants() {
        let catalog = VariantCatalog::builtin();
        assert_eq!(select_variants(&catalog, &[]).unwrap().len(), 5);

        let picked = select_variants(&catalog, &["kerstmis".to_string()]).unwrap();
        assert_eq!(picked[0].done_label, "THEME_KM_DONE");

        assert_eq!(
            select_variants(&catalog, &["easter".to_string()]).unwrap_err(),
            "easter"
        );
    }
}
