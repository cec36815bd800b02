//! Per-group planning under the slot cap.

use crate::models::job::SkipReason;
use crate::models::remote::{AdContent, AdStatus, RemoteAd, RemoteGroup};
use crate::models::variant::{VariantCatalog, VariantDefinition};

/// Maximum live ads per group.
pub const SLOT_CAP: usize = 3;

pub const EVICTION_IMPOSSIBLE: &str =
    "eviction impossible: group is at capacity and holds only protected ads";

/// An ad chosen to free a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub ad_resource: String,
    pub ad_id: u64,
    /// Done label of the evicted ad's variant, when the group carries it.
    pub stale_done_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvictionPlan {
    NotNeeded,
    Evict(Eviction),
    Impossible,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatePlan {
    pub content: AdContent,
    pub eviction: Option<Eviction>,
}

/// What to do with one work item's group.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupDecision {
    Skip(SkipReason),
    /// A live ad already carries the target marker; only the done label is missing.
    AlreadyPresent { ad_resource: String },
    EvictionImpossible,
    Create(CreatePlan),
}

/// Pick the ad to remove so that one more ad fits into `group`.
///
/// Ads without any variant marker are protected. Paused marker ads go first,
/// then enabled ads of another variant; lowest ad id wins within a class.
pub fn plan_eviction(
    group: &RemoteGroup,
    target: &VariantDefinition,
    catalog: &VariantCatalog,
    cap: usize,
) -> EvictionPlan {
    if group.live_count() < cap {
        return EvictionPlan::NotNeeded;
    }

    let candidate = group
        .live_ads
        .iter()
        .filter(|ad| ad.status != AdStatus::Removed)
        .filter_map(|ad| {
            let variant = catalog.variant_of(ad)?;
            let class = match ad.status {
                AdStatus::Paused => 0,
                AdStatus::Enabled if variant.name != target.name => 1,
                _ => return None,
            };
            Some((class, ad.ad_id(), ad, variant))
        })
        .min_by_key(|(class, id, _, _)| (*class, *id));

    match candidate {
        Some((_, ad_id, ad, variant)) => EvictionPlan::Evict(Eviction {
            ad_resource: ad.resource.clone(),
            ad_id,
            stale_done_label: group
                .labels
                .contains(&variant.done_label)
                .then(|| variant.done_label.clone()),
        }),
        None => EvictionPlan::Impossible,
    }
}

/// Ad to copy text from: the best unmarked ad, else the best ad of any kind.
pub fn baseline_ad<'a>(group: &'a RemoteGroup, catalog: &VariantCatalog) -> Option<&'a RemoteAd> {
    group
        .live_ads
        .iter()
        .filter(|ad| ad.status.is_servable() && catalog.variant_of(ad).is_none())
        .min_by_key(|ad| ad.status.rank())
        .or_else(|| group.best_ad())
}

pub fn decide(
    group: Option<&RemoteGroup>,
    target: &VariantDefinition,
    catalog: &VariantCatalog,
    is_repair: bool,
    cap: usize,
) -> GroupDecision {
    let Some(group) = group else {
        return GroupDecision::Skip(SkipReason::NoBaselineAd);
    };

    if !is_repair && group.labels.contains(&target.done_label) {
        return GroupDecision::Skip(SkipReason::AlreadyDone);
    }

    if let Some(existing) = group
        .live_ads
        .iter()
        .find(|ad| ad.status != AdStatus::Removed && ad.has_label(&target.marker_label))
    {
        return GroupDecision::AlreadyPresent {
            ad_resource: existing.resource.clone(),
        };
    }

    let Some(content) = baseline_ad(group, catalog).and_then(|ad| target.build_content(ad)) else {
        return GroupDecision::Skip(SkipReason::NoBaselineAd);
    };

    match plan_eviction(group, target, catalog, cap) {
        EvictionPlan::NotNeeded => GroupDecision::Create(CreatePlan {
            content,
            eviction: None,
        }),
        EvictionPlan::Evict(eviction) => GroupDecision::Create(CreatePlan {
            content,
            eviction: Some(eviction),
        }),
        EvictionPlan::Impossible => GroupDecision::EvictionImpossible,
    }
}
