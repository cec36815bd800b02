//! Bulk per-account reads taken before planning.
//!
//! A point-in-time snapshot: labels, live ads per group and group labels are
//! fetched concurrently, in chunks. A chunk that fails is logged and its
//! groups are recorded as unreadable; callers must not act on those groups.

use std::collections::{BTreeSet, HashMap};

use crate::models::remote::{LabelMap, RemoteAd, RemoteGroup, SearchQuery, SearchRow};
use crate::services::ads_api::ApiError;
use crate::services::batcher::MutationBatcher;

/// An ad row whose labels are still remote resources.
#[derive(Debug, Clone)]
struct RawAd {
    ad: RemoteAd,
    label_resources: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PrefetchCache {
    pub labels: LabelMap,
    pub groups: HashMap<String, RemoteGroup>,
    /// Prefetch chunks that could not be read.
    pub failed_chunks: usize,
    /// Groups in a failed chunk. They have no entry in `groups`.
    pub unreadable: BTreeSet<String>,
}

impl PrefetchCache {
    /// Read everything the planner needs for `group_resources`.
    ///
    /// Fails only when the label list itself cannot be read.
    pub async fn load(
        batcher: &MutationBatcher,
        customer_id: &str,
        group_resources: &[String],
        chunk_size: usize,
    ) -> Result<Self, ApiError> {
        let (labels, ads, group_labels) = tokio::join!(
            fetch_labels(batcher, customer_id),
            fetch_existing_ads(batcher, customer_id, group_resources, chunk_size),
            fetch_done_labels(batcher, customer_id, group_resources, chunk_size),
        );
        let labels = labels?;
        let (ads, ad_failures) = ads;
        let (group_labels, label_failures) = group_labels;

        let mut cache = Self::assemble(labels, group_resources, ads, group_labels);
        cache.failed_chunks = ad_failures.len() + label_failures.len();
        for group in ad_failures.into_iter().chain(label_failures).flatten() {
            cache.groups.remove(&group);
            cache.unreadable.insert(group);
        }

        tracing::info!(
            customer_id,
            labels = cache.labels.len(),
            groups = cache.groups.len(),
            ads = cache.groups.values().map(|g| g.live_ads.len()).sum::<usize>(),
            failed_chunks = cache.failed_chunks,
            unreadable_groups = cache.unreadable.len(),
            "Prefetch complete"
        );
        Ok(cache)
    }

    /// Read every live ad of the account, without group labels.
    pub async fn load_account_ads(
        batcher: &MutationBatcher,
        customer_id: &str,
    ) -> Result<Self, ApiError> {
        let (labels, rows) = tokio::join!(
            fetch_labels(batcher, customer_id),
            batcher.search(customer_id, &SearchQuery::AllAds),
        );
        let labels = labels?;
        let ads = decode_ads(rows?);
        let groups: Vec<String> = ads
            .iter()
            .map(|raw| raw.ad.group_resource.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Ok(Self::assemble(labels, &groups, ads, HashMap::new()))
    }

    fn assemble(
        labels: LabelMap,
        group_resources: &[String],
        ads: Vec<RawAd>,
        group_labels: HashMap<String, BTreeSet<String>>,
    ) -> Self {
        let names = labels.reverse();

        let mut groups: HashMap<String, RemoteGroup> = group_resources
            .iter()
            .map(|g| (g.clone(), RemoteGroup::new(g.clone())))
            .collect();

        for raw in ads {
            let mut ad = raw.ad;
            ad.labels = resolve_names(&names, &raw.label_resources);
            let group = ad.group_resource.clone();
            groups
                .entry(group.clone())
                .or_insert_with(|| RemoteGroup::new(group))
                .live_ads
                .push(ad);
        }

        for (group, resources) in group_labels {
            groups
                .entry(group.clone())
                .or_insert_with(|| RemoteGroup::new(group))
                .labels = resolve_names(&names, &resources);
        }

        Self {
            labels,
            groups,
            failed_chunks: 0,
            unreadable: BTreeSet::new(),
        }
    }

    pub fn group(&self, group_resource: &str) -> Option<&RemoteGroup> {
        self.groups.get(group_resource)
    }

    /// False when the group's chunk failed and its state is unknown.
    pub fn is_readable(&self, group_resource: &str) -> bool {
        !self.unreadable.contains(group_resource)
    }

    pub fn group_mut(&mut self, group_resource: &str) -> &mut RemoteGroup {
        self.groups
            .entry(group_resource.to_string())
            .or_insert_with(|| RemoteGroup::new(group_resource))
    }

    /// Group → best ad (enabled over paused, first in query order).
    pub fn best_ads(&self) -> HashMap<&str, &RemoteAd> {
        self.groups
            .iter()
            .filter_map(|(g, group)| group.best_ad().map(|ad| (g.as_str(), ad)))
            .collect()
    }
}

pub async fn fetch_labels(batcher: &MutationBatcher, customer_id: &str) -> Result<LabelMap, ApiError> {
    let rows = batcher.search(customer_id, &SearchQuery::Labels).await?;
    let mut labels = LabelMap::default();
    for row in rows {
        if let SearchRow::Label { resource, name } = row {
            labels.insert(name, resource);
        }
    }
    Ok(labels)
}

/// Live ads of the given groups, plus the groups of every failed chunk.
async fn fetch_existing_ads(
    batcher: &MutationBatcher,
    customer_id: &str,
    group_resources: &[String],
    chunk_size: usize,
) -> (Vec<RawAd>, Vec<Vec<String>>) {
    let mut ads = Vec::new();
    let mut failed = Vec::new();
    for (index, chunk) in group_resources.chunks(chunk_size.max(1)).enumerate() {
        let query = SearchQuery::AdsInGroups {
            groups: chunk.to_vec(),
        };
        match batcher.search(customer_id, &query).await {
            Ok(rows) => ads.extend(decode_ads(rows)),
            Err(err) => {
                failed.push(chunk.to_vec());
                tracing::warn!(customer_id, chunk = index, size = chunk.len(), error = %err, "Skipping ad prefetch chunk");
            }
        }
    }
    (ads, failed)
}

/// Label resources attached to each of the given groups, plus the groups of
/// every failed chunk.
async fn fetch_done_labels(
    batcher: &MutationBatcher,
    customer_id: &str,
    group_resources: &[String],
    chunk_size: usize,
) -> (HashMap<String, BTreeSet<String>>, Vec<Vec<String>>) {
    let mut labels: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut failed = Vec::new();
    for (index, chunk) in group_resources.chunks(chunk_size.max(1)).enumerate() {
        let query = SearchQuery::GroupLabels {
            groups: chunk.to_vec(),
        };
        match batcher.search(customer_id, &query).await {
            Ok(rows) => {
                for row in rows {
                    if let SearchRow::GroupLabel {
                        group_resource,
                        label_resource,
                    } = row
                    {
                        labels.entry(group_resource).or_default().insert(label_resource);
                    }
                }
            }
            Err(err) => {
                failed.push(chunk.to_vec());
                tracing::warn!(customer_id, chunk = index, size = chunk.len(), error = %err, "Skipping group label prefetch chunk");
            }
        }
    }
    (labels, failed)
}

/// Groups carrying any of the given label resources, with the matching labels.
pub async fn fetch_groups_with_labels(
    batcher: &MutationBatcher,
    customer_id: &str,
    label_resources: Vec<String>,
) -> Result<HashMap<String, BTreeSet<String>>, ApiError> {
    if label_resources.is_empty() {
        return Ok(HashMap::new());
    }
    let rows = batcher
        .search(customer_id, &SearchQuery::GroupsWithLabels { labels: label_resources })
        .await?;
    let mut groups: HashMap<String, BTreeSet<String>> = HashMap::new();
    for row in rows {
        if let SearchRow::GroupLabel {
            group_resource,
            label_resource,
        } = row
        {
            groups.entry(group_resource).or_default().insert(label_resource);
        }
    }
    Ok(groups)
}

fn resolve_names<'a>(
    names: &HashMap<String, String>,
    resources: impl IntoIterator<Item = &'a String>,
) -> BTreeSet<String> {
    resources
        .into_iter()
        .filter_map(|r| names.get(r).cloned())
        .collect()
}

fn decode_ads(rows: Vec<SearchRow>) -> Vec<RawAd> {
    rows.into_iter()
        .filter_map(|row| match row {
            SearchRow::Ad {
                resource,
                group_resource,
                status,
                content,
                labels,
            } => Some(RawAd {
                ad: RemoteAd {
                    resource,
                    group_resource,
                    status,
                    content,
                    labels: BTreeSet::new(),
                },
                label_resources: labels,
            }),
            _ => None,
        })
        .collect()
}
