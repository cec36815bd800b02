use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use strum::{Display, EnumString};

/// Serving status of an ad as reported by the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AdStatus {
    Enabled,
    Paused,
    Removed,
    /// A status this client does not recognise. Occupies a slot but is never touched.
    Unknown,
}

impl AdStatus {
    /// Query-order rank: enabled ads sort before paused ones.
    pub fn rank(self) -> u8 {
        match self {
            AdStatus::Enabled => 0,
            AdStatus::Paused => 1,
            AdStatus::Unknown => 2,
            AdStatus::Removed => 3,
        }
    }

    /// Enabled or paused: a status this client may copy, evict or toggle.
    pub fn is_servable(self) -> bool {
        matches!(self, AdStatus::Enabled | AdStatus::Paused)
    }
}

/// Text assets and urls of a responsive search ad.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdContent {
    pub headlines: Vec<String>,
    pub descriptions: Vec<String>,
    pub final_urls: Vec<String>,
    pub path1: String,
    pub path2: String,
}

impl AdContent {
    /// Order-independent multiset signature of the ad's text fields.
    pub fn signature(&self) -> String {
        let mut headlines: Vec<&str> = self.headlines.iter().map(String::as_str).collect();
        let mut descriptions: Vec<&str> = self.descriptions.iter().map(String::as_str).collect();
        headlines.sort_unstable();
        descriptions.sort_unstable();
        format!("{}\u{1f}||\u{1f}{}", headlines.join("\u{1e}"), descriptions.join("\u{1e}"))
    }
}

/// A live (non-removed) ad inside a group, with the label names it carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteAd {
    pub resource: String,
    pub group_resource: String,
    pub status: AdStatus,
    pub content: AdContent,
    pub labels: BTreeSet<String>,
}

impl RemoteAd {
    /// Numeric ad id parsed from `customers/{c}/adGroupAds/{group}~{ad}`.
    pub fn ad_id(&self) -> u64 {
        ad_id_of(&self.resource)
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.contains(name)
    }
}

/// Point-in-time snapshot of one group: its live ads in query order and its labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteGroup {
    pub group_resource: String,
    pub live_ads: Vec<RemoteAd>,
    pub labels: BTreeSet<String>,
}

impl RemoteGroup {
    pub fn new(group_resource: impl Into<String>) -> Self {
        Self {
            group_resource: group_resource.into(),
            ..Default::default()
        }
    }

    pub fn live_count(&self) -> usize {
        self.live_ads
            .iter()
            .filter(|ad| ad.status != AdStatus::Removed)
            .count()
    }

    /// First enabled ad in query order, falling back to the first paused one.
    pub fn best_ad(&self) -> Option<&RemoteAd> {
        self.live_ads
            .iter()
            .filter(|ad| ad.status.is_servable())
            .min_by_key(|ad| ad.status.rank())
    }
}

/// Label name → label resource for one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LabelMap {
    by_name: HashMap<String, String>,
}

impl LabelMap {
    pub fn insert(&mut self, name: impl Into<String>, resource: impl Into<String>) {
        self.by_name.insert(name.into(), resource.into());
    }

    pub fn resource(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    pub fn name_of(&self, resource: &str) -> Option<&str> {
        self.by_name
            .iter()
            .find(|(_, r)| r.as_str() == resource)
            .map(|(n, _)| n.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Reverse index used when decoding label resources on search rows.
    pub fn reverse(&self) -> HashMap<String, String> {
        self.by_name
            .iter()
            .map(|(n, r)| (r.clone(), n.clone()))
            .collect()
    }
}

pub fn group_resource(customer_id: &str, group_id: &str) -> String {
    format!("customers/{customer_id}/adGroups/{group_id}")
}

pub fn group_label_resource(customer_id: &str, group_id: &str, label_id: &str) -> String {
    format!("customers/{customer_id}/adGroupLabels/{group_id}~{label_id}")
}

pub fn ad_label_resource(customer_id: &str, group_id: &str, ad_id: &str, label_id: &str) -> String {
    format!("customers/{customer_id}/adGroupAdLabels/{group_id}~{ad_id}~{label_id}")
}

/// Last path segment of a resource name.
pub fn resource_id(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}

/// Numeric ad id of an ad resource; 0 when the resource is malformed.
pub fn ad_id_of(resource: &str) -> u64 {
    resource_id(resource)
        .rsplit('~')
        .next()
        .and_then(|id| id.parse().ok())
        .unwrap_or(0)
}

/// Declarative bulk reads against the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    /// Every label of the account.
    Labels,
    /// Non-removed ads in the given groups, enabled before paused.
    AdsInGroups { groups: Vec<String> },
    /// Every non-removed ad of the account, enabled before paused.
    AllAds,
    /// Labels attached to the given groups.
    GroupLabels { groups: Vec<String> },
    /// Groups carrying any of the given label resources.
    GroupsWithLabels { labels: Vec<String> },
}

impl SearchQuery {
    pub fn kind(&self) -> &'static str {
        match self {
            SearchQuery::Labels => "labels",
            SearchQuery::AdsInGroups { .. } => "ads_in_groups",
            SearchQuery::AllAds => "all_ads",
            SearchQuery::GroupLabels { .. } => "group_labels",
            SearchQuery::GroupsWithLabels { .. } => "groups_with_labels",
        }
    }
}

/// One typed result row.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchRow {
    Label {
        resource: String,
        name: String,
    },
    Ad {
        resource: String,
        group_resource: String,
        status: AdStatus,
        content: AdContent,
        /// Label resources attached to the ad.
        labels: Vec<String>,
    },
    GroupLabel {
        group_resource: String,
        label_resource: String,
    },
}

/// A single create/update/remove against the batch-mutate endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum MutateOperation {
    CreateLabel {
        name: String,
    },
    CreateAd {
        group_resource: String,
        status: AdStatus,
        content: AdContent,
    },
    UpdateAdStatus {
        ad_resource: String,
        status: AdStatus,
    },
    RemoveAd {
        ad_resource: String,
    },
    CreateAdLabel {
        ad_resource: String,
        label_resource: String,
    },
    RemoveAdLabel {
        ad_resource: String,
        label_resource: String,
    },
    CreateGroupLabel {
        group_resource: String,
        label_resource: String,
    },
    RemoveGroupLabel {
        group_resource: String,
        label_resource: String,
    },
}

impl MutateOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            MutateOperation::CreateLabel { .. } => "create_label",
            MutateOperation::CreateAd { .. } => "create_ad",
            MutateOperation::UpdateAdStatus { .. } => "update_ad_status",
            MutateOperation::RemoveAd { .. } => "remove_ad",
            MutateOperation::CreateAdLabel { .. } => "create_ad_label",
            MutateOperation::RemoveAdLabel { .. } => "remove_ad_label",
            MutateOperation::CreateGroupLabel { .. } => "create_group_label",
            MutateOperation::RemoveGroupLabel { .. } => "remove_group_label",
        }
    }
}

/// Per-operation result: the affected resource or the operation's error.
pub type OperationResult = Result<String, String>;

/// Response of a batch mutate, one entry per submitted operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutateResponse {
    pub results: Vec<OperationResult>,
}

impl MutateResponse {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_err()).count()
    }
}
