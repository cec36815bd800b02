//! In-memory ads platform for driving the engine end to end.
#![allow(dead_code)]

use adslot_engine::models::remote::{
    ad_id_of, ad_label_resource, group_label_resource, group_resource, resource_id, AdContent, AdStatus,
    MutateOperation, MutateResponse, OperationResult, RemoteAd, RemoteGroup, SearchQuery, SearchRow,
};
use adslot_engine::services::ads_api::{AdsPlatform, ApiError, ErrorKind};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Live ads per group the fake accepts before refusing a create.
pub const FAKE_SLOT_LIMIT: usize = 3;

/// Runs once, after the given number of mutate calls that create ads.
pub type MutateHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone)]
struct FakeAd {
    group_resource: String,
    status: AdStatus,
    content: AdContent,
    /// Label resources
    labels: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
struct Account {
    next_id: u64,
    /// Label resource → name
    labels: BTreeMap<String, String>,
    ads: BTreeMap<String, FakeAd>,
    /// (group resource, label resource)
    group_labels: BTreeSet<(String, String)>,
}

impl Account {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        1000 + self.next_id
    }

    fn label_resource(&self, name: &str) -> Option<String> {
        self.labels
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(resource, _)| resource.clone())
    }

    fn live_in_group(&self, group: &str) -> usize {
        self.ads
            .values()
            .filter(|ad| ad.group_resource == group && ad.status != AdStatus::Removed)
            .count()
    }

    fn sorted_ads<'a>(&'a self, filter: impl Fn(&FakeAd) -> bool) -> Vec<(&'a String, &'a FakeAd)> {
        let mut ads: Vec<(&String, &FakeAd)> = self
            .ads
            .iter()
            .filter(|(_, ad)| ad.status != AdStatus::Removed && filter(ad))
            .collect();
        ads.sort_by_key(|(resource, ad)| (ad.status.rank(), ad_id_of(resource)));
        ads
    }

    fn apply(&mut self, customer_id: &str, operation: &MutateOperation) -> OperationResult {
        match operation {
            MutateOperation::CreateLabel { name } => {
                if self.label_resource(name).is_some() {
                    return Err(format!("DUPLICATE_NAME: label {name} exists"));
                }
                let resource = format!("customers/{customer_id}/labels/{}", self.next_id());
                self.labels.insert(resource.clone(), name.clone());
                Ok(resource)
            }
            MutateOperation::CreateAd {
                group_resource,
                status,
                content,
            } => {
                if self.live_in_group(group_resource) >= FAKE_SLOT_LIMIT {
                    return Err(format!("RESOURCE_LIMIT: too many ads in {group_resource}"));
                }
                let resource = format!(
                    "customers/{customer_id}/adGroupAds/{}~{}",
                    resource_id(group_resource),
                    self.next_id()
                );
                self.ads.insert(
                    resource.clone(),
                    FakeAd {
                        group_resource: group_resource.clone(),
                        status: *status,
                        content: content.clone(),
                        labels: BTreeSet::new(),
                    },
                );
                Ok(resource)
            }
            MutateOperation::UpdateAdStatus { ad_resource, status } => match self.ads.get_mut(ad_resource) {
                Some(ad) if ad.status != AdStatus::Removed => {
                    ad.status = *status;
                    Ok(ad_resource.clone())
                }
                _ => Err(format!("NOT_FOUND: {ad_resource}")),
            },
            MutateOperation::RemoveAd { ad_resource } => match self.ads.remove(ad_resource) {
                Some(_) => Ok(ad_resource.clone()),
                None => Err(format!("NOT_FOUND: {ad_resource}")),
            },
            MutateOperation::CreateAdLabel {
                ad_resource,
                label_resource,
            } => {
                if !self.labels.contains_key(label_resource) {
                    return Err(format!("NOT_FOUND: {label_resource}"));
                }
                let Some(ad) = self.ads.get_mut(ad_resource) else {
                    return Err(format!("NOT_FOUND: {ad_resource}"));
                };
                if !ad.labels.insert(label_resource.clone()) {
                    return Err("DUPLICATE: ad already carries the label".to_string());
                }
                let group_id = resource_id(&ad.group_resource).to_string();
                Ok(ad_label_resource(
                    customer_id,
                    &group_id,
                    &ad_id_of(ad_resource).to_string(),
                    resource_id(label_resource),
                ))
            }
            MutateOperation::RemoveAdLabel {
                ad_resource,
                label_resource,
            } => match self.ads.get_mut(ad_resource) {
                Some(ad) if ad.labels.contains(label_resource) => {
                    ad.labels.remove(label_resource);
                    Ok(ad_resource.clone())
                }
                _ => Err(format!("NOT_FOUND: {label_resource} on {ad_resource}")),
            },
            MutateOperation::CreateGroupLabel {
                group_resource,
                label_resource,
            } => {
                if !self.labels.contains_key(label_resource) {
                    return Err(format!("NOT_FOUND: {label_resource}"));
                }
                if !self
                    .group_labels
                    .insert((group_resource.clone(), label_resource.clone()))
                {
                    return Err("DUPLICATE: group already carries the label".to_string());
                }
                Ok(group_label_resource(
                    customer_id,
                    resource_id(group_resource),
                    resource_id(label_resource),
                ))
            }
            MutateOperation::RemoveGroupLabel {
                group_resource,
                label_resource,
            } => {
                if self
                    .group_labels
                    .remove(&(group_resource.clone(), label_resource.clone()))
                {
                    Ok(group_resource.clone())
                } else {
                    Err(format!("NOT_FOUND: {label_resource} on {group_resource}"))
                }
            }
        }
    }
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    failing_customers: HashMap<String, ErrorKind>,
    scripted_failures: VecDeque<ApiError>,
    /// Groups whose ads cannot be read; any ad search covering one fails.
    unreadable_groups: HashSet<String>,
    /// Operation kinds refused individually.
    rejected_operations: HashSet<&'static str>,
    /// Group resources where ad creates are refused.
    rejected_create_groups: HashSet<String>,
    mutate_calls: usize,
    search_calls: usize,
    operations: Vec<MutateOperation>,
    hook: Option<(usize, MutateHook)>,
}

/// Applies mutations to in-memory accounts and answers searches from them.
#[derive(Default)]
pub struct FakeAdsPlatform {
    state: Mutex<State>,
}

impl FakeAdsPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_account<T>(&self, customer_id: &str, f: impl FnOnce(&mut Account) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(state.accounts.entry(customer_id.to_string()).or_default())
    }

    /// Resource of `name`, creating the label when missing.
    pub fn label(&self, customer_id: &str, name: &str) -> String {
        self.with_account(customer_id, |account| match account.label_resource(name) {
            Some(resource) => resource,
            None => {
                let resource = format!("customers/{customer_id}/labels/{}", account.next_id());
                account.labels.insert(resource.clone(), name.to_string());
                resource
            }
        })
    }

    pub fn add_ad(
        &self,
        customer_id: &str,
        group_id: &str,
        status: AdStatus,
        content: AdContent,
        label_names: &[&str],
    ) -> String {
        let labels: BTreeSet<String> = label_names.iter().map(|name| self.label(customer_id, name)).collect();
        self.with_account(customer_id, |account| {
            let resource = format!("customers/{customer_id}/adGroupAds/{group_id}~{}", account.next_id());
            account.ads.insert(
                resource.clone(),
                FakeAd {
                    group_resource: group_resource(customer_id, group_id),
                    status,
                    content,
                    labels,
                },
            );
            resource
        })
    }

    pub fn add_group_label(&self, customer_id: &str, group_id: &str, name: &str) {
        let label = self.label(customer_id, name);
        self.with_account(customer_id, |account| {
            account
                .group_labels
                .insert((group_resource(customer_id, group_id), label));
        });
    }

    /// Every call for this customer fails with `kind`.
    pub fn fail_customer(&self, customer_id: &str, kind: ErrorKind) {
        self.state
            .lock()
            .unwrap()
            .failing_customers
            .insert(customer_id.to_string(), kind);
    }

    /// The next mutate calls fail with these errors, in order.
    pub fn fail_next_mutates(&self, errors: Vec<ApiError>) {
        self.state.lock().unwrap().scripted_failures.extend(errors);
    }

    /// Ad searches that include this group fail with a transient error.
    pub fn fail_ad_reads_in(&self, customer_id: &str, group_id: &str) {
        self.state
            .lock()
            .unwrap()
            .unreadable_groups
            .insert(group_resource(customer_id, group_id));
    }

    /// Every operation of this kind is refused, e.g. `"create_ad_label"`.
    pub fn reject_operations(&self, kind: &'static str) {
        self.state.lock().unwrap().rejected_operations.insert(kind);
    }

    /// Ad creates in this group are refused.
    pub fn reject_creates_in(&self, customer_id: &str, group_id: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_create_groups
            .insert(group_resource(customer_id, group_id));
    }

    pub fn on_ad_creates(&self, after_calls: usize, hook: MutateHook) {
        self.state.lock().unwrap().hook = Some((after_calls, hook));
    }

    pub fn mutate_calls(&self) -> usize {
        self.state.lock().unwrap().mutate_calls
    }

    pub fn search_calls(&self) -> usize {
        self.state.lock().unwrap().search_calls
    }

    /// Every operation the platform accepted a call for, in order.
    pub fn operations(&self) -> Vec<MutateOperation> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn count_operations(&self, kind: &str) -> usize {
        self.operations().iter().filter(|op| op.kind() == kind).count()
    }

    /// Current state of one group with label names resolved.
    pub fn group(&self, customer_id: &str, group_id: &str) -> RemoteGroup {
        let resource = group_resource(customer_id, group_id);
        self.with_account(customer_id, |account| {
            let name = |label: &String| account.labels.get(label).cloned();
            let live_ads = account
                .sorted_ads(|ad| ad.group_resource == resource)
                .into_iter()
                .map(|(ad_resource, ad)| RemoteAd {
                    resource: ad_resource.clone(),
                    group_resource: resource.clone(),
                    status: ad.status,
                    content: ad.content.clone(),
                    labels: ad.labels.iter().filter_map(name).collect(),
                })
                .collect();
            let labels = account
                .group_labels
                .iter()
                .filter(|(group, _)| *group == resource)
                .filter_map(|(_, label)| name(label))
                .collect();
            RemoteGroup {
                group_resource: resource.clone(),
                live_ads,
                labels,
            }
        })
    }

    fn check_customer(state: &State, customer_id: &str) -> Result<(), ApiError> {
        match state.failing_customers.get(customer_id) {
            Some(kind) => Err(ApiError::new(*kind, format!("account {customer_id} is unavailable"))),
            None => Ok(()),
        }
    }
}

fn refusal(state: &State, operation: &MutateOperation) -> Option<String> {
    if state.rejected_operations.contains(operation.kind()) {
        return Some(format!("REJECTED: {} refused", operation.kind()));
    }
    match operation {
        MutateOperation::CreateAd { group_resource, .. } if state.rejected_create_groups.contains(group_resource) => {
            Some(format!("REJECTED: policy refused ad in {group_resource}"))
        }
        _ => None,
    }
}

fn ad_row(resource: &str, ad: &FakeAd) -> SearchRow {
    SearchRow::Ad {
        resource: resource.to_string(),
        group_resource: ad.group_resource.clone(),
        status: ad.status,
        content: ad.content.clone(),
        labels: ad.labels.iter().cloned().collect(),
    }
}

#[async_trait]
impl AdsPlatform for FakeAdsPlatform {
    async fn search(&self, customer_id: &str, query: &SearchQuery) -> Result<Vec<SearchRow>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.search_calls += 1;
        Self::check_customer(&state, customer_id)?;
        if let SearchQuery::AdsInGroups { groups } = query {
            if groups.iter().any(|g| state.unreadable_groups.contains(g)) {
                return Err(ApiError::new(ErrorKind::Transient, "ad search unavailable"));
            }
        }
        let account = state.accounts.entry(customer_id.to_string()).or_default();

        let rows = match query {
            SearchQuery::Labels => account
                .labels
                .iter()
                .map(|(resource, name)| SearchRow::Label {
                    resource: resource.clone(),
                    name: name.clone(),
                })
                .collect(),
            SearchQuery::AdsInGroups { groups } => account
                .sorted_ads(|ad| groups.contains(&ad.group_resource))
                .into_iter()
                .map(|(resource, ad)| ad_row(resource, ad))
                .collect(),
            SearchQuery::AllAds => account
                .sorted_ads(|_| true)
                .into_iter()
                .map(|(resource, ad)| ad_row(resource, ad))
                .collect(),
            SearchQuery::GroupLabels { groups } => account
                .group_labels
                .iter()
                .filter(|(group, _)| groups.contains(group))
                .map(|(group, label)| SearchRow::GroupLabel {
                    group_resource: group.clone(),
                    label_resource: label.clone(),
                })
                .collect(),
            SearchQuery::GroupsWithLabels { labels } => account
                .group_labels
                .iter()
                .filter(|(_, label)| labels.contains(label))
                .map(|(group, label)| SearchRow::GroupLabel {
                    group_resource: group.clone(),
                    label_resource: label.clone(),
                })
                .collect(),
        };
        Ok(rows)
    }

    async fn mutate(
        &self,
        customer_id: &str,
        operations: &[MutateOperation],
        partial_failure: bool,
    ) -> Result<MutateResponse, ApiError> {
        let (response, hook) = {
            let mut state = self.state.lock().unwrap();
            state.mutate_calls += 1;
            Self::check_customer(&state, customer_id)?;
            if let Some(err) = state.scripted_failures.pop_front() {
                return Err(err);
            }
            state.operations.extend(operations.iter().cloned());
            let refusals: Vec<Option<String>> = operations.iter().map(|op| refusal(&state, op)).collect();

            let account = state.accounts.entry(customer_id.to_string()).or_default();
            let mut draft = account.clone();
            let results: Vec<OperationResult> = operations
                .iter()
                .zip(refusals)
                .map(|(op, refused)| match refused {
                    Some(message) => Err(message),
                    None => draft.apply(customer_id, op),
                })
                .collect();
            if !partial_failure {
                if let Some(Err(message)) = results.iter().find(|r| r.is_err()) {
                    return Err(ApiError::new(ErrorKind::Rejected, message.clone()));
                }
            }
            *account = draft;

            let creates_ads = operations
                .iter()
                .any(|op| matches!(op, MutateOperation::CreateAd { .. }));
            let mut hook = None;
            if creates_ads {
                if let Some((remaining, _)) = state.hook.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        hook = state.hook.take().map(|(_, h)| h);
                    }
                }
            }
            (MutateResponse { results }, hook)
        };

        if let Some(hook) = hook {
            hook().await;
        }
        Ok(response)
    }
}
