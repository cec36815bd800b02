//! Marker and done-label bookkeeping around ad mutations.

use std::collections::BTreeSet;

use crate::models::remote::{LabelMap, MutateOperation, OperationResult};
use crate::services::ads_api::ApiError;
use crate::services::batcher::MutationBatcher;

/// Create every label in `names` the account does not have yet and record
/// the new resources in `labels`. Returns how many were created.
pub async fn ensure_labels(
    batcher: &MutationBatcher,
    customer_id: &str,
    labels: &mut LabelMap,
    names: &[String],
) -> Result<usize, ApiError> {
    let missing: Vec<String> = names
        .iter()
        .filter(|name| !labels.contains(name))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if missing.is_empty() {
        return Ok(0);
    }

    let operations: Vec<MutateOperation> = missing
        .iter()
        .map(|name| MutateOperation::CreateLabel { name: name.clone() })
        .collect();
    let outcome = batcher.execute(customer_id, &operations).await?;

    let mut created = 0;
    for (name, result) in missing.into_iter().zip(outcome.results) {
        match result {
            Ok(resource) => {
                labels.insert(name, resource);
                created += 1;
            }
            Err(error) => tracing::warn!(customer_id, label = %name, %error, "Failed to create label"),
        }
    }

    tracing::info!(customer_id, created, "Labels ensured");
    Ok(created)
}

/// Applies label links for one account through the batcher.
///
/// Every method takes `(owner resource, label name)` pairs and returns one
/// result per pair, in order. Pairs naming a label the account lacks fail
/// locally without a remote call.
pub struct LabelReconciler<'a> {
    batcher: &'a MutationBatcher,
    customer_id: &'a str,
    labels: &'a LabelMap,
}

impl<'a> LabelReconciler<'a> {
    pub fn new(batcher: &'a MutationBatcher, customer_id: &'a str, labels: &'a LabelMap) -> Self {
        Self {
            batcher,
            customer_id,
            labels,
        }
    }

    pub async fn attach_markers(&self, ads: &[(String, String)]) -> Result<Vec<OperationResult>, ApiError> {
        self.apply(ads, |ad_resource, label_resource| MutateOperation::CreateAdLabel {
            ad_resource,
            label_resource,
        })
        .await
    }

    pub async fn attach_group_labels(
        &self,
        groups: &[(String, String)],
    ) -> Result<Vec<OperationResult>, ApiError> {
        self.apply(groups, |group_resource, label_resource| MutateOperation::CreateGroupLabel {
            group_resource,
            label_resource,
        })
        .await
    }

    pub async fn remove_group_labels(
        &self,
        groups: &[(String, String)],
    ) -> Result<Vec<OperationResult>, ApiError> {
        self.apply(groups, |group_resource, label_resource| MutateOperation::RemoveGroupLabel {
            group_resource,
            label_resource,
        })
        .await
    }

    async fn apply(
        &self,
        pairs: &[(String, String)],
        build: impl Fn(String, String) -> MutateOperation,
    ) -> Result<Vec<OperationResult>, ApiError> {
        let mut results: Vec<Option<OperationResult>> = Vec::with_capacity(pairs.len());
        let mut operations = Vec::new();

        for (owner, name) in pairs {
            match self.labels.resource(name) {
                Some(label_resource) => {
                    operations.push(build(owner.clone(), label_resource.to_string()));
                    results.push(None);
                }
                None => results.push(Some(Err(format!("label {name} is not available")))),
            }
        }

        let mut remote = self
            .batcher
            .execute(self.customer_id, &operations)
            .await?
            .results
            .into_iter();

        Ok(results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    remote
                        .next()
                        .unwrap_or_else(|| Err("no result returned for operation".to_string()))
                })
            })
            .collect())
    }
}
