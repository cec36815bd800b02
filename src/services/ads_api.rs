use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::models::remote::{
    resource_id, AdContent, AdStatus, MutateOperation, MutateResponse, OperationResult,
    SearchQuery, SearchRow,
};

/// How a remote failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Throttled or quota temporarily exhausted; long backoff.
    RateLimited,
    /// Transient server-side or network failure; short backoff.
    Transient,
    /// Request exceeded a size limit; split and resubmit.
    RequestTooLarge,
    /// The batch itself was rejected; not retryable but scoped to the batch.
    Rejected,
    /// Authentication, authorization or permanent quota failure; abort the account.
    Fatal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} error from ads platform: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Typed read/write contract of the remote advertising platform.
#[async_trait]
pub trait AdsPlatform: Send + Sync {
    async fn search(&self, customer_id: &str, query: &SearchQuery)
        -> Result<Vec<SearchRow>, ApiError>;

    /// Submit a batch. With `partial_failure` set, operation-level errors come
    /// back in the per-operation results instead of failing the call.
    async fn mutate(
        &self,
        customer_id: &str,
        operations: &[MutateOperation],
        partial_failure: bool,
    ) -> Result<MutateResponse, ApiError>;
}

/// REST client for the platform's search and batch-mutate endpoints.
pub struct RestAdsClient {
    http: Client,
    base_url: String,
    developer_token: String,
    access_token: String,
    login_customer_id: Option<String>,
}

impl RestAdsClient {
    pub fn new(
        base_url: &str,
        developer_token: &str,
        access_token: &str,
        login_customer_id: Option<&str>,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ApiError::new(ErrorKind::Fatal, e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            developer_token: developer_token.to_string(),
            access_token: access_token.to_string(),
            login_customer_id: login_customer_id.map(|id| id.replace('-', "")),
        })
    }

    async fn post(&self, customer_id: &str, method: &str, body: &Value) -> Result<Value, ApiError> {
        let url = format!(
            "{}/customers/{}/googleAds:{}",
            self.base_url,
            customer_id.replace('-', ""),
            method
        );

        let mut request = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .header("developer-token", &self.developer_token)
            .json(body);
        if let Some(login) = &self.login_customer_id {
            request = request.header("login-customer-id", login);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        parse_response(status, &body)
    }
}

/// Error bodies from proxies and load balancers are often not JSON; those
/// are classified by HTTP status alone.
fn parse_response(status: StatusCode, body: &str) -> Result<Value, ApiError> {
    let payload: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    if !status.is_success() {
        return Err(classify_error(status, &payload));
    }
    if payload.is_null() {
        return Err(ApiError::new(ErrorKind::Transient, "malformed response body"));
    }
    Ok(payload)
}

#[async_trait]
impl AdsPlatform for RestAdsClient {
    async fn search(
        &self,
        customer_id: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchRow>, ApiError> {
        let gaql = render_query(query);
        let mut rows = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut body = json!({ "query": gaql });
            if let Some(token) = &page_token {
                body["pageToken"] = json!(token);
            }

            let page: SearchPage = serde_json::from_value(self.post(customer_id, "search", &body).await?)
                .map_err(|e| ApiError::new(ErrorKind::Transient, format!("malformed search page: {e}")))?;

            rows.extend(page.results.into_iter().filter_map(decode_row));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(rows)
    }

    async fn mutate(
        &self,
        customer_id: &str,
        operations: &[MutateOperation],
        partial_failure: bool,
    ) -> Result<MutateResponse, ApiError> {
        let body = json!({
            "mutateOperations": operations.iter().map(render_operation).collect::<Vec<_>>(),
            "partialFailure": partial_failure,
        });

        let payload: MutatePayload = serde_json::from_value(self.post(customer_id, "mutate", &body).await?)
            .map_err(|e| ApiError::new(ErrorKind::Transient, format!("malformed mutate response: {e}")))?;

        Ok(decode_mutate(operations.len(), payload))
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    ApiError::new(ErrorKind::Transient, err.to_string())
}

fn quoted_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

const AD_FIELDS: &str = "SELECT ad_group_ad.ad_group, ad_group_ad.resource_name, ad_group_ad.status, \
     ad_group_ad.labels, ad_group_ad.ad.final_urls, \
     ad_group_ad.ad.responsive_search_ad.headlines, \
     ad_group_ad.ad.responsive_search_ad.descriptions, \
     ad_group_ad.ad.responsive_search_ad.path1, ad_group_ad.ad.responsive_search_ad.path2 \
     FROM ad_group_ad";

const AD_FILTER: &str = "ad_group_ad.ad.type = RESPONSIVE_SEARCH_AD \
     AND ad_group_ad.status != REMOVED \
     ORDER BY ad_group_ad.status ASC";

fn render_query(query: &SearchQuery) -> String {
    match query {
        SearchQuery::Labels => "SELECT label.resource_name, label.name FROM label".to_string(),
        SearchQuery::AdsInGroups { groups } => format!(
            "{AD_FIELDS} WHERE ad_group_ad.ad_group IN ({}) AND {AD_FILTER}",
            quoted_list(groups)
        ),
        SearchQuery::AllAds => format!("{AD_FIELDS} WHERE {AD_FILTER}"),
        SearchQuery::GroupLabels { groups } => format!(
            "SELECT ad_group_label.ad_group, ad_group_label.label FROM ad_group_label \
             WHERE ad_group_label.ad_group IN ({})",
            quoted_list(groups)
        ),
        SearchQuery::GroupsWithLabels { labels } => format!(
            "SELECT ad_group_label.ad_group, ad_group_label.label FROM ad_group_label \
             WHERE ad_group_label.label IN ({})",
            quoted_list(labels)
        ),
    }
}

/// `customers/{c}/adGroupAds/{g}~{a}` + `customers/{c}/labels/{l}` → ad label resource.
fn ad_label_name(ad_resource: &str, label_resource: &str) -> String {
    let prefix = ad_resource.split("/adGroupAds/").next().unwrap_or_default();
    format!(
        "{}/adGroupAdLabels/{}~{}",
        prefix,
        resource_id(ad_resource),
        resource_id(label_resource)
    )
}

fn group_label_name(group_resource: &str, label_resource: &str) -> String {
    let prefix = group_resource.split("/adGroups/").next().unwrap_or_default();
    format!(
        "{}/adGroupLabels/{}~{}",
        prefix,
        resource_id(group_resource),
        resource_id(label_resource)
    )
}

fn render_ad(group_resource: &str, status: AdStatus, content: &AdContent) -> Value {
    let assets = |texts: &[String]| -> Vec<Value> {
        texts.iter().map(|t| json!({ "text": t })).collect()
    };
    let mut rsa = json!({
        "headlines": assets(&content.headlines),
        "descriptions": assets(&content.descriptions),
    });
    if !content.path1.is_empty() {
        rsa["path1"] = json!(content.path1);
    }
    if !content.path2.is_empty() {
        rsa["path2"] = json!(content.path2);
    }
    json!({
        "adGroup": group_resource,
        "status": status.to_string(),
        "ad": { "finalUrls": content.final_urls, "responsiveSearchAd": rsa },
    })
}

fn render_operation(op: &MutateOperation) -> Value {
    match op {
        MutateOperation::CreateLabel { name } => {
            json!({ "labelOperation": { "create": { "name": name } } })
        }
        MutateOperation::CreateAd {
            group_resource,
            status,
            content,
        } => json!({ "adGroupAdOperation": { "create": render_ad(group_resource, *status, content) } }),
        MutateOperation::UpdateAdStatus {
            ad_resource,
            status,
        } => json!({
            "adGroupAdOperation": {
                "update": { "resourceName": ad_resource, "status": status.to_string() },
                "updateMask": "status",
            }
        }),
        MutateOperation::RemoveAd { ad_resource } => {
            json!({ "adGroupAdOperation": { "remove": ad_resource } })
        }
        MutateOperation::CreateAdLabel {
            ad_resource,
            label_resource,
        } => json!({
            "adGroupAdLabelOperation": {
                "create": { "adGroupAd": ad_resource, "label": label_resource }
            }
        }),
        MutateOperation::RemoveAdLabel {
            ad_resource,
            label_resource,
        } => json!({
            "adGroupAdLabelOperation": { "remove": ad_label_name(ad_resource, label_resource) }
        }),
        MutateOperation::CreateGroupLabel {
            group_resource,
            label_resource,
        } => json!({
            "adGroupLabelOperation": {
                "create": { "adGroup": group_resource, "label": label_resource }
            }
        }),
        MutateOperation::RemoveGroupLabel {
            group_resource,
            label_resource,
        } => json!({
            "adGroupLabelOperation": { "remove": group_label_name(group_resource, label_resource) }
        }),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    #[serde(default)]
    results: Vec<Value>,
    next_page_token: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TextAsset {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RsaPayload {
    #[serde(default)]
    headlines: Vec<TextAsset>,
    #[serde(default)]
    descriptions: Vec<TextAsset>,
    #[serde(default)]
    path1: String,
    #[serde(default)]
    path2: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AdPayload {
    #[serde(default)]
    final_urls: Vec<String>,
    #[serde(default)]
    responsive_search_ad: RsaPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdGroupAdPayload {
    ad_group: String,
    resource_name: String,
    status: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    ad: AdPayload,
}

fn decode_row(row: Value) -> Option<SearchRow> {
    if let Some(label) = row.get("label") {
        return Some(SearchRow::Label {
            resource: label.get("resourceName")?.as_str()?.to_string(),
            name: label.get("name")?.as_str()?.to_string(),
        });
    }

    if let Some(link) = row.get("adGroupLabel") {
        return Some(SearchRow::GroupLabel {
            group_resource: link.get("adGroup")?.as_str()?.to_string(),
            label_resource: link.get("label")?.as_str()?.to_string(),
        });
    }

    let ad: AdGroupAdPayload = serde_json::from_value(row.get("adGroupAd")?.clone()).ok()?;
    let status = ad.status.parse().unwrap_or_else(|_| {
        tracing::warn!(ad = %ad.resource_name, status = %ad.status, "Unrecognised ad status");
        AdStatus::Unknown
    });
    let rsa = ad.ad.responsive_search_ad;
    Some(SearchRow::Ad {
        resource: ad.resource_name,
        group_resource: ad.ad_group,
        status,
        content: AdContent {
            headlines: rsa.headlines.into_iter().map(|a| a.text).collect(),
            descriptions: rsa.descriptions.into_iter().map(|a| a.text).collect(),
            final_urls: ad.ad.final_urls,
            path1: rsa.path1,
            path2: rsa.path2,
        },
        labels: ad.labels,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutatePayload {
    #[serde(default)]
    mutate_operation_responses: Vec<Value>,
    partial_failure_error: Option<ErrorStatus>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorStatus,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    #[serde(default)]
    errors: Vec<PlatformError>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PlatformError {
    /// e.g. `{"quotaError": "RESOURCE_EXHAUSTED"}`
    #[serde(default)]
    error_code: HashMap<String, String>,
    #[serde(default)]
    message: String,
    location: Option<ErrorLocation>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorLocation {
    #[serde(default)]
    field_path_elements: Vec<FieldPathElement>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FieldPathElement {
    #[serde(default)]
    field_name: String,
    index: Option<usize>,
}

impl PlatformError {
    fn operation_index(&self) -> Option<usize> {
        self.location
            .as_ref()?
            .field_path_elements
            .iter()
            .find(|e| e.field_name == "mutate_operations" || e.field_name == "operations")
            .and_then(|e| e.index)
    }
}

fn decode_mutate(operation_count: usize, payload: MutatePayload) -> MutateResponse {
    let mut errors: HashMap<usize, String> = HashMap::new();
    if let Some(partial) = &payload.partial_failure_error {
        for err in partial.details.iter().flat_map(|d| d.errors.iter()) {
            if let Some(index) = err.operation_index() {
                errors.entry(index).or_insert_with(|| err.message.clone());
            }
        }
    }

    let results = (0..operation_count)
        .map(|index| -> OperationResult {
            if let Some(message) = errors.remove(&index) {
                return Err(message);
            }
            payload
                .mutate_operation_responses
                .get(index)
                .and_then(|resp| resp.as_object())
                .and_then(|obj| obj.values().next())
                .and_then(|result| result.get("resourceName"))
                .and_then(|name| name.as_str())
                .map(str::to_string)
                .ok_or_else(|| "operation returned no resource".to_string())
        })
        .collect();

    MutateResponse { results }
}

/// Map an error response onto an [`ErrorKind`] from its structured codes.
fn classify_error(status: StatusCode, payload: &Value) -> ApiError {
    let envelope: ErrorEnvelope = serde_json::from_value(payload.clone()).unwrap_or_default();
    let error = envelope.error;
    let codes: Vec<(&str, &str)> = error
        .details
        .iter()
        .flat_map(|d| d.errors.iter())
        .flat_map(|e| e.error_code.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .collect();

    let kind = classify_codes(status, &error.status, &codes);
    let message = if error.message.is_empty() {
        format!("HTTP {status}")
    } else {
        error.message
    };
    ApiError::new(kind, message)
}

fn classify_codes(status: StatusCode, grpc_status: &str, codes: &[(&str, &str)]) -> ErrorKind {
    for (family, code) in codes {
        match (*family, *code) {
            ("authenticationError", _) | ("authorizationError", _) => return ErrorKind::Fatal,
            ("quotaError", "RESOURCE_EXHAUSTED" | "RESOURCE_TEMPORARILY_EXHAUSTED") => {
                return ErrorKind::RateLimited
            }
            ("quotaError", _) => return ErrorKind::Fatal,
            (_, "RATE_EXCEEDED") => return ErrorKind::RateLimited,
            (_, "TOO_MANY_MUTATE_OPERATIONS" | "TOO_MANY_OPERATIONS" | "REQUEST_SIZE_LIMIT_EXCEEDED") => {
                return ErrorKind::RequestTooLarge
            }
            ("internalError", _) => return ErrorKind::Transient,
            _ => {}
        }
    }

    match grpc_status {
        "RESOURCE_EXHAUSTED" => return ErrorKind::RateLimited,
        "UNAVAILABLE" | "DEADLINE_EXCEEDED" | "INTERNAL" | "ABORTED" => {
            return ErrorKind::Transient
        }
        "UNAUTHENTICATED" | "PERMISSION_DENIED" => return ErrorKind::Fatal,
        _ => {}
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::PAYLOAD_TOO_LARGE => ErrorKind::RequestTooLarge,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Fatal,
        s if s.is_server_error() => ErrorKind::Transient,
        _ => ErrorKind::Rejected,
    }
}
