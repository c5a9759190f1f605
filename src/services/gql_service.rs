use log::{debug, error};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::services::auth_service::AuthState;
use crate::services::http_service::HttpClient;
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::rate_limiter::RateLimiter;

const GQL_URL: &str = "https://gql.twitch.tv/gql";
const GQL_TIMEOUT: Duration = Duration::from_secs(30);
/// Operations per batched POST.
pub const BATCH_LIMIT: usize = 16;
const MAX_ATTEMPTS: u32 = 5;

/// A persisted GraphQL operation: name, query hash and variables.
#[derive(Debug, Clone)]
pub struct GqlOperation {
    name: &'static str,
    sha256: &'static str,
    variables: Value,
}

impl GqlOperation {
    fn new(name: &'static str, sha256: &'static str, variables: Value) -> Self {
        Self { name, sha256, variables }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn to_value(&self) -> Value {
        json!({
            "operationName": self.name,
            "extensions": {
                "persistedQuery": {
                    "version": 1,
                    "sha256Hash": self.sha256,
                }
            },
            "variables": self.variables,
        })
    }

    /// All in-progress campaigns plus awarded benefits.
    pub fn inventory() -> Self {
        Self::new(
            "Inventory",
            "d86775d0ef16a63a33ad52e80eaff963b2d5b72fada7c991504a57496e1d8e4b",
            json!({"fetchRewardCampaigns": false}),
        )
    }

    /// All currently available/upcoming campaigns.
    pub fn campaigns() -> Self {
        Self::new(
            "ViewerDropsDashboard",
            "5a4da2ab3d5b47c9f9ce864e727b2cb346af1e3ea8b897fe8f704a97ff017619",
            json!({"fetchRewardCampaigns": false}),
        )
    }

    /// Extended information about one campaign.
    pub fn campaign_details(user_login: &str, campaign_id: &str) -> Self {
        Self::new(
            "DropCampaignDetails",
            "039277bf98f3130929262cc7c6efd9c141ca3749cb6dca442fc8ead9a53f77c1",
            json!({"channelLogin": user_login, "dropID": campaign_id}),
        )
    }

    /// The drop currently progressing on a channel.
    pub fn current_drop(channel_id: i64) -> Self {
        Self::new(
            "DropCurrentSessionContext",
            "4d06b702d25d652afb9ef835d2a550031f1cf762b193523a92166f40ea3d142b",
            json!({"channelID": channel_id.to_string(), "channelLogin": ""}),
        )
    }

    pub fn claim_drop(claim_id: &str) -> Self {
        Self::new(
            "DropsPage_ClaimDropRewards",
            "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930",
            json!({"input": {"dropInstanceID": claim_id}}),
        )
    }

    /// Stream information (and beacon refresh) for a channel login.
    pub fn get_stream_info(channel_login: &str) -> Self {
        Self::new(
            "VideoPlayerStreamInfoOverlayChannel",
            "198492e0857f6aedead9665c81c5a06d67b25b58034649687124083ff288597d",
            json!({"channel": channel_login}),
        )
    }

    /// Live channels for a game directory slug.
    pub fn game_directory(slug: &str, limit: usize, drops_enabled: bool) -> Self {
        let filters: Vec<&str> = if drops_enabled { vec!["DROPS_ENABLED"] } else { vec![] };
        Self::new(
            "DirectoryPage_Game",
            "98a996c3c3ebb1ba4fd65d6671c6028d7ee8d615cb540b0731b3db2a911d3649",
            json!({
                "limit": limit,
                "slug": slug,
                "imageWidth": 50,
                "includeCostreaming": false,
                "options": {
                    "broadcasterLanguages": [],
                    "freeformTags": null,
                    "includeRestricted": ["SUB_ONLY_LIVE"],
                    "recommendationsContext": {"platform": "web"},
                    "sort": "RELEVANCE",
                    "systemFilters": filters,
                    "tags": [],
                    "requestID": "JIRA-VXP-2397",
                },
                "sortTypeIsRecency": false,
            }),
        )
    }

    /// Turn a game name into its directory slug.
    pub fn slug_redirect(game_name: &str) -> Self {
        Self::new(
            "DirectoryGameRedirect",
            "1f0300090caceec51f33c5e20647aceff9017f740f223c3c532ba6fa59f6b6cc",
            json!({"name": game_name}),
        )
    }

    pub fn notifications_delete(notification_id: &str) -> Self {
        Self::new(
            "OnsiteNotifications_DeleteNotification",
            "13d463c831f28ffe17dccf55b3148ed8b3edbbd0ebadd56352f1ff0160616816",
            json!({"input": {"id": notification_id}}),
        )
    }
}

enum GqlVerdict {
    Ok,
    Retry,
    Fail(String),
}

/// GraphQL client: rate limited, retrying, batch-aware.
pub struct GqlClient {
    http: Arc<HttpClient>,
    auth: Arc<AuthState>,
    limiter: RateLimiter,
}

impl GqlClient {
    pub fn new(http: Arc<HttpClient>, auth: Arc<AuthState>) -> Self {
        Self { http, auth, limiter: RateLimiter::for_gql() }
    }

    /// Execute one operation.
    pub async fn request(&self, op: GqlOperation) -> Result<Value> {
        let mut results = self.send_payload(json!([op.to_value()])).await?;
        results
            .pop()
            .ok_or_else(|| Error::Gql("empty response for single operation".into()))
    }

    /// Execute many operations, preserving order.
    ///
    /// Operations are posted in batches of up to 16; each sub-result is
    /// matched back to its operation by index.
    pub async fn request_batch(&self, ops: Vec<GqlOperation>) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(ops.len());
        for batch in ops.chunks(BATCH_LIMIT) {
            let payload: Vec<Value> = batch.iter().map(GqlOperation::to_value).collect();
            let batch_results = self.send_payload(Value::Array(payload)).await?;
            if batch_results.len() != batch.len() {
                return Err(Error::Gql(format!(
                    "batch size mismatch: sent {}, received {}",
                    batch.len(),
                    batch_results.len()
                )));
            }
            results.extend(batch_results);
        }
        Ok(results)
    }

    async fn send_payload(&self, payload: Value) -> Result<Vec<Value>> {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut single_retry = true;
        loop {
            self.limiter.acquire().await;
            let headers = self.auth.headers(true).await;
            let body = payload.clone();
            let response = self
                .http
                .execute(GQL_URL, move |client| {
                    client
                        .post(GQL_URL)
                        .timeout(GQL_TIMEOUT)
                        .headers(headers.clone())
                        .json(&body)
                })
                .await?;
            let response_json: Value = response
                .json()
                .await
                .map_err(|e| Error::Request(format!("GQL response body: {e}")))?;

            let results: Vec<Value> = match response_json {
                Value::Array(list) => list,
                single => vec![single],
            };

            let mut verdict = GqlVerdict::Ok;
            for result in &results {
                match Self::inspect(result, &mut single_retry) {
                    GqlVerdict::Ok => {}
                    GqlVerdict::Retry => {
                        verdict = GqlVerdict::Retry;
                        break;
                    }
                    GqlVerdict::Fail(msg) => {
                        verdict = GqlVerdict::Fail(msg);
                        break;
                    }
                }
            }

            match verdict {
                GqlVerdict::Ok => return Ok(results),
                GqlVerdict::Fail(msg) => return Err(Error::Gql(msg)),
                GqlVerdict::Retry => {
                    if backoff.attempt() + 1 >= MAX_ATTEMPTS {
                        return Err(Error::Gql("retries exhausted".into()));
                    }
                    let delay = backoff.next_delay().max(Duration::from_secs(5));
                    error!(
                        "[GQL] Service error, retrying in {:.0}s (attempt {})",
                        delay.as_secs_f64(),
                        backoff.attempt()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Classify a single sub-response.
    fn inspect(result: &Value, single_retry: &mut bool) -> GqlVerdict {
        if let Some(errors) = result.get("errors").and_then(Value::as_array) {
            for error_entry in errors {
                let message = error_entry
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match message {
                    "service error" | "PersistedQueryNotFound" if *single_retry => {
                        debug!("[GQL] Retrying once for: {message}");
                        *single_retry = false;
                        return GqlVerdict::Retry;
                    }
                    "service timeout" | "service unavailable" | "context deadline exceeded" => {
                        return GqlVerdict::Retry;
                    }
                    _ => {}
                }
            }
            return GqlVerdict::Fail(
                serde_json::to_string(errors).unwrap_or_else(|_| "unknown GQL error".into()),
            );
        }
        if let Some(error) = result.get("error") {
            let message = result.get("message").and_then(Value::as_str).unwrap_or_default();
            return GqlVerdict::Fail(format!("{error}: {message}"));
        }
        GqlVerdict::Ok
    }
}

/// Recursively merge two JSON objects, preferring `primary`.
///
/// Used to overlay detailed campaign data over the inventory listing.
pub fn merge_data(primary: &Value, secondary: &Value) -> Value {
    match (primary, secondary) {
        (Value::Object(p), Value::Object(s)) => {
            let mut merged = serde_json::Map::new();
            for key in p.keys().chain(s.keys()) {
                if merged.contains_key(key) {
                    continue;
                }
                let value = match (p.get(key), s.get(key)) {
                    (Some(pv), Some(sv)) => merge_data(pv, sv),
                    (Some(pv), None) => pv.clone(),
                    (None, Some(sv)) => sv.clone(),
                    (None, None) => unreachable!(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (pv, _) => pv.clone(),
    }
}
