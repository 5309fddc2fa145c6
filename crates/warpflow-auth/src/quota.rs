//! Upstream quota probe.
//!
//! Queries the upstream GraphQL endpoint for the account's request-limit
//! window and normalizes the answer into a [`QuotaSnapshot`]. Unlimited
//! accounts are normalized at this boundary (see
//! [`QuotaSnapshot::from_report`]).

use std::time::Duration;

use serde_json::Value;
use tracing::instrument;

use warpflow_core::{Config, QuotaSnapshot};

use crate::errors::AuthError;

/// Probe request timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

const QUOTA_QUERY: &str = "\
query GetRequestLimitInfo($requestContext: RequestContext!) {
  user(requestContext: $requestContext) {
    __typename
    ... on UserOutput {
      user {
        requestLimitInfo {
          isUnlimited
          nextRefreshTime
          requestLimit
          requestsUsedSinceLastRefresh
          requestLimitRefreshDuration
        }
      }
    }
    ... on UserFacingError {
      error {
        __typename
        message
      }
    }
  }
}";

/// Fetches quota snapshots from the upstream API.
pub struct QuotaProbe {
    client: reqwest::Client,
    url: String,
    client_version: String,
    os_category: String,
    os_name: String,
    os_version: String,
}

impl QuotaProbe {
    /// Create a probe sharing the gateway's HTTP client.
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            url: config.upstream_quota_url.clone(),
            client_version: config.client_version.clone(),
            os_category: config.os_category.clone(),
            os_name: config.os_name.clone(),
            os_version: config.os_version.clone(),
        }
    }

    /// Query the request-limit window visible to `access_token`.
    #[instrument(skip_all)]
    pub async fn fetch(&self, access_token: &str) -> Result<QuotaSnapshot, AuthError> {
        let payload = serde_json::json!({
            "operationName": "GetRequestLimitInfo",
            "variables": {
                "requestContext": {
                    "clientContext": { "version": self.client_version },
                    "osContext": {
                        "category": self.os_category,
                        "linuxKernelVersion": null,
                        "name": self.os_name,
                        "version": self.os_version,
                    },
                }
            },
            "query": QUOTA_QUERY,
        });

        let resp = self
            .client
            .post(&self.url)
            .timeout(PROBE_TIMEOUT)
            .bearer_auth(access_token)
            .header("x-warp-client-id", "warp-app")
            .header("x-warp-client-version", &self.client_version)
            .header("x-warp-os-category", &self.os_category)
            .header("x-warp-os-name", &self.os_name)
            .header("x-warp-os-version", &self.os_version)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let snippet: String = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(400)
                .collect();
            return Err(AuthError::Quota(format!("http {status}: {snippet}")));
        }

        let data: Value = resp.json().await?;
        parse_quota_response(&data)
    }
}

/// Parse the GraphQL response into a snapshot.
fn parse_quota_response(data: &Value) -> Result<QuotaSnapshot, AuthError> {
    if let Some(errors) = data["errors"].as_array() {
        if let Some(first) = errors.first() {
            let msg = first["message"].as_str().unwrap_or("graphql error");
            return Err(AuthError::Quota(msg.to_string()));
        }
    }

    let user_node = &data["data"]["user"];
    match user_node["__typename"].as_str() {
        Some("UserOutput") => {}
        Some("UserFacingError") => {
            let msg = user_node["error"]["message"].as_str().unwrap_or("user error");
            return Err(AuthError::Quota(msg.to_string()));
        }
        other => {
            return Err(AuthError::Quota(format!(
                "unexpected typename: {}",
                other.unwrap_or("unknown")
            )));
        }
    }

    let info = &user_node["user"]["requestLimitInfo"];
    Ok(QuotaSnapshot::from_report(
        info["requestLimit"].as_i64().unwrap_or(0),
        info["requestsUsedSinceLastRefresh"].as_i64().unwrap_or(0),
        info["isUnlimited"].as_bool().unwrap_or(false),
        info["nextRefreshTime"].as_str().map(String::from),
        info["requestLimitRefreshDuration"]
            .as_str()
            .map(String::from)
            .or_else(|| Some("WEEKLY".into())),
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_limited_account() {
        let data = json!({
            "data": { "user": {
                "__typename": "UserOutput",
                "user": { "requestLimitInfo": {
                    "isUnlimited": false,
                    "requestLimit": 2500,
                    "requestsUsedSinceLastRefresh": 300,
                    "nextRefreshTime": "2026-08-09T00:00:00Z",
                    "requestLimitRefreshDuration": "WEEKLY"
                }}
            }}
        });
        let quota = parse_quota_response(&data).unwrap();
        assert_eq!(quota.limit, 2500);
        assert_eq!(quota.used, 300);
        assert_eq!(quota.remaining, 2200);
        assert!(!quota.is_unlimited);
        assert_eq!(quota.refresh_duration.as_deref(), Some("WEEKLY"));
    }

    #[test]
    fn parses_unlimited_account() {
        let data = json!({
            "data": { "user": {
                "__typename": "UserOutput",
                "user": { "requestLimitInfo": {
                    "isUnlimited": true,
                    "requestLimit": 2500,
                    "requestsUsedSinceLastRefresh": 9999
                }}
            }}
        });
        let quota = parse_quota_response(&data).unwrap();
        assert!(quota.is_unlimited);
        assert_eq!(quota.limit, -1);
        assert_eq!(quota.remaining, -1);
        assert!(!quota.is_exhausted());
    }

    #[test]
    fn user_facing_error_propagates() {
        let data = json!({
            "data": { "user": {
                "__typename": "UserFacingError",
                "error": { "message": "account suspended" }
            }}
        });
        let err = parse_quota_response(&data).unwrap_err();
        assert!(err.to_string().contains("account suspended"));
    }

    #[test]
    fn graphql_errors_propagate() {
        let data = json!({ "errors": [{ "message": "rate limited" }] });
        let err = parse_quota_response(&data).unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn unexpected_shape_is_an_error() {
        let data = json!({ "data": { "user": { "__typename": "Mystery" } } });
        assert!(parse_quota_response(&data).is_err());
    }
}
