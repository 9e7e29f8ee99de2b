use crate::cleanup::DeletionExecutor;
use crate::models::DeletionStatus;
use crate::sp_api::{ApiCall, ApiError, ApiResponse, ResilientClient};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use urlencoding::encode;

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    issues: Vec<Issue>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn parse_delete_response(body: Value) -> Result<DeletionStatus, ApiError> {
    let response: DeleteResponse =
        serde_json::from_value(body).map_err(|err| ApiError::Decode(err.to_string()))?;
    match response.status.as_str() {
        "ACCEPTED" => Ok(DeletionStatus::Accepted),
        "INVALID" => Ok(DeletionStatus::Rejected {
            issues: response
                .issues
                .into_iter()
                .map(|issue| match issue.code.is_empty() {
                    true => issue.message,
                    false => format!("{}: {}", issue.code, issue.message),
                })
                .collect(),
        }),
        other => Err(ApiError::Decode(format!(
            "unexpected deletion status `{other}`"
        ))),
    }
}

/// Deletes listings through the Listings Items API.
#[derive(Clone)]
pub struct ListingsClient {
    client: ResilientClient,
}

impl ListingsClient {
    pub fn new(client: ResilientClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeletionExecutor for ListingsClient {
    async fn delete_sku(&self, sku: &str) -> Result<DeletionStatus, ApiError> {
        let path = format!(
            "/listings/2021-08-01/items/{}/{}",
            encode(self.client.seller_id()),
            encode(sku)
        );
        let call = ApiCall::delete(path)
            .query("marketplaceIds", self.client.marketplace_id())
            .expect(&[StatusCode::NOT_FOUND]);

        let status = match self.client.call(call).await? {
            ApiResponse::Expected { .. } => DeletionStatus::NotFound,
            ApiResponse::Json(body) => parse_delete_response(body)?,
        };
        match &status {
            DeletionStatus::Accepted => {
                info!(target: "cleanup.listings", sku = sku, "deletion accepted")
            }
            DeletionStatus::NotFound => warn!(
                target: "cleanup.listings",
                sku = sku,
                "listing not found, may already be deleted"
            ),
            DeletionStatus::Rejected { issues } => warn!(
                target: "cleanup.listings",
                sku = sku,
                issues = ?issues,
                "deletion rejected as invalid"
            ),
        }
        Ok(status)
    }
}
