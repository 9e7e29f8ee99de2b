use crate::eligibility::InventoryLookup;
use crate::models::{InventoryLevels, InventoryStatus};
use crate::sp_api::{ApiCall, ApiError, ApiResponse, ResilientClient};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

const SUMMARIES_PATH: &str = "/fba/inventory/v1/summaries";

#[derive(Debug, Default, Deserialize)]
struct SummariesEnvelope {
    #[serde(default)]
    payload: Option<SummariesPayload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummariesPayload {
    #[serde(default)]
    inventory_summaries: Vec<InventorySummary>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventorySummary {
    #[serde(default)]
    seller_sku: String,
    #[serde(default)]
    inventory_details: Option<InventoryDetails>,
    #[serde(default)]
    fulfillable_quantity: i64,
    #[serde(default)]
    inbound_quantity: i64,
    #[serde(default)]
    reserved_quantity: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventoryDetails {
    #[serde(default)]
    fulfillable_quantity: i64,
    #[serde(default)]
    inbound_working_quantity: i64,
    #[serde(default)]
    inbound_shipped_quantity: i64,
    #[serde(default)]
    inbound_receiving_quantity: i64,
    #[serde(default)]
    reserved_quantity: Option<ReservedQuantity>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservedQuantity {
    #[serde(default)]
    total_reserved_quantity: i64,
}

impl InventorySummary {
    fn levels(&self) -> InventoryLevels {
        match &self.inventory_details {
            Some(details) => InventoryLevels {
                fulfillable: details.fulfillable_quantity,
                inbound: details.inbound_working_quantity
                    + details.inbound_shipped_quantity
                    + details.inbound_receiving_quantity,
                reserved: details
                    .reserved_quantity
                    .as_ref()
                    .map(|r| r.total_reserved_quantity)
                    .unwrap_or_default(),
            },
            None => InventoryLevels {
                fulfillable: self.fulfillable_quantity,
                inbound: self.inbound_quantity,
                reserved: self.reserved_quantity,
            },
        }
    }
}

/// Picks the summary for `sku` out of an inventory summaries response.
/// An empty payload or one that does not mention the SKU means not found.
pub fn parse_summaries(sku: &str, body: Value) -> Result<InventoryStatus, ApiError> {
    if body.is_null() {
        return Ok(InventoryStatus::NotFound);
    }
    let envelope: SummariesEnvelope =
        serde_json::from_value(body).map_err(|err| ApiError::Decode(err.to_string()))?;
    let summaries = envelope
        .payload
        .map(|p| p.inventory_summaries)
        .unwrap_or_default();

    match summaries.iter().find(|s| s.seller_sku == sku) {
        Some(summary) => Ok(InventoryStatus::Levels(summary.levels())),
        None => {
            debug!(
                target: "cleanup.inventory",
                sku = sku,
                summaries = summaries.len(),
                "sku absent from inventory summaries"
            );
            Ok(InventoryStatus::NotFound)
        }
    }
}

/// Fulfillment-network inventory lookups, one SKU per request.
#[derive(Clone)]
pub struct FbaInventory {
    client: ResilientClient,
}

impl FbaInventory {
    pub fn new(client: ResilientClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InventoryLookup for FbaInventory {
    async fn check_inventory(&self, sku: &str) -> Result<InventoryStatus, ApiError> {
        let marketplace = self.client.marketplace_id();
        let call = ApiCall::get(SUMMARIES_PATH)
            .query("details", "true")
            .query("granularityType", "Marketplace")
            .query("granularityId", marketplace)
            .query("marketplaceIds", marketplace)
            .query("sellerSkus", sku)
            .expect(&[StatusCode::BAD_REQUEST, StatusCode::NOT_FOUND]);

        match self.client.call(call).await? {
            ApiResponse::Expected { status, .. } => {
                info!(
                    target: "cleanup.inventory",
                    sku = sku,
                    status = status.as_u16(),
                    "sku not known to fulfillment network"
                );
                Ok(InventoryStatus::NotFound)
            }
            ApiResponse::Json(body) => parse_summaries(sku, body),
        }
    }
}
