use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DurationSecondsWithFrac, serde_as};
use std::{fmt, time::Duration};
use uuid::Uuid;

/// A row as delivered by the catalog source, before validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawCatalogRecord {
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub created_date: String,
    #[serde(default)]
    pub fulfillment_channel: String,
    #[serde(default)]
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogItem {
    pub sku: String,
    pub created_date: String,
    pub fulfillment_channel: FulfillmentChannel,
    pub quantity: i64,
}

impl CatalogItem {
    pub fn from_raw(raw: &RawCatalogRecord) -> Option<Self> {
        let sku = raw.sku.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some(Self {
            sku: sku.to_string(),
            created_date: raw.created_date.trim().to_string(),
            fulfillment_channel: FulfillmentChannel::parse(&raw.fulfillment_channel),
            quantity: raw.quantity,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum FulfillmentChannel {
    /// Shipped by the seller (`DEFAULT`, `MERCHANT` or blank).
    SelfFulfilled,
    /// Stock held in marketplace fulfillment centers (`AMAZON`, `AMAZON_EU`, `AMAZON_NA`, ...).
    MarketplaceFulfilled(String),
}

impl FulfillmentChannel {
    pub fn parse(raw: &str) -> Self {
        let code = raw.trim().to_uppercase();
        if code.starts_with("AMAZON") {
            FulfillmentChannel::MarketplaceFulfilled(code)
        } else {
            FulfillmentChannel::SelfFulfilled
        }
    }

    pub fn is_marketplace(&self) -> bool {
        matches!(self, FulfillmentChannel::MarketplaceFulfilled(_))
    }
}

/// Error taxonomy shared by the API layer and eligibility diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    ServerError,
    Network,
    AuthError,
    NotFound,
    CircuitOpen,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Network => "network",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InventoryLevels {
    pub fulfillable: i64,
    pub inbound: i64,
    pub reserved: i64,
}

impl InventoryLevels {
    pub fn has_inventory(&self) -> bool {
        self.fulfillable > 0 || self.inbound > 0
    }
}

/// What the inventory lookup reports for one SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryStatus {
    Levels(InventoryLevels),
    /// Unknown to the fulfillment network; treated as zero stock.
    NotFound,
}

impl InventoryStatus {
    pub fn levels(&self) -> InventoryLevels {
        match self {
            InventoryStatus::Levels(levels) => *levels,
            InventoryStatus::NotFound => InventoryLevels::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InventoryCheck {
    /// Too young to consider; no lookup made.
    Skipped,
    /// Self-fulfilled; nothing in fulfillment centers to check.
    NotApplicable,
    Checked {
        fulfillable: i64,
        inbound: i64,
        reserved: i64,
        has_inventory: bool,
    },
    Error {
        kind: ErrorKind,
        message: String,
        safe_decision: bool,
    },
}

impl InventoryCheck {
    pub fn checked(levels: InventoryLevels) -> Self {
        InventoryCheck::Checked {
            fulfillable: levels.fulfillable,
            inbound: levels.inbound,
            reserved: levels.reserved,
            has_inventory: levels.has_inventory(),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        InventoryCheck::Error {
            kind,
            message: message.into(),
            safe_decision: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EligibilityDecision {
    pub item: CatalogItem,
    pub age_days: Option<i64>,
    pub is_old_enough: bool,
    pub inventory_check: InventoryCheck,
    is_eligible_for_deletion: bool,
}

impl EligibilityDecision {
    /// Derives eligibility from the other fields so it can never disagree
    /// with them: old enough and either self-fulfilled or checked with no stock.
    pub fn new(
        item: CatalogItem,
        age_days: Option<i64>,
        is_old_enough: bool,
        inventory_check: InventoryCheck,
    ) -> Self {
        let cleared = match (&item.fulfillment_channel, &inventory_check) {
            (_, InventoryCheck::Error { .. }) => false,
            (FulfillmentChannel::SelfFulfilled, _) => true,
            (
                FulfillmentChannel::MarketplaceFulfilled(_),
                InventoryCheck::Checked { has_inventory, .. },
            ) => !has_inventory,
            _ => false,
        };
        Self {
            is_eligible_for_deletion: is_old_enough && cleared,
            item,
            age_days,
            is_old_enough,
            inventory_check,
        }
    }

    pub fn sku(&self) -> &str {
        &self.item.sku
    }

    pub fn is_eligible_for_deletion(&self) -> bool {
        self.is_eligible_for_deletion
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeletionStatus {
    Accepted,
    Rejected { issues: Vec<String> },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSku {
    pub sku: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkuError {
    pub sku: String,
    pub error: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
            error: None,
        }
    }

    pub fn failed(name: &str, elapsed_ms: u128, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(name, elapsed_ms, Value::Null)
        }
    }
}

/// Outcome of one cleanup run, handed to the report sinks.
#[serde_as]
#[derive(Debug, Serialize, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub total_records: usize,
    pub total_processed: usize,
    pub eligible_for_deletion: usize,
    pub new_eligible: usize,
    pub previously_processed_eligible: usize,
    pub in_cooldown: usize,
    pub deleted: Vec<String>,
    pub verified: Vec<String>,
    pub skipped: Vec<SkippedSku>,
    pub errors: Vec<SkuError>,
    pub stages: Vec<StageReport>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub elapsed: Duration,
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            dry_run,
            total_records: 0,
            total_processed: 0,
            eligible_for_deletion: 0,
            new_eligible: 0,
            previously_processed_eligible: 0,
            in_cooldown: 0,
            deleted: Vec::new(),
            verified: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            stages: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// No SKU errors and no failed stage.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.stages.iter().all(|stage| stage.error.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(channel: &str) -> CatalogItem {
        CatalogItem {
            sku: "SKU-1".into(),
            created_date: "01/01/2020".into(),
            fulfillment_channel: FulfillmentChannel::parse(channel),
            quantity: 0,
        }
    }

    #[test]
    fn channel_parsing() {
        assert!(FulfillmentChannel::parse("AMAZON_EU").is_marketplace());
        assert!(FulfillmentChannel::parse(" amazon_na ").is_marketplace());
        assert!(!FulfillmentChannel::parse("DEFAULT").is_marketplace());
        assert!(!FulfillmentChannel::parse("").is_marketplace());
    }

    #[test]
    fn raw_record_without_sku_is_rejected() {
        let raw = RawCatalogRecord {
            sku: Some("   ".into()),
            ..RawCatalogRecord::default()
        };
        assert!(CatalogItem::from_raw(&raw).is_none());
        assert!(CatalogItem::from_raw(&RawCatalogRecord::default()).is_none());
    }

    #[test]
    fn eligibility_is_derived_from_inputs() {
        let merchant = EligibilityDecision::new(item("DEFAULT"), Some(90), true, InventoryCheck::NotApplicable);
        assert!(merchant.is_eligible_for_deletion());

        let young = EligibilityDecision::new(item("DEFAULT"), Some(3), false, InventoryCheck::Skipped);
        assert!(!young.is_eligible_for_deletion());

        let empty = InventoryCheck::checked(InventoryLevels::default());
        let fba_empty = EligibilityDecision::new(item("AMAZON_EU"), Some(90), true, empty);
        assert!(fba_empty.is_eligible_for_deletion());

        let stocked = InventoryCheck::checked(InventoryLevels {
            inbound: 2,
            ..InventoryLevels::default()
        });
        let fba_stocked = EligibilityDecision::new(item("AMAZON_EU"), Some(90), true, stocked);
        assert!(!fba_stocked.is_eligible_for_deletion());

        let failed = InventoryCheck::error(ErrorKind::Network, "timed out");
        let fba_failed = EligibilityDecision::new(item("AMAZON_EU"), Some(90), true, failed);
        assert!(!fba_failed.is_eligible_for_deletion());
    }

    #[test]
    fn run_report_serializes_elapsed_as_seconds() {
        let mut report = RunReport::new(true);
        report.elapsed = Duration::from_millis(1500);
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["elapsed"], serde_json::json!(1.5));
        assert_eq!(json["dry_run"], serde_json::json!(true));
    }
}
