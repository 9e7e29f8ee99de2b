use crate::metrics;
use crate::models::{
    CatalogItem, EligibilityDecision, ErrorKind, InventoryCheck, InventoryStatus,
    RawCatalogRecord,
};
use crate::sp_api::ApiError;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Current stock for one SKU in the fulfillment network.
#[async_trait]
pub trait InventoryLookup: Send + Sync {
    async fn check_inventory(&self, sku: &str) -> Result<InventoryStatus, ApiError>;
}

/// Parses a catalog creation date. Only the date part is significant:
/// `dd/mm/yyyy` optionally followed by a time and zone, or ISO `yyyy-mm-dd...`.
pub fn parse_created_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.split_whitespace().next()?;
    if let Ok(date) = NaiveDate::parse_from_str(date_part, "%d/%m/%Y") {
        return Some(date);
    }
    let iso = date_part.get(..10)?;
    NaiveDate::parse_from_str(iso, "%Y-%m-%d").ok()
}

pub struct EligibilityProcessor {
    lookup: Arc<dyn InventoryLookup>,
    age_threshold_days: i64,
    today: Option<NaiveDate>,
}

impl EligibilityProcessor {
    pub fn new(lookup: Arc<dyn InventoryLookup>, age_threshold_days: i64) -> Self {
        Self {
            lookup,
            age_threshold_days,
            today: None,
        }
    }

    /// Pins the evaluation date instead of reading the clock.
    #[cfg(test)]
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn age_days(&self, created_date: &str) -> Option<i64> {
        match parse_created_date(created_date) {
            Some(date) => Some((self.today() - date).num_days()),
            None => {
                if !created_date.is_empty() {
                    warn!(
                        target: "cleanup.eligibility",
                        created_date = created_date,
                        "unparseable creation date"
                    );
                }
                None
            }
        }
    }

    pub async fn evaluate(&self, item: CatalogItem) -> EligibilityDecision {
        let age_days = self.age_days(&item.created_date);
        let is_old_enough = age_days.is_some_and(|age| age >= self.age_threshold_days);

        if !is_old_enough {
            metrics::inventory_check("skipped");
            return EligibilityDecision::new(item, age_days, false, InventoryCheck::Skipped);
        }
        if !item.fulfillment_channel.is_marketplace() {
            metrics::inventory_check("not_applicable");
            return EligibilityDecision::new(item, age_days, true, InventoryCheck::NotApplicable);
        }

        let check = match self.lookup.check_inventory(&item.sku).await {
            Ok(status) => {
                metrics::inventory_check("checked");
                let check = InventoryCheck::checked(status.levels());
                if let InventoryCheck::Checked {
                    fulfillable,
                    inbound,
                    has_inventory,
                    ..
                } = &check
                {
                    info!(
                        target: "cleanup.eligibility",
                        sku = %item.sku,
                        age_days = age_days,
                        fulfillable = fulfillable,
                        inbound = inbound,
                        has_inventory = has_inventory,
                        not_found = matches!(status, InventoryStatus::NotFound),
                        "inventory checked"
                    );
                }
                check
            }
            Err(err) => {
                let kind = err.kind();
                metrics::inventory_check("error");
                metrics::inventory_error(kind);
                match kind {
                    ErrorKind::CircuitOpen => warn!(
                        target: "cleanup.eligibility",
                        sku = %item.sku,
                        "inventory check blocked by open circuit breaker, keeping listing"
                    ),
                    ErrorKind::RateLimit => warn!(
                        target: "cleanup.eligibility",
                        sku = %item.sku,
                        error = %err,
                        "inventory check rate limited, keeping listing"
                    ),
                    _ => warn!(
                        target: "cleanup.eligibility",
                        sku = %item.sku,
                        kind = %kind,
                        error = %err,
                        "inventory check failed, keeping listing"
                    ),
                }
                InventoryCheck::error(kind, err.to_string())
            }
        };
        EligibilityDecision::new(item, age_days, true, check)
    }

    /// Evaluates every record in order. Records without a SKU are logged and
    /// dropped; a failed lookup only affects its own record.
    pub async fn process_batch(&self, records: &[RawCatalogRecord]) -> Vec<EligibilityDecision> {
        let mut decisions = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let Some(item) = CatalogItem::from_raw(record) else {
                warn!(
                    target: "cleanup.eligibility",
                    index = index,
                    "skipping record without sku"
                );
                continue;
            };
            debug!(
                target: "cleanup.eligibility",
                sku = %item.sku,
                created_date = %item.created_date,
                "evaluating"
            );
            decisions.push(self.evaluate(item).await);
        }
        decisions
    }
}

pub fn deletable(decisions: &[EligibilityDecision]) -> Vec<&EligibilityDecision> {
    decisions
        .iter()
        .filter(|d| d.is_eligible_for_deletion())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogStatistics {
    pub total: usize,
    pub old_enough: usize,
    pub marketplace_fulfilled: usize,
    pub deletable: usize,
    pub average_age_days: f64,
    pub oldest_age_days: Option<i64>,
    pub newest_age_days: Option<i64>,
}

impl CatalogStatistics {
    pub fn from_decisions(decisions: &[EligibilityDecision]) -> Self {
        let ages: Vec<i64> = decisions.iter().filter_map(|d| d.age_days).collect();
        let average_age_days = match ages.len() {
            0 => 0.0,
            n => ages.iter().sum::<i64>() as f64 / n as f64,
        };
        Self {
            total: decisions.len(),
            old_enough: decisions.iter().filter(|d| d.is_old_enough).count(),
            marketplace_fulfilled: decisions
                .iter()
                .filter(|d| d.item.fulfillment_channel.is_marketplace())
                .count(),
            deletable: decisions
                .iter()
                .filter(|d| d.is_eligible_for_deletion())
                .count(),
            average_age_days,
            oldest_age_days: ages.iter().copied().max(),
            newest_age_days: ages.iter().copied().min(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::InventoryLevels;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted lookup that counts calls per SKU.
    #[derive(Default)]
    pub struct FakeLookup {
        responses: Mutex<HashMap<String, Result<InventoryStatus, ApiError>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl FakeLookup {
        pub fn with_levels(self, sku: &str, fulfillable: i64, inbound: i64) -> Self {
            self.responses.lock().insert(
                sku.to_string(),
                Ok(InventoryStatus::Levels(InventoryLevels {
                    fulfillable,
                    inbound,
                    reserved: 0,
                })),
            );
            self
        }

        pub fn with_error(self, sku: &str, err: ApiError) -> Self {
            self.responses.lock().insert(sku.to_string(), Err(err));
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl InventoryLookup for FakeLookup {
        async fn check_inventory(&self, sku: &str) -> Result<InventoryStatus, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(sku.to_string());
            self.responses
                .lock()
                .get(sku)
                .cloned()
                .unwrap_or(Ok(InventoryStatus::NotFound))
        }
    }
}
