use crate::config::CleanupSettings;
use crate::eligibility::{CatalogStatistics, EligibilityProcessor, deletable};
use crate::ledger::{CooldownLedger, LedgerError};
use crate::models::{
    DeletionStatus, EligibilityDecision, RawCatalogRecord, RunReport, SkippedSku, SkuError,
    StageReport,
};
use crate::sp_api::ApiError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{SeedableRng, rngs::StdRng, seq::index};
use serde_json::{Value, json};
use std::{
    collections::HashSet,
    future::Future,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tracing::{error, info, warn};

const TEST_SAMPLE_SEED: u64 = 42;

/// Produces the full live catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Vec<RawCatalogRecord>, ApiError>;
}

#[async_trait]
pub trait DeletionExecutor: Send + Sync {
    async fn delete_sku(&self, sku: &str) -> Result<DeletionStatus, ApiError>;
}

pub trait ReportSink: Send + Sync {
    fn publish(&self, report: &RunReport) -> Result<(), CleanupError>;
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("catalog fetch failed: {0}")]
    Catalog(#[source] ApiError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("report sink failed: {0}")]
    Report(String),
}

/// Writes the run summary to the log.
pub struct LogSink;

impl ReportSink for LogSink {
    fn publish(&self, report: &RunReport) -> Result<(), CleanupError> {
        info!(
            target: "cleanup.run",
            run_id = %report.run_id,
            dry_run = report.dry_run,
            total_records = report.total_records,
            total_processed = report.total_processed,
            eligible = report.eligible_for_deletion,
            new_eligible = report.new_eligible,
            previously_processed = report.previously_processed_eligible,
            in_cooldown = report.in_cooldown,
            deleted = report.deleted.len(),
            verified = report.verified.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            elapsed_secs = report.elapsed.as_secs_f64(),
            "cleanup run finished"
        );
        for failure in &report.errors {
            warn!(target: "cleanup.run", sku = %failure.sku, error = %failure.error, "sku failed");
        }
        Ok(())
    }
}

/// Writes the run report as pretty JSON.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReportSink for JsonFileSink {
    fn publish(&self, report: &RunReport) -> Result<(), CleanupError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|err| CleanupError::Report(format!("{}: {err}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(report)
            .map_err(|err| CleanupError::Report(err.to_string()))?;
        std::fs::write(&self.path, json)
            .map_err(|err| CleanupError::Report(format!("{}: {err}", self.path.display())))?;
        info!(target: "cleanup.run", path = %self.path.display(), "report written");
        Ok(())
    }
}

#[derive(Debug)]
struct StageOutcome<T> {
    value: T,
    output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

async fn capture_stage<T, Fut>(
    name: &'static str,
    stages: &mut Vec<StageReport>,
    fut: Fut,
) -> Result<T, CleanupError>
where
    Fut: Future<Output = Result<StageOutcome<T>, CleanupError>>,
{
    let started = Instant::now();
    let result = fut.await;
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    match result {
        Ok(outcome) => {
            stages.push(StageReport::new(name, elapsed_ms, outcome.output));
            Ok(outcome.value)
        }
        Err(err) => {
            stages.push(StageReport::failed(name, elapsed_ms, err.to_string()));
            Err(err)
        }
    }
}

#[derive(Debug, Default)]
struct Candidates {
    skus: Vec<String>,
    new_eligible: usize,
    previously_processed: usize,
    in_cooldown: usize,
}

#[derive(Debug, Default)]
struct DeletionOutcome {
    deleted: Vec<String>,
    skipped: Vec<SkippedSku>,
    errors: Vec<SkuError>,
}

/// One cleanup pass: fetch, evaluate in batches, pick candidates outside
/// cooldown, delete, verify by re-fetching and record verified deletions.
pub struct CleanupRun {
    catalog: Arc<dyn CatalogSource>,
    processor: EligibilityProcessor,
    deleter: Arc<dyn DeletionExecutor>,
    ledger: CooldownLedger,
    sinks: Vec<Box<dyn ReportSink>>,
    settings: CleanupSettings,
}

impl CleanupRun {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        processor: EligibilityProcessor,
        deleter: Arc<dyn DeletionExecutor>,
        ledger: CooldownLedger,
        settings: CleanupSettings,
    ) -> Self {
        Self {
            catalog,
            processor,
            deleter,
            ledger,
            sinks: Vec::new(),
            settings,
        }
    }

    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &CooldownLedger {
        &self.ledger
    }

    pub async fn run(&mut self) -> Result<RunReport, CleanupError> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&mut self, now: DateTime<Utc>) -> Result<RunReport, CleanupError> {
        let started = Instant::now();
        let mut report = RunReport::new(self.settings.dry_run);
        info!(
            target: "cleanup.run",
            run_id = %report.run_id,
            dry_run = self.settings.dry_run,
            test_mode = self.settings.test_mode,
            "starting cleanup run"
        );
        if self.settings.test_mode && !self.settings.dry_run {
            warn!(
                target: "cleanup.run",
                "test mode with dry run disabled: sampled listings will really be deleted"
            );
        }

        let records = capture_stage("fetch_catalog", &mut report.stages, async {
            let records = self
                .catalog
                .fetch_catalog()
                .await
                .map_err(CleanupError::Catalog)?;
            let output = json!({ "records": records.len() });
            Ok(StageOutcome::new(records, output))
        })
        .await?;
        let live = sku_set(&records);
        let records = self.apply_test_mode(records);
        report.total_records = records.len();

        let decisions = capture_stage("evaluate", &mut report.stages, async {
            let decisions = self.evaluate_in_batches(&records).await;
            let stats = CatalogStatistics::from_decisions(&decisions);
            info!(
                target: "cleanup.eligibility",
                total = stats.total,
                old_enough = stats.old_enough,
                marketplace_fulfilled = stats.marketplace_fulfilled,
                deletable = stats.deletable,
                average_age_days = stats.average_age_days,
                "catalog statistics"
            );
            Ok(StageOutcome::new(decisions, json!(stats)))
        })
        .await?;
        report.total_processed = decisions.len();

        let pruned = self.ledger.prune_absent(&live)?;
        let candidates = self.select_candidates(&decisions, now);
        report.stages.push(StageReport::new(
            "select_candidates",
            0,
            json!({
                "pruned": pruned,
                "candidates": candidates.skus.len(),
                "in_cooldown": candidates.in_cooldown,
            }),
        ));
        report.eligible_for_deletion = candidates.skus.len();
        report.new_eligible = candidates.new_eligible;
        report.previously_processed_eligible = candidates.previously_processed;
        report.in_cooldown = candidates.in_cooldown;

        let outcome = capture_stage("execute_deletions", &mut report.stages, async {
            let outcome = self.execute_deletions(&candidates.skus).await;
            let output = json!({
                "deleted": outcome.deleted.len(),
                "skipped": outcome.skipped.len(),
                "errors": outcome.errors.len(),
            });
            Ok(StageOutcome::new(outcome, output))
        })
        .await?;

        if !self.settings.dry_run && !outcome.deleted.is_empty() {
            let verified = capture_stage("verify_deletions", &mut report.stages, async {
                let verified = self.verify_deletions(&outcome.deleted).await;
                let output = json!({ "verified": verified.as_ref().map(Vec::len).ok() });
                Ok(StageOutcome::new(verified, output))
            })
            .await?;
            if let Ok(verified) = verified {
                let recorded = capture_stage("record_ledger", &mut report.stages, async {
                    self.ledger.record_verified(&verified, now)?;
                    Ok(StageOutcome::new((), json!({ "recorded": verified.len() })))
                })
                .await;
                if let Err(err) = recorded {
                    error!(
                        target: "cleanup.ledger",
                        error = %err,
                        verified = verified.len(),
                        "could not record verified deletions; their cooldowns are lost"
                    );
                }
                report.verified = verified;
            }
        }

        report.deleted = outcome.deleted;
        report.skipped = outcome.skipped;
        report.errors = outcome.errors;
        report.elapsed = started.elapsed();

        for sink in &self.sinks {
            if let Err(err) = sink.publish(&report) {
                error!(target: "cleanup.run", error = %err, "report sink failed");
            }
        }
        Ok(report)
    }

    fn apply_test_mode(&self, records: Vec<RawCatalogRecord>) -> Vec<RawCatalogRecord> {
        if !self.settings.test_mode {
            return records;
        }
        if !self.settings.test_seed_skus.is_empty() {
            let seeds: HashSet<&str> = self
                .settings
                .test_seed_skus
                .iter()
                .map(String::as_str)
                .collect();
            let seeded: Vec<RawCatalogRecord> = records
                .iter()
                .filter(|r| r.sku.as_deref().is_some_and(|sku| seeds.contains(sku)))
                .cloned()
                .collect();
            if !seeded.is_empty() {
                info!(target: "cleanup.run", found = seeded.len(), "test mode using seed skus");
                return seeded;
            }
            warn!(
                target: "cleanup.run",
                "no seed skus found in catalog, falling back to sampling"
            );
        }

        let size = self.settings.test_sample_size.min(records.len());
        if size == records.len() {
            return records;
        }
        let mut rng = StdRng::seed_from_u64(TEST_SAMPLE_SEED);
        let mut picked = index::sample(&mut rng, records.len(), size).into_vec();
        picked.sort_unstable();
        info!(target: "cleanup.run", sampled = size, "test mode sampled catalog");
        picked.into_iter().map(|i| records[i].clone()).collect()
    }

    async fn evaluate_in_batches(&self, records: &[RawCatalogRecord]) -> Vec<EligibilityDecision> {
        let batch_size = self.settings.batch_size.max(1);
        let total_batches = records.len().div_ceil(batch_size);
        let mut decisions = Vec::with_capacity(records.len());
        for (index, batch) in records.chunks(batch_size).enumerate() {
            info!(
                target: "cleanup.run",
                batch = index + 1,
                total_batches = total_batches,
                size = batch.len(),
                "processing batch"
            );
            decisions.extend(self.processor.process_batch(batch).await);
            if index + 1 < total_batches && !self.settings.batch_pause.is_zero() {
                tokio::time::sleep(self.settings.batch_pause).await;
            }
        }
        decisions
    }

    fn select_candidates(&self, decisions: &[EligibilityDecision], now: DateTime<Utc>) -> Candidates {
        let mut candidates = Candidates::default();
        for decision in deletable(decisions) {
            let sku = decision.sku();
            if self.ledger.is_in_cooldown(sku, now) {
                candidates.in_cooldown += 1;
                continue;
            }
            if self.ledger.is_expired_entry(sku, now) {
                info!(
                    target: "cleanup.run",
                    sku = sku,
                    "previously processed sku still listed and eligible again"
                );
                candidates.previously_processed += 1;
            } else {
                candidates.new_eligible += 1;
            }
            candidates.skus.push(sku.to_string());
        }
        info!(
            target: "cleanup.run",
            new = candidates.new_eligible,
            previously_processed = candidates.previously_processed,
            in_cooldown = candidates.in_cooldown,
            "deletion candidates selected"
        );
        candidates
    }

    async fn execute_deletions(&self, skus: &[String]) -> DeletionOutcome {
        let mut outcome = DeletionOutcome::default();
        for sku in skus {
            if self.settings.skip_list.contains(sku) {
                info!(target: "cleanup.run", sku = %sku, "skipping sku in skip list");
                outcome.skipped.push(SkippedSku {
                    sku: sku.clone(),
                    reason: "in_skip_list".to_string(),
                });
                continue;
            }
            if self.settings.dry_run {
                info!(target: "cleanup.run", sku = %sku, "dry run: would delete");
                outcome.deleted.push(sku.clone());
                continue;
            }
            match self.deleter.delete_sku(sku).await {
                Ok(DeletionStatus::Accepted) | Ok(DeletionStatus::NotFound) => {
                    outcome.deleted.push(sku.clone())
                }
                Ok(DeletionStatus::Rejected { issues }) => outcome.errors.push(SkuError {
                    sku: sku.clone(),
                    error: format!("deletion rejected: {}", issues.join("; ")),
                }),
                Err(err) => {
                    error!(target: "cleanup.run", sku = %sku, error = %err, "deletion failed");
                    outcome.errors.push(SkuError {
                        sku: sku.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        outcome
    }

    /// SKUs from `deleted` that no longer appear in a fresh catalog.
    async fn verify_deletions(&self, deleted: &[String]) -> Result<Vec<String>, ApiError> {
        info!(target: "cleanup.run", count = deleted.len(), "verifying deletions");
        let fresh = match self.catalog.fetch_catalog().await {
            Ok(records) => sku_set(&records),
            Err(err) => {
                error!(
                    target: "cleanup.run",
                    error = %err,
                    "could not verify deletions; nothing recorded in ledger"
                );
                return Err(err);
            }
        };
        let (verified, lingering): (Vec<String>, Vec<String>) = deleted
            .iter()
            .cloned()
            .partition(|sku| !fresh.contains(sku));
        for sku in &lingering {
            warn!(
                target: "cleanup.run",
                sku = %sku,
                "deletion not verified: sku still listed"
            );
        }
        Ok(verified)
    }
}

fn sku_set(records: &[RawCatalogRecord]) -> HashSet<String> {
    records
        .iter()
        .filter_map(|r| r.sku.as_deref().map(str::trim))
        .filter(|sku| !sku.is_empty())
        .map(str::to_string)
        .collect()
}
