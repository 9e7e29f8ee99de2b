mod cleanup;
mod config;
mod eligibility;
mod http;
mod ledger;
mod metrics;
mod models;
mod resilience;
mod sp_api;

use cleanup::{CleanupRun, JsonFileSink, LogSink};
use config::Settings;
use eligibility::EligibilityProcessor;
use eyre::WrapErr;
use http::Session;
use ledger::{CooldownLedger, JsonFileStore};
use sp_api::{FbaInventory, ListingsClient, ReportsCatalog, ResilientClient};
use std::{process::ExitCode, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(target: "cleanup.run", "cleanup failed: {err:?}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the run finished without per-SKU errors or failed stages.
async fn run() -> eyre::Result<bool> {
    dotenvy::dotenv().ok();
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            init_tracing("info");
            return Err(err).wrap_err("invalid configuration");
        }
    };
    init_tracing(&settings.cleanup.log_level);
    log_settings(&settings);

    let session = Session::new(&settings.resilience);
    info!(
        target: "cleanup.http",
        max_connections = session.max_connections(),
        "http session ready"
    );
    let client = ResilientClient::new(&settings, session);

    let store = JsonFileStore::open(&settings.cleanup.ledger_path)
        .wrap_err("could not open cooldown ledger")?;
    info!(
        target: "cleanup.ledger",
        path = %store.path().display(),
        "cooldown ledger opened"
    );
    let ledger = CooldownLedger::new(Box::new(store), settings.cleanup.cooldown_window);
    info!(target: "cleanup.ledger", entries = ledger.len(), "cooldown entries loaded");
    let processor = EligibilityProcessor::new(
        Arc::new(FbaInventory::new(client.clone())),
        settings.cleanup.age_threshold_days,
    );

    let mut cleanup = CleanupRun::new(
        Arc::new(ReportsCatalog::new(client.clone())),
        processor,
        Arc::new(ListingsClient::new(client.clone())),
        ledger,
        settings.cleanup.clone(),
    )
    .with_sink(LogSink);
    if let Some(path) = &settings.cleanup.report_path {
        cleanup = cleanup.with_sink(JsonFileSink::new(path));
    }

    let report = cleanup.run().await.wrap_err("cleanup run aborted")?;
    for category in sp_api::EndpointCategory::ALL {
        if let Some(breaker) = client.breaker(category) {
            let snapshot = breaker.snapshot();
            info!(
                target: "cleanup.resilience",
                breaker = breaker.name(),
                state = %breaker.state(),
                calls = snapshot.call_count,
                errors = snapshot.error_count,
                error_rate = snapshot.error_rate(),
                rejected = snapshot.rejected_count,
                "breaker summary"
            );
        }
    }
    Ok(report.is_clean())
}

fn log_settings(settings: &Settings) {
    let cleanup = &settings.cleanup;
    let resilience = &settings.resilience;
    info!(
        target: "cleanup.run",
        seller_id = %settings.credentials.seller_id,
        marketplace_id = %settings.credentials.marketplace_id,
        dry_run = cleanup.dry_run,
        age_threshold_days = cleanup.age_threshold_days,
        batch_size = cleanup.batch_size,
        skip_list = cleanup.skip_list.len(),
        ledger = %cleanup.ledger_path.display(),
        "configuration loaded"
    );
    info!(
        target: "cleanup.resilience",
        max_retries = resilience.max_retries,
        base_delay_ms = resilience.base_delay.as_millis() as u64,
        failure_threshold = resilience.circuit_breaker_failure_threshold,
        recovery_timeout_secs = resilience.circuit_breaker_recovery_timeout.as_secs(),
        exempt = ?resilience.circuit_breaker_exempt,
        "resilience configured"
    );
    if cleanup.test_mode {
        info!(
            target: "cleanup.run",
            sample_size = cleanup.test_sample_size,
            seed_skus = cleanup.test_seed_skus.len(),
            "test mode enabled"
        );
    }
    if !cleanup.dry_run {
        warn!(target: "cleanup.run", "dry run disabled: listings will be deleted");
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = fmt().with_env_filter(filter).try_init();
}
