use crate::models::ErrorKind;
use crate::resilience::CircuitState;
use tracing::trace;

// Counters are emitted as trace events; a subscriber can aggregate them.

pub fn retry_scheduled(operation: &str, attempt: u32) {
    trace!(
        target: "cleanup.metrics",
        operation = operation,
        attempt = attempt,
        "retries_total_inc"
    );
}

pub fn breaker_transition(breaker: &str, from: CircuitState, to: CircuitState) {
    trace!(
        target: "cleanup.metrics",
        breaker = breaker,
        from = %from,
        to = %to,
        "breaker_transitions_total_inc"
    );
}

pub fn inventory_check(outcome: &'static str) {
    trace!(
        target: "cleanup.metrics",
        outcome = outcome,
        "inventory_checks_total_inc"
    );
}

pub fn inventory_error(kind: ErrorKind) {
    trace!(
        target: "cleanup.metrics",
        kind = %kind,
        "inventory_check_errors_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target: "cleanup.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
