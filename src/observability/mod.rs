//! Observability for the extent lock manager.
//!
//! Logging goes through `tracing`; metrics through the `metrics` facade.
//! No recorder or exporter is installed here, that is up to the embedding
//! server.

use crate::config::ObservabilityConfig;
use crate::error::{DelmError, Result};
use crate::mode::LockMode;
use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| DelmError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| DelmError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Register the lock manager metrics with zero values.
pub fn register_metrics(namespace: &str) {
    let ns = namespace.to_string();
    counter!("delm_enqueue_total", "namespace" => ns.clone()).absolute(0);
    counter!("delm_granted_total", "namespace" => ns.clone()).absolute(0);
    counter!("delm_queued_total", "namespace" => ns.clone()).absolute(0);
    counter!("delm_cancel_total", "namespace" => ns.clone()).absolute(0);
    counter!("delm_blocking_ast_total", "namespace" => ns.clone()).absolute(0);
    counter!("delm_evictions_total", "namespace" => ns.clone()).absolute(0);
    gauge!("delm_locks", "namespace" => ns.clone()).set(0.0);
    gauge!("delm_resources", "namespace" => ns).set(0.0);
}

/// Record an enqueue and how it ended.
pub fn record_enqueue(namespace: &str, mode: LockMode, outcome: &'static str, duration: Duration) {
    counter!(
        "delm_enqueue_total",
        "namespace" => namespace.to_string(),
        "mode" => mode.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "delm_enqueue_duration_seconds",
        "namespace" => namespace.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record locks granted, queued and cancelled by one state change.
pub fn record_transitions(namespace: &str, granted: usize, queued: usize, cancelled: usize) {
    if granted > 0 {
        counter!("delm_granted_total", "namespace" => namespace.to_string())
            .increment(granted as u64);
    }
    if queued > 0 {
        counter!("delm_queued_total", "namespace" => namespace.to_string())
            .increment(queued as u64);
    }
    if cancelled > 0 {
        counter!("delm_cancel_total", "namespace" => namespace.to_string())
            .increment(cancelled as u64);
    }
}

/// Record a blocking AST round trip.
pub fn record_blocking_ast(namespace: &str, duration: Duration, ok: bool) {
    counter!(
        "delm_blocking_ast_total",
        "namespace" => namespace.to_string(),
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
    histogram!(
        "delm_blocking_ast_duration_seconds",
        "namespace" => namespace.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an export eviction.
pub fn record_eviction(namespace: &str, locks: usize) {
    counter!("delm_evictions_total", "namespace" => namespace.to_string()).increment(1);
    counter!("delm_evicted_locks_total", "namespace" => namespace.to_string())
        .increment(locks as u64);
}

/// Update lock table gauges.
pub fn update_lock_gauges(namespace: &str, locks: usize, resources: usize) {
    gauge!("delm_locks", "namespace" => namespace.to_string()).set(locks as f64);
    gauge!("delm_resources", "namespace" => namespace.to_string()).set(resources as f64);
}
