//! Metrics emitted by the datastore.
//!
//! Counters go through the `metrics` facade; the host application decides
//! which recorder (Prometheus, statsd, none) receives them.

use metrics::{counter, describe_counter};
use std::sync::Once;

/// Store operations (counter). Labels: operation, status.
pub const OPERATIONS_TOTAL: &str = "sharestore_operations_total";

/// Backend call attempts, retries included (counter). Labels: operation.
pub const BACKEND_CALLS_TOTAL: &str = "sharestore_backend_calls_total";

/// Retries after a transient failure (counter). Labels: operation.
pub const BACKEND_RETRIES_TOTAL: &str = "sharestore_backend_retries_total";

/// Default metadata written back during a read (counter).
pub const METADATA_HEALS_TOTAL: &str = "sharestore_metadata_heals_total";

/// Sidecar metadata files migrated to inline metadata (counter).
pub const METADATA_MIGRATIONS_TOTAL: &str = "sharestore_metadata_migrations_total";

static DESCRIBED: Once = Once::new();

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(OPERATIONS_TOTAL, "Datastore operations by type and outcome");
    describe_counter!(BACKEND_CALLS_TOTAL, "Backend call attempts by operation");
    describe_counter!(
        BACKEND_RETRIES_TOTAL,
        "Backend calls retried after a transient failure"
    );
    describe_counter!(
        METADATA_HEALS_TOTAL,
        "Objects whose missing metadata was backfilled on read"
    );
    describe_counter!(
        METADATA_MIGRATIONS_TOTAL,
        "Legacy sidecar metadata files migrated inline"
    );
}

/// [`describe_metrics`] for the first store built in this process.
/// The host must install its recorder before building a store.
pub(crate) fn describe_metrics_once() {
    DESCRIBED.call_once(describe_metrics);
}

/// Count a finished store operation.
pub(crate) fn record_operation(operation: &'static str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    counter!(OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
}
