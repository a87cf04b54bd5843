//! Prometheus metrics for the bridge relay
//!
//! Exposed on the /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Scanner
    pub static ref BLOCKS_SCANNED: CounterVec = register_counter_vec!(
        "vbank_bridge_blocks_scanned_total",
        "Total number of external-chain blocks scanned",
        &["chain"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "vbank_bridge_latest_block",
        "Latest external-chain block scanned",
        &["chain"]
    ).unwrap();

    pub static ref FORKS_DETECTED: CounterVec = register_counter_vec!(
        "vbank_bridge_forks_detected_total",
        "Total number of header mismatches at the local tip",
        &["chain"]
    ).unwrap();

    // Classifier
    pub static ref EVENTS_CLASSIFIED: CounterVec = register_counter_vec!(
        "vbank_bridge_events_classified_total",
        "Bridge events recognised by the classifier",
        &["chain", "kind"]
    ).unwrap();

    pub static ref EVENTS_REJECTED: CounterVec = register_counter_vec!(
        "vbank_bridge_events_rejected_total",
        "Transactions touching the custodian address that were rejected",
        &["chain"]
    ).unwrap();

    // Confirmation
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "vbank_bridge_unconfirmed_queue_depth",
        "Records waiting in the unconfirmed queue",
        &["chain"]
    ).unwrap();

    pub static ref CALLBACKS: CounterVec = register_counter_vec!(
        "vbank_bridge_callbacks_total",
        "Home-ledger callbacks by kind and result",
        &["chain", "kind", "result"]
    ).unwrap();

    pub static ref PURGED: CounterVec = register_counter_vec!(
        "vbank_bridge_records_purged_total",
        "Records removed from the store by reason",
        &["chain", "reason"]
    ).unwrap();

    // Signing
    pub static ref OUTBOUND_BROADCASTS: CounterVec = register_counter_vec!(
        "vbank_bridge_outbound_broadcasts_total",
        "Quorum-signed outbound transactions broadcast",
        &["chain", "kind", "status"]
    ).unwrap();

    pub static ref RESENDS: CounterVec = register_counter_vec!(
        "vbank_bridge_resends_total",
        "Outbound resend attempts",
        &["chain", "status"]
    ).unwrap();

    pub static ref OPEN_SESSIONS: GaugeVec = register_gauge_vec!(
        "vbank_bridge_open_signing_sessions",
        "Signing sessions not yet broadcast",
        &["chain"]
    ).unwrap();

    // Errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "vbank_bridge_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "vbank_bridge_up",
        "Whether the relay is up and running"
    ).unwrap();
}

pub fn record_block_scanned(chain: &str, height: u64) {
    BLOCKS_SCANNED.with_label_values(&[chain]).inc();
    LATEST_BLOCK.with_label_values(&[chain]).set(height as f64);
}

pub fn record_fork(chain: &str) {
    FORKS_DETECTED.with_label_values(&[chain]).inc();
}

pub fn record_classified(chain: &str, kind: &str) {
    EVENTS_CLASSIFIED.with_label_values(&[chain, kind]).inc();
}

pub fn record_rejected(chain: &str) {
    EVENTS_REJECTED.with_label_values(&[chain]).inc();
}

pub fn set_queue_depth(chain: &str, depth: usize) {
    QUEUE_DEPTH.with_label_values(&[chain]).set(depth as f64);
}

/// `result` is one of `ok`, `duplicate`, `error`
pub fn record_callback(chain: &str, kind: &str, result: &str) {
    CALLBACKS.with_label_values(&[chain, kind, result]).inc();
}

pub fn record_purge(chain: &str, reason: &str) {
    PURGED.with_label_values(&[chain, reason]).inc();
}

pub fn record_broadcast(chain: &str, kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    OUTBOUND_BROADCASTS
        .with_label_values(&[chain, kind, status])
        .inc();
}

pub fn record_resend(chain: &str, status: &str) {
    RESENDS.with_label_values(&[chain, status]).inc();
}

pub fn set_open_sessions(chain: &str, count: usize) {
    OPEN_SESSIONS.with_label_values(&[chain]).set(count as f64);
}

pub fn record_error(chain: &str, error_type: &str) {
    ERRORS.with_label_values(&[chain, error_type]).inc();
}
