//! SNAP client metrics

use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge,
};

lazy_static::lazy_static! {
    /// Signed bank requests by endpoint and outcome
    pub static ref OUTBOUND_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "snap_outbound_requests_total",
        "Total signed requests sent to the bank",
        &["endpoint", "outcome"]
    )
    .unwrap();

    /// Bank round-trip latency
    pub static ref OUTBOUND_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "snap_outbound_request_duration_seconds",
        "Bank request duration",
        &["endpoint"]
    )
    .unwrap();

    /// Token issuance round-trips
    pub static ref TOKEN_RENEWALS_TOTAL: CounterVec = register_counter_vec!(
        "snap_token_renewals_total",
        "Access token renewal round-trips",
        &["outcome"]
    )
    .unwrap();

    /// Inbound verification decisions
    pub static ref INBOUND_VERIFICATIONS_TOTAL: CounterVec = register_counter_vec!(
        "snap_inbound_verifications_total",
        "Inbound request verifications",
        &["outcome"]
    )
    .unwrap();

    /// Expiry commit outcomes
    pub static ref WATCHER_EXPIRIES_TOTAL: CounterVec = register_counter_vec!(
        "snap_watcher_expiries_total",
        "Expiry commits by outcome (expired, stale, dead_letter)",
        &["outcome"]
    )
    .unwrap();

    /// Registered expiry countdowns
    pub static ref WATCHED_TRANSACTIONS: IntGauge = register_int_gauge!(
        "snap_watched_transactions",
        "Reservations currently counting down"
    )
    .unwrap();

    /// Expiries retrying past their budget; alert when non-zero
    pub static ref WATCHER_DEAD_LETTERS: IntGauge = register_int_gauge!(
        "snap_watcher_dead_letters",
        "Expiry commits still failing after the retry budget"
    )
    .unwrap();
}

/// Text exposition of the default registry
pub fn gather_text() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
