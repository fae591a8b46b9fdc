use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge, TextEncoder};

pub static ALERTS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scanner_execution_alerts_received_total",
        "Total scanner alerts received at the webhook"
    )
    .expect("alerts_received counter")
});

pub static ALERTS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scanner_execution_alerts_rejected_total",
        "Total alerts rejected before any order attempt"
    )
    .expect("alerts_rejected counter")
});

pub static ORDERS_PLACED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scanner_execution_orders_placed_total",
        "Total entry orders successfully placed"
    )
    .expect("orders_placed counter")
});

pub static ORDER_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scanner_execution_order_errors_total",
        "Total per-symbol order failures"
    )
    .expect("order_errors counter")
});

pub static SYMBOLS_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scanner_execution_symbols_skipped_total",
        "Total symbols skipped (unparsable price or insufficient funds)"
    )
    .expect("symbols_skipped counter")
});

pub static RATE_LIMIT_WAITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scanner_execution_rate_limit_waits_total",
        "Total outbound calls delayed by the token bucket"
    )
    .expect("rate_limit_waits counter")
});

pub static MODE_TRANSITIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scanner_execution_mode_transitions_total",
        "Total full/minimal lifecycle transitions"
    )
    .expect("mode_transitions counter")
});

/// 1 = full (trading-capable), 0 = minimal.
pub static ACTIVE_MODE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "scanner_execution_active_mode",
        "Current lifecycle mode (1=full, 0=minimal)"
    )
    .expect("active_mode gauge")
});

pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();
    encoder.encode_to_string(&metrics).unwrap_or_default()
}
