//! Metrics
//!
//! Metric names and registration. The Prometheus recorder is installed by
//! `main`; services record through the `metrics` facade.

pub const ORDERS_SUBMITTED: &str = "orders_submitted_total";
pub const ORDERS_REJECTED: &str = "orders_rejected_total";
pub const MATCHES_TOTAL: &str = "matches_total";
pub const LIQUIDATIONS_TOTAL: &str = "liquidations_total";
pub const ADL_EVENTS_TOTAL: &str = "adl_events_total";
pub const RISK_SLOW_TICKS: &str = "risk_slow_ticks_total";
pub const RISK_TICK_MS: &str = "risk_tick_duration_ms";
pub const PENDING_MATCH_QUEUE: &str = "pending_match_queue_depth";
pub const LEDGER_BATCHES: &str = "ledger_batches_submitted_total";
pub const LEDGER_BATCH_FAILURES: &str = "ledger_batch_failures_total";
pub const MIRROR_BACKLOG: &str = "mirror_backlog_depth";
pub const INSURANCE_BALANCE: &str = "insurance_fund_balance_usd";
pub const STREAM_SUBSCRIBERS: &str = "stream_subscribers";

/// Register descriptions so the exporter renders help text.
pub fn describe() {
    metrics::describe_counter!(ORDERS_SUBMITTED, "Orders accepted by the matching engine");
    metrics::describe_counter!(ORDERS_REJECTED, "Order intents rejected at validation or policy");
    metrics::describe_counter!(MATCHES_TOTAL, "Matches produced");
    metrics::describe_counter!(LIQUIDATIONS_TOTAL, "Positions liquidated");
    metrics::describe_counter!(ADL_EVENTS_TOTAL, "Auto-deleveraging reductions");
    metrics::describe_counter!(RISK_SLOW_TICKS, "Risk ticks that overran the cadence");
    metrics::describe_histogram!(RISK_TICK_MS, "Risk tick duration in milliseconds");
    metrics::describe_gauge!(PENDING_MATCH_QUEUE, "Matches awaiting ledger settlement");
    metrics::describe_counter!(LEDGER_BATCHES, "Ledger batches acknowledged");
    metrics::describe_counter!(LEDGER_BATCH_FAILURES, "Ledger batch attempts that failed");
    metrics::describe_gauge!(MIRROR_BACKLOG, "Deferred mirror writes awaiting retry");
    metrics::describe_gauge!(INSURANCE_BALANCE, "Insurance fund balance per symbol (USD)");
    metrics::describe_gauge!(STREAM_SUBSCRIBERS, "Active stream subscribers");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prometheus_safe() {
        for name in [
            ORDERS_SUBMITTED,
            ORDERS_REJECTED,
            MATCHES_TOTAL,
            LIQUIDATIONS_TOTAL,
            ADL_EVENTS_TOTAL,
            RISK_SLOW_TICKS,
            RISK_TICK_MS,
            PENDING_MATCH_QUEUE,
            LEDGER_BATCHES,
            LEDGER_BATCH_FAILURES,
            MIRROR_BACKLOG,
            INSURANCE_BALANCE,
            STREAM_SUBSCRIBERS,
        ] {
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        }
    }
}
