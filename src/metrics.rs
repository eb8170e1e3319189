use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

pub static CYCLE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "wheel_cycle_duration_seconds",
        "Wall-clock duration of a full cycle, by kind",
        &["cycle"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("cycle_duration histogram")
});

pub static STAGE_BLOCKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "wheel_stage_blocks_total",
        "Candidates blocked, by pipeline stage",
        &["stage"]
    )
    .expect("stage_blocks counter")
});

pub static ORDERS_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wheel_orders_submitted_total",
        "Sell-to-open orders accepted by the broker"
    )
    .expect("orders_submitted counter")
});

pub static ORDERS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wheel_orders_failed_total",
        "Order submissions the broker rejected or that errored"
    )
    .expect("orders_failed counter")
});

pub static ORDERS_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wheel_orders_skipped_total",
        "Opportunities skipped for insufficient buying power"
    )
    .expect("orders_skipped counter")
});

pub static POSITIONS_CLOSED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wheel_positions_closed_total",
        "Short options bought back by the monitor pass"
    )
    .expect("positions_closed counter")
});

pub fn observe_cycle_duration(cycle: &str, seconds: f64) {
    CYCLE_DURATION.with_label_values(&[cycle]).observe(seconds);
}

pub fn inc_stage_block(stage: u8) {
    STAGE_BLOCKS
        .with_label_values(&[&stage.to_string()])
        .inc();
}

pub fn inc_orders_submitted() {
    ORDERS_SUBMITTED.inc();
}

pub fn inc_orders_failed() {
    ORDERS_FAILED.inc();
}

pub fn inc_orders_skipped() {
    ORDERS_SKIPPED.inc();
}

pub fn inc_positions_closed(count: u64) {
    POSITIONS_CLOSED.inc_by(count);
}
