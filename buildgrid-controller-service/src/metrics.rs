use lazy_static::lazy_static;
use prometheus::{IntCounter, Registry};

lazy_static! {
    static ref BUILDS_SUBMITTED_TOTAL: IntCounter =
        IntCounter::new("builds_submitted_total", "Number of accepted build submissions").unwrap();
    static ref BUILDS_ASSIGNED_TOTAL: IntCounter =
        IntCounter::new("builds_assigned_total", "Number of build assignments").unwrap();
    static ref BUILDS_COMPLETED_TOTAL: IntCounter =
        IntCounter::new("builds_completed_total", "Number of successful builds").unwrap();
    static ref BUILDS_FAILED_TOTAL: IntCounter =
        IntCounter::new("builds_failed_total", "Number of failed builds").unwrap();
}

pub fn record_build_submitted() {
    BUILDS_SUBMITTED_TOTAL.inc();
}

pub fn record_build_assigned() {
    BUILDS_ASSIGNED_TOTAL.inc();
}

pub fn record_build_completed() {
    BUILDS_COMPLETED_TOTAL.inc();
}

pub fn record_build_failed() {
    BUILDS_FAILED_TOTAL.inc();
}

pub fn register_all() -> Registry {
    let registry = Registry::new();
    buildgrid_common::metrics::api::register_api_metrics(&registry);
    registry
        .register(Box::new(BUILDS_SUBMITTED_TOTAL.clone()))
        .expect("builds submitted metric registration");
    registry
        .register(Box::new(BUILDS_ASSIGNED_TOTAL.clone()))
        .expect("builds assigned metric registration");
    registry
        .register(Box::new(BUILDS_COMPLETED_TOTAL.clone()))
        .expect("builds completed metric registration");
    registry
        .register(Box::new(BUILDS_FAILED_TOTAL.clone()))
        .expect("builds failed metric registration");
    registry
}
