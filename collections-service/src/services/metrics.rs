//! Metrics module for collections-service.
//! Provides Prometheus metrics for collection runs, gateway traffic and dunning.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "collections_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Payment instance transitions by from/to status
pub static PAYMENT_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment instances created by the scheduler
pub static INSTANCES_SCHEDULED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Pre-notifications by outcome
pub static NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Outbound gateway calls by operation and outcome
pub static GATEWAY_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Inbound webhook events by type and outcome
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Dunning alerts by subject type and stage
pub static ESCALATION_ALERTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Failures that need a human
pub static OPERATOR_ALERTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    PAYMENT_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_payment_transitions_total",
                "Payment instance state transitions"
            ),
            &["from", "to"]
        )
        .expect("Failed to register PAYMENT_TRANSITIONS_TOTAL")
    });

    INSTANCES_SCHEDULED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_instances_scheduled_total",
                "Payment instances created by the scheduler"
            ),
            &["scheme"]
        )
        .expect("Failed to register INSTANCES_SCHEDULED_TOTAL")
    });

    NOTIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_notifications_total",
                "Notifications sent by template and outcome"
            ),
            &["template", "outcome"]
        )
        .expect("Failed to register NOTIFICATIONS_TOTAL")
    });

    GATEWAY_CALLS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("collections_gateway_calls_total", "Gateway calls"),
            &["operation", "outcome"]
        )
        .expect("Failed to register GATEWAY_CALLS_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("collections_webhook_events_total", "Gateway webhook events"),
            &["event_type", "outcome"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    ESCALATION_ALERTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_escalation_alerts_total",
                "Dunning alerts raised"
            ),
            &["subject_type", "stage"]
        )
        .expect("Failed to register ESCALATION_ALERTS_TOTAL")
    });

    OPERATOR_ALERTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_operator_alerts_total",
                "Failures requiring manual review"
            ),
            &["reason"]
        )
        .expect("Failed to register OPERATOR_ALERTS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_payment_transition(from: &str, to: &str) {
    if let Some(counter) = PAYMENT_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[from, to]).inc();
    }
}

pub fn record_instance_scheduled(scheme: &str) {
    if let Some(counter) = INSTANCES_SCHEDULED_TOTAL.get() {
        counter.with_label_values(&[scheme]).inc();
    }
}

pub fn record_notification(template: &str, outcome: &str) {
    if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[template, outcome]).inc();
    }
}

pub fn record_gateway_call(operation: &str, outcome: &str) {
    if let Some(counter) = GATEWAY_CALLS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

pub fn record_webhook_event(event_type: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type, outcome]).inc();
    }
}

pub fn record_escalation_alert(subject_type: &str, stage: &str) {
    if let Some(counter) = ESCALATION_ALERTS_TOTAL.get() {
        counter.with_label_values(&[subject_type, stage]).inc();
    }
}

/// Record a failure that needs manual review.
pub fn record_operator_alert(reason: &str) {
    if let Some(counter) = OPERATOR_ALERTS_TOTAL.get() {
        counter.with_label_values(&[reason]).inc();
    }
}
