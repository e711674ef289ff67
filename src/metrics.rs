//! Prometheus counters for stock movements.
//!
//! Counters are process-wide statics; call [`register`] once to expose them
//! through a `prometheus::Registry`.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref DOCUMENTS_VALIDATED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_documents_validated_total",
            "Movement documents validated, by document kind"
        ),
        &["document"]
    )
    .expect("metric can be created");
    pub static ref DOCUMENTS_CANCELLED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_documents_cancelled_total",
            "Movement documents cancelled, by document kind"
        ),
        &["document"]
    )
    .expect("metric can be created");
    pub static ref INSUFFICIENT_STOCK: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_insufficient_total",
            "Operations rejected for insufficient stock, by operation"
        ),
        &["operation"]
    )
    .expect("metric can be created");
    pub static ref LEDGER_ENTRIES: IntCounter = IntCounter::new(
        "stock_ledger_entries_total",
        "Audit ledger rows written"
    )
    .expect("metric can be created");
    pub static ref CONCURRENT_MODIFICATIONS: IntCounter = IntCounter::new(
        "stock_concurrent_modifications_total",
        "Stock level writes rejected by the version guard"
    )
    .expect("metric can be created");
}

/// Registers every stock counter with `registry`.
pub fn register(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(DOCUMENTS_VALIDATED.clone()))?;
    registry.register(Box::new(DOCUMENTS_CANCELLED.clone()))?;
    registry.register(Box::new(INSUFFICIENT_STOCK.clone()))?;
    registry.register(Box::new(LEDGER_ENTRIES.clone()))?;
    registry.register(Box::new(CONCURRENT_MODIFICATIONS.clone()))?;
    Ok(())
}

/// Renders `registry` in the Prometheus text exposition format.
pub fn render(registry: &Registry) -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub(crate) fn record_validated(document: &str) {
    DOCUMENTS_VALIDATED.with_label_values(&[document]).inc();
}

pub(crate) fn record_cancelled(document: &str) {
    DOCUMENTS_CANCELLED.with_label_values(&[document]).inc();
}

pub(crate) fn record_insufficient(operation: &str) {
    INSUFFICIENT_STOCK.with_label_values(&[operation]).inc();
}
