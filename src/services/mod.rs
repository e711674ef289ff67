// Shared stock primitives
pub mod document_number;
pub mod stock_movement;

// Movement documents
pub mod delivery_orders;
pub mod internal_transfers;
pub mod receipts;
pub mod stock_adjustments;

// Catalog and read side
pub mod audit_ledger;
pub mod catalog;
pub mod stock_levels;

use validator::Validate;

use crate::errors::ServiceError;

/// Validates every line of a document input.
pub(crate) fn validate_lines<T: Validate>(lines: &[T]) -> Result<(), ServiceError> {
    for (index, line) in lines.iter().enumerate() {
        line.validate().map_err(|e| {
            ServiceError::ValidationError(format!("Item {}: {}", index + 1, e))
        })?;
    }
    Ok(())
}

/// Counts stock shortfalls per operation before passing the error on.
pub(crate) fn track_shortfall(operation: &'static str) -> impl Fn(ServiceError) -> ServiceError {
    move |err| {
        if matches!(err, ServiceError::InsufficientStock(_)) {
            crate::metrics::record_insufficient(operation);
        }
        err
    }
}
