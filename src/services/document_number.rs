use chrono::{NaiveDate, Utc};
use rand::Rng;

/// Number prefix per movement document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentPrefix {
    Receipt,
    DeliveryOrder,
    InternalTransfer,
    StockAdjustment,
}

impl DocumentPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentPrefix::Receipt => "REC",
            DocumentPrefix::DeliveryOrder => "DO",
            DocumentPrefix::InternalTransfer => "IT",
            DocumentPrefix::StockAdjustment => "SA",
        }
    }
}

/// `<PREFIX>-<YYYYMMDD>-<NNN>` with a random zero-padded suffix.
///
/// Uniqueness is left to the unique index on the number column.
pub fn generate_for_date(prefix: DocumentPrefix, date: NaiveDate) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("{}-{}-{:03}", prefix.as_str(), date.format("%Y%m%d"), suffix)
}

pub fn generate(prefix: DocumentPrefix) -> String {
    generate_for_date(prefix, Utc::now().date_naive())
}
