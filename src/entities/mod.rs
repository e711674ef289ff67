// Catalog
pub mod product;
pub mod warehouse;

// Shared stock state
pub mod audit_ledger;
pub mod stock_level;

// Movement documents
pub mod delivery_order;
pub mod delivery_order_item;
pub mod document_status;
pub mod internal_transfer;
pub mod internal_transfer_item;
pub mod receipt;
pub mod receipt_item;
pub mod stock_adjustment;
pub mod stock_adjustment_item;

pub use audit_ledger::{Entity as AuditLedger, TransactionType};
pub use delivery_order::Entity as DeliveryOrder;
pub use delivery_order_item::Entity as DeliveryOrderItem;
pub use document_status::{DeliveryStatus, DocumentStatus};
pub use internal_transfer::Entity as InternalTransfer;
pub use internal_transfer_item::Entity as InternalTransferItem;
pub use product::Entity as Product;
pub use receipt::Entity as Receipt;
pub use receipt_item::Entity as ReceiptItem;
pub use stock_adjustment::Entity as StockAdjustment;
pub use stock_adjustment_item::Entity as StockAdjustmentItem;
pub use stock_level::Entity as StockLevel;
pub use warehouse::Entity as Warehouse;
