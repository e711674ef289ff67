//! Inbound receipts: DRAFT -> WAITING -> READY -> DONE, or CANCELED before DONE.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::catalog::{require_active_warehouse, require_products};
use super::document_number::{self, DocumentPrefix};
use super::stock_movement::{self, LedgerEntry};
use super::validate_lines;
use crate::entities::audit_ledger::TransactionType;
use crate::entities::receipt::{self, Entity as Receipt, ReceiptStatus};
use crate::entities::receipt_item::{self, Entity as ReceiptItem};
use crate::errors::ServiceError;
use crate::events::{DocumentKind, Event, EventSender};
use crate::metrics;

const DOCUMENT: &str = "receipt";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReceiptItemInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateReceiptInput {
    pub warehouse_id: Uuid,
    pub supplier: Option<String>,
    pub expected_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Receipt must have at least one item"))]
    pub items: Vec<ReceiptItemInput>,
}

/// Header fields left as `None` are kept; `items`, when given, replaces the whole set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateReceiptInput {
    pub supplier: Option<String>,
    pub expected_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Receipt must have at least one item"))]
    pub items: Option<Vec<ReceiptItemInput>>,
}

/// Caller override of the quantity actually received for one line.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReceivedItem {
    pub item_id: Uuid,
    #[validate(range(min = 0, message = "Received quantity cannot be negative"))]
    pub received_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptWithItems {
    #[serde(flatten)]
    pub receipt: receipt::Model,
    pub items: Vec<receipt_item::Model>,
}

#[derive(Clone)]
pub struct ReceiptService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl ReceiptService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self, input), fields(warehouse_id = %input.warehouse_id))]
    pub async fn create(
        &self,
        input: CreateReceiptInput,
        user_id: Uuid,
    ) -> Result<ReceiptWithItems, ServiceError> {
        input.validate()?;
        validate_lines(&input.items)?;

        let txn = self.db_pool.begin().await?;
        require_active_warehouse(&txn, input.warehouse_id).await?;

        let now = Utc::now();
        let receipt = receipt::ActiveModel {
            id: Set(Uuid::new_v4()),
            receipt_number: Set(document_number::generate(DocumentPrefix::Receipt)),
            warehouse_id: Set(input.warehouse_id),
            supplier: Set(input.supplier),
            expected_date: Set(input.expected_date),
            status: Set(ReceiptStatus::Draft),
            created_by: Set(user_id),
            validated_by: Set(None),
            validated_at: Set(None),
            received_date: Set(None),
            notes: Set(input.notes),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let items = insert_items(&txn, receipt.id, &input.items).await?;
        txn.commit().await?;

        info!(
            receipt_id = %receipt.id,
            document_number = %receipt.receipt_number,
            items = items.len(),
            "Receipt created"
        );
        Ok(ReceiptWithItems { receipt, items })
    }

    #[instrument(skip(self, input))]
    pub async fn update(
        &self,
        id: Uuid,
        input: UpdateReceiptInput,
    ) -> Result<ReceiptWithItems, ServiceError> {
        input.validate()?;
        if let Some(items) = &input.items {
            validate_lines(items)?;
        }

        let txn = self.db_pool.begin().await?;
        let receipt = lock_receipt(&txn, id).await?;
        if receipt.status != ReceiptStatus::Draft {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &receipt.receipt_number,
                "update",
                receipt.status,
            ));
        }

        let mut active: receipt::ActiveModel = receipt.into();
        if let Some(supplier) = input.supplier {
            active.supplier = Set(Some(supplier));
        }
        if let Some(expected_date) = input.expected_date {
            active.expected_date = Set(Some(expected_date));
        }
        if let Some(notes) = input.notes {
            active.notes = Set(Some(notes));
        }
        active.updated_at = Set(Utc::now());
        let receipt = active.update(&txn).await?;

        let items = match input.items {
            Some(new_items) => {
                ReceiptItem::delete_many()
                    .filter(receipt_item::Column::ReceiptId.eq(id))
                    .exec(&txn)
                    .await?;
                insert_items(&txn, id, &new_items).await?
            }
            None => load_items(&txn, id).await?,
        };
        txn.commit().await?;

        info!(document_number = %receipt.receipt_number, "Receipt updated");
        Ok(ReceiptWithItems { receipt, items })
    }

    /// Moves DRAFT -> WAITING -> READY. No stock effect.
    #[instrument(skip(self))]
    pub async fn advance(&self, id: Uuid) -> Result<receipt::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let receipt = lock_receipt(&txn, id).await?;
        let next = receipt.status.next().ok_or_else(|| {
            ServiceError::invalid_transition(
                DOCUMENT,
                &receipt.receipt_number,
                "advance",
                receipt.status,
            )
        })?;

        let mut active: receipt::ActiveModel = receipt.into();
        active.status = Set(next);
        active.updated_at = Set(Utc::now());
        let receipt = active.update(&txn).await?;
        txn.commit().await?;

        info!(document_number = %receipt.receipt_number, status = %receipt.status, "Receipt advanced");
        Ok(receipt)
    }

    /// Books received stock into the warehouse and closes the receipt.
    ///
    /// `received_items` overrides the received quantity per line; lines not
    /// named keep their stored received quantity.
    #[instrument(skip(self, received_items))]
    pub async fn validate(
        &self,
        id: Uuid,
        received_items: Option<Vec<ReceivedItem>>,
        user_id: Uuid,
    ) -> Result<ReceiptWithItems, ServiceError> {
        let overrides: HashMap<Uuid, i32> = match &received_items {
            Some(lines) => {
                validate_lines(lines)?;
                lines
                    .iter()
                    .map(|l| (l.item_id, l.received_quantity))
                    .collect()
            }
            None => HashMap::new(),
        };

        let txn = self.db_pool.begin().await?;
        let receipt = lock_receipt(&txn, id).await?;
        if receipt.status.is_terminal() {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &receipt.receipt_number,
                "validate",
                receipt.status,
            ));
        }

        let items = load_items(&txn, id).await?;
        if items.is_empty() {
            return Err(ServiceError::BadRequest(format!(
                "Receipt {} has no items",
                receipt.receipt_number
            )));
        }
        if let Some(unknown) = overrides
            .keys()
            .find(|item_id| !items.iter().any(|i| i.id == **item_id))
        {
            return Err(ServiceError::NotFound(format!(
                "Receipt item {} not found",
                unknown
            )));
        }

        let mut booked = Vec::with_capacity(items.len());
        for item in items {
            let received = overrides
                .get(&item.id)
                .copied()
                .unwrap_or(item.received_quantity);

            let change = stock_movement::apply_delta(
                &txn,
                item.product_id,
                receipt.warehouse_id,
                received,
                true,
            )
            .await?;

            stock_movement::record_ledger(
                &txn,
                LedgerEntry {
                    transaction_type: TransactionType::Receipt,
                    document_id: receipt.id,
                    document_number: &receipt.receipt_number,
                    product_id: item.product_id,
                    warehouse_id: receipt.warehouse_id,
                    change,
                    user_id,
                    metadata: Some(json!({
                        "item_id": item.id,
                        "ordered_quantity": item.quantity,
                        "received_quantity": received,
                        "supplier": receipt.supplier,
                    })),
                },
            )
            .await?;

            let mut active: receipt_item::ActiveModel = item.into();
            active.received_quantity = Set(received);
            booked.push(active.update(&txn).await?);
        }

        let now = Utc::now();
        let mut active: receipt::ActiveModel = receipt.into();
        active.status = Set(ReceiptStatus::Done);
        active.validated_by = Set(Some(user_id));
        active.validated_at = Set(Some(now));
        active.received_date = Set(Some(now));
        active.updated_at = Set(now);
        let receipt = active.update(&txn).await?;

        txn.commit().await?;
        metrics::record_validated(DOCUMENT);

        info!(
            document_number = %receipt.receipt_number,
            warehouse_id = %receipt.warehouse_id,
            items = booked.len(),
            "Receipt validated"
        );

        self.event_sender
            .send_or_log(Event::ReceiptValidated {
                receipt_id: receipt.id,
                receipt_number: receipt.receipt_number.clone(),
                warehouse_id: receipt.warehouse_id,
                product_ids: booked.iter().map(|i| i.product_id).collect(),
                validated_at: now,
            });

        Ok(ReceiptWithItems {
            receipt,
            items: booked,
        })
    }

    /// Cancels a receipt that has not been validated. Receipts hold no reservations.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<receipt::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let receipt = lock_receipt(&txn, id).await?;
        if receipt.status.is_terminal() {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &receipt.receipt_number,
                "cancel",
                receipt.status,
            ));
        }

        let mut active: receipt::ActiveModel = receipt.into();
        active.status = Set(ReceiptStatus::Canceled);
        active.updated_at = Set(Utc::now());
        let receipt = active.update(&txn).await?;
        txn.commit().await?;
        metrics::record_cancelled(DOCUMENT);

        info!(document_number = %receipt.receipt_number, "Receipt cancelled");
        self.event_sender
            .send_or_log(Event::DocumentCancelled {
                kind: DocumentKind::Receipt,
                document_id: receipt.id,
                document_number: receipt.receipt_number.clone(),
            });

        Ok(receipt)
    }

    pub async fn get(&self, id: Uuid) -> Result<ReceiptWithItems, ServiceError> {
        let db = &*self.db_pool;
        let receipt = Receipt::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Receipt {} not found", id)))?;
        let items = load_items(db, id).await?;
        Ok(ReceiptWithItems { receipt, items })
    }

    pub async fn list(
        &self,
        status: Option<ReceiptStatus>,
    ) -> Result<Vec<receipt::Model>, ServiceError> {
        let mut query = Receipt::find();
        if let Some(status) = status {
            query = query.filter(receipt::Column::Status.eq(status));
        }
        Ok(query
            .order_by_desc(receipt::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }
}

async fn lock_receipt(txn: &DatabaseTransaction, id: Uuid) -> Result<receipt::Model, ServiceError> {
    Receipt::find_by_id(id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Receipt {} not found", id)))
}

async fn load_items<C>(conn: &C, receipt_id: Uuid) -> Result<Vec<receipt_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(ReceiptItem::find()
        .filter(receipt_item::Column::ReceiptId.eq(receipt_id))
        .order_by_asc(receipt_item::Column::Position)
        .all(conn)
        .await?)
}

/// Received quantity starts out equal to the ordered quantity.
async fn insert_items(
    txn: &DatabaseTransaction,
    receipt_id: Uuid,
    lines: &[ReceiptItemInput],
) -> Result<Vec<receipt_item::Model>, ServiceError> {
    let product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
    require_products(txn, &product_ids).await?;

    let now = Utc::now();
    let mut items = Vec::with_capacity(lines.len());
    for (position, line) in lines.iter().enumerate() {
        let item = receipt_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            receipt_id: Set(receipt_id),
            product_id: Set(line.product_id),
            position: Set(position as i32),
            quantity: Set(line.quantity),
            received_quantity: Set(line.quantity),
            created_at: Set(now),
        }
        .insert(txn)
        .await?;
        items.push(item);
    }
    Ok(items)
}
