//! Warehouse-to-warehouse transfers: DRAFT -> WAITING -> READY -> DONE, or CANCELED.
//!
//! Nothing is reserved before validation; validation moves unreserved
//! source stock and writes a TRANSFER_OUT / TRANSFER_IN ledger pair per line.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::catalog::{require_active_warehouse, require_products};
use super::document_number::{self, DocumentPrefix};
use super::stock_movement::{self, LedgerEntry};
use super::{track_shortfall, validate_lines};
use crate::entities::audit_ledger::TransactionType;
use crate::entities::internal_transfer::{self, Entity as InternalTransfer, TransferStatus};
use crate::entities::internal_transfer_item::{self, Entity as InternalTransferItem};
use crate::errors::ServiceError;
use crate::events::{DocumentKind, Event, EventSender};
use crate::metrics;

const DOCUMENT: &str = "internal transfer";
const METRIC_LABEL: &str = "internal_transfer";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransferItemInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateTransferInput {
    pub from_warehouse_id: Uuid,
    pub to_warehouse_id: Uuid,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Transfer must have at least one item"))]
    pub items: Vec<TransferItemInput>,
}

/// Fields left as `None` are kept; `items`, when given, replaces the whole set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateTransferInput {
    pub from_warehouse_id: Option<Uuid>,
    pub to_warehouse_id: Option<Uuid>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Transfer must have at least one item"))]
    pub items: Option<Vec<TransferItemInput>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferWithItems {
    #[serde(flatten)]
    pub transfer: internal_transfer::Model,
    pub items: Vec<internal_transfer_item::Model>,
}

fn ensure_distinct(from: Uuid, to: Uuid) -> Result<(), ServiceError> {
    if from == to {
        return Err(ServiceError::ValidationError(
            "Source and destination warehouses must differ".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct InternalTransferService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl InternalTransferService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self, input), fields(from = %input.from_warehouse_id, to = %input.to_warehouse_id))]
    pub async fn create(
        &self,
        input: CreateTransferInput,
        user_id: Uuid,
    ) -> Result<TransferWithItems, ServiceError> {
        input.validate()?;
        validate_lines(&input.items)?;
        ensure_distinct(input.from_warehouse_id, input.to_warehouse_id)?;

        let txn = self.db_pool.begin().await?;
        require_active_warehouse(&txn, input.from_warehouse_id).await?;
        require_active_warehouse(&txn, input.to_warehouse_id).await?;

        let now = Utc::now();
        let transfer = internal_transfer::ActiveModel {
            id: Set(Uuid::new_v4()),
            transfer_number: Set(document_number::generate(DocumentPrefix::InternalTransfer)),
            from_warehouse_id: Set(input.from_warehouse_id),
            to_warehouse_id: Set(input.to_warehouse_id),
            scheduled_date: Set(input.scheduled_date),
            status: Set(TransferStatus::Draft),
            created_by: Set(user_id),
            validated_by: Set(None),
            validated_at: Set(None),
            completed_date: Set(None),
            notes: Set(input.notes),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let items = insert_items(&txn, transfer.id, &input.items).await?;
        txn.commit().await?;

        info!(
            transfer_id = %transfer.id,
            document_number = %transfer.transfer_number,
            items = items.len(),
            "Internal transfer created"
        );
        Ok(TransferWithItems { transfer, items })
    }

    #[instrument(skip(self, input))]
    pub async fn update(
        &self,
        id: Uuid,
        input: UpdateTransferInput,
    ) -> Result<TransferWithItems, ServiceError> {
        input.validate()?;
        if let Some(items) = &input.items {
            validate_lines(items)?;
        }

        let txn = self.db_pool.begin().await?;
        let transfer = lock_transfer(&txn, id).await?;
        if transfer.status != TransferStatus::Draft {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &transfer.transfer_number,
                "update",
                transfer.status,
            ));
        }

        let from = input.from_warehouse_id.unwrap_or(transfer.from_warehouse_id);
        let to = input.to_warehouse_id.unwrap_or(transfer.to_warehouse_id);
        ensure_distinct(from, to)?;
        if from != transfer.from_warehouse_id {
            require_active_warehouse(&txn, from).await?;
        }
        if to != transfer.to_warehouse_id {
            require_active_warehouse(&txn, to).await?;
        }

        let mut active: internal_transfer::ActiveModel = transfer.into();
        active.from_warehouse_id = Set(from);
        active.to_warehouse_id = Set(to);
        if let Some(scheduled_date) = input.scheduled_date {
            active.scheduled_date = Set(Some(scheduled_date));
        }
        if let Some(notes) = input.notes {
            active.notes = Set(Some(notes));
        }
        active.updated_at = Set(Utc::now());
        let transfer = active.update(&txn).await?;

        let items = match input.items {
            Some(new_items) => {
                InternalTransferItem::delete_many()
                    .filter(internal_transfer_item::Column::TransferId.eq(id))
                    .exec(&txn)
                    .await?;
                insert_items(&txn, id, &new_items).await?
            }
            None => load_items(&txn, id).await?,
        };
        txn.commit().await?;

        info!(document_number = %transfer.transfer_number, "Internal transfer updated");
        Ok(TransferWithItems { transfer, items })
    }

    /// Moves DRAFT -> WAITING -> READY. No stock effect.
    #[instrument(skip(self))]
    pub async fn advance(&self, id: Uuid) -> Result<internal_transfer::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let transfer = lock_transfer(&txn, id).await?;
        let next = transfer.status.next().ok_or_else(|| {
            ServiceError::invalid_transition(
                DOCUMENT,
                &transfer.transfer_number,
                "advance",
                transfer.status,
            )
        })?;

        let mut active: internal_transfer::ActiveModel = transfer.into();
        active.status = Set(next);
        active.updated_at = Set(Utc::now());
        let transfer = active.update(&txn).await?;
        txn.commit().await?;

        info!(document_number = %transfer.transfer_number, status = %transfer.status, "Internal transfer advanced");
        Ok(transfer)
    }

    /// Moves every line from source to destination.
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<TransferWithItems, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let transfer = lock_transfer(&txn, id).await?;
        if transfer.status.is_terminal() {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &transfer.transfer_number,
                "validate",
                transfer.status,
            ));
        }
        ensure_distinct(transfer.from_warehouse_id, transfer.to_warehouse_id)?;

        let items = load_items(&txn, id).await?;
        if items.is_empty() {
            return Err(ServiceError::BadRequest(format!(
                "Internal transfer {} has no items",
                transfer.transfer_number
            )));
        }

        for item in &items {
            let outbound = stock_movement::withdraw_unreserved(
                &txn,
                item.product_id,
                transfer.from_warehouse_id,
                item.quantity,
            )
            .await
            .map_err(track_shortfall("transfer_validate"))?;

            let inbound = stock_movement::apply_delta(
                &txn,
                item.product_id,
                transfer.to_warehouse_id,
                item.quantity,
                false,
            )
            .await?;

            let metadata = json!({
                "item_id": item.id,
                "from_warehouse_id": transfer.from_warehouse_id,
                "to_warehouse_id": transfer.to_warehouse_id,
            });

            stock_movement::record_ledger(
                &txn,
                LedgerEntry {
                    transaction_type: TransactionType::TransferOut,
                    document_id: transfer.id,
                    document_number: &transfer.transfer_number,
                    product_id: item.product_id,
                    warehouse_id: transfer.from_warehouse_id,
                    change: outbound,
                    user_id,
                    metadata: Some(metadata.clone()),
                },
            )
            .await?;

            stock_movement::record_ledger(
                &txn,
                LedgerEntry {
                    transaction_type: TransactionType::TransferIn,
                    document_id: transfer.id,
                    document_number: &transfer.transfer_number,
                    product_id: item.product_id,
                    warehouse_id: transfer.to_warehouse_id,
                    change: inbound,
                    user_id,
                    metadata: Some(metadata),
                },
            )
            .await?;
        }

        let now = Utc::now();
        let mut active: internal_transfer::ActiveModel = transfer.into();
        active.status = Set(TransferStatus::Done);
        active.validated_by = Set(Some(user_id));
        active.validated_at = Set(Some(now));
        active.completed_date = Set(Some(now));
        active.updated_at = Set(now);
        let transfer = active.update(&txn).await?;

        txn.commit().await?;
        metrics::record_validated(METRIC_LABEL);

        info!(
            document_number = %transfer.transfer_number,
            from = %transfer.from_warehouse_id,
            to = %transfer.to_warehouse_id,
            items = items.len(),
            "Internal transfer validated"
        );
        self.event_sender
            .send_or_log(Event::TransferValidated {
                transfer_id: transfer.id,
                transfer_number: transfer.transfer_number.clone(),
                from_warehouse_id: transfer.from_warehouse_id,
                to_warehouse_id: transfer.to_warehouse_id,
                product_ids: items.iter().map(|i| i.product_id).collect(),
                validated_at: now,
            });

        Ok(TransferWithItems { transfer, items })
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<internal_transfer::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let transfer = lock_transfer(&txn, id).await?;
        if transfer.status.is_terminal() {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &transfer.transfer_number,
                "cancel",
                transfer.status,
            ));
        }

        let mut active: internal_transfer::ActiveModel = transfer.into();
        active.status = Set(TransferStatus::Canceled);
        active.updated_at = Set(Utc::now());
        let transfer = active.update(&txn).await?;
        txn.commit().await?;
        metrics::record_cancelled(METRIC_LABEL);

        info!(document_number = %transfer.transfer_number, "Internal transfer cancelled");
        self.event_sender
            .send_or_log(Event::DocumentCancelled {
                kind: DocumentKind::InternalTransfer,
                document_id: transfer.id,
                document_number: transfer.transfer_number.clone(),
            });

        Ok(transfer)
    }

    pub async fn get(&self, id: Uuid) -> Result<TransferWithItems, ServiceError> {
        let db = &*self.db_pool;
        let transfer = InternalTransfer::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Internal transfer {} not found", id)))?;
        let items = load_items(db, id).await?;
        Ok(TransferWithItems { transfer, items })
    }

    pub async fn list(
        &self,
        status: Option<TransferStatus>,
    ) -> Result<Vec<internal_transfer::Model>, ServiceError> {
        let mut query = InternalTransfer::find();
        if let Some(status) = status {
            query = query.filter(internal_transfer::Column::Status.eq(status));
        }
        Ok(query
            .order_by_desc(internal_transfer::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }
}

async fn lock_transfer(
    txn: &DatabaseTransaction,
    id: Uuid,
) -> Result<internal_transfer::Model, ServiceError> {
    InternalTransfer::find_by_id(id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Internal transfer {} not found", id)))
}

async fn load_items<C>(
    conn: &C,
    transfer_id: Uuid,
) -> Result<Vec<internal_transfer_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(InternalTransferItem::find()
        .filter(internal_transfer_item::Column::TransferId.eq(transfer_id))
        .order_by_asc(internal_transfer_item::Column::Position)
        .all(conn)
        .await?)
}

async fn insert_items(
    txn: &DatabaseTransaction,
    transfer_id: Uuid,
    lines: &[TransferItemInput],
) -> Result<Vec<internal_transfer_item::Model>, ServiceError> {
    let product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
    require_products(txn, &product_ids).await?;

    let now = Utc::now();
    let mut items = Vec::with_capacity(lines.len());
    for (position, line) in lines.iter().enumerate() {
        let item = internal_transfer_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            transfer_id: Set(transfer_id),
            product_id: Set(line.product_id),
            position: Set(position as i32),
            quantity: Set(line.quantity),
            created_at: Set(now),
        }
        .insert(txn)
        .await?;
        items.push(item);
    }
    Ok(items)
}
