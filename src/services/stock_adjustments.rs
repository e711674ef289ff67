//! Stock corrections: DRAFT -> WAITING -> READY -> DONE, or CANCELED.
//!
//! Each line carries a counted target quantity. The on-hand snapshot taken
//! at create/update time is informational; `validate` re-reads the quantity
//! under lock and books the real difference.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::catalog::{require_active_warehouse, require_products};
use super::document_number::{self, DocumentPrefix};
use super::stock_movement::{self, LedgerEntry};
use super::validate_lines;
use crate::entities::audit_ledger::TransactionType;
use crate::entities::stock_adjustment::{self, AdjustmentStatus, Entity as StockAdjustment};
use crate::entities::stock_adjustment_item::{self, Entity as StockAdjustmentItem};
use crate::entities::stock_level::{self, Entity as StockLevel};
use crate::errors::ServiceError;
use crate::events::{DocumentKind, Event, EventSender};
use crate::metrics;

const DOCUMENT: &str = "stock adjustment";
const METRIC_LABEL: &str = "stock_adjustment";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdjustmentItemInput {
    pub product_id: Uuid,
    /// Overrides the document warehouse for this line.
    pub warehouse_id: Option<Uuid>,
    #[validate(range(min = 0, message = "Adjusted quantity cannot be negative"))]
    pub adjusted_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateAdjustmentInput {
    pub warehouse_id: Uuid,
    pub reason: Option<String>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Adjustment must have at least one item"))]
    pub items: Vec<AdjustmentItemInput>,
}

/// Fields left as `None` are kept; `items`, when given, replaces the whole
/// set and is snapshotted against current stock.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateAdjustmentInput {
    pub reason: Option<String>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Adjustment must have at least one item"))]
    pub items: Option<Vec<AdjustmentItemInput>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentWithItems {
    #[serde(flatten)]
    pub adjustment: stock_adjustment::Model,
    pub items: Vec<stock_adjustment_item::Model>,
}

#[derive(Clone)]
pub struct StockAdjustmentService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl StockAdjustmentService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self, input), fields(warehouse_id = %input.warehouse_id))]
    pub async fn create(
        &self,
        input: CreateAdjustmentInput,
        user_id: Uuid,
    ) -> Result<AdjustmentWithItems, ServiceError> {
        input.validate()?;
        validate_lines(&input.items)?;

        let txn = self.db_pool.begin().await?;
        require_active_warehouse(&txn, input.warehouse_id).await?;

        let now = Utc::now();
        let adjustment = stock_adjustment::ActiveModel {
            id: Set(Uuid::new_v4()),
            adjustment_number: Set(document_number::generate(DocumentPrefix::StockAdjustment)),
            warehouse_id: Set(input.warehouse_id),
            reason: Set(input.reason),
            status: Set(AdjustmentStatus::Draft),
            created_by: Set(user_id),
            validated_by: Set(None),
            validated_at: Set(None),
            notes: Set(input.notes),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let items = snapshot_and_insert(&txn, &adjustment, &input.items).await?;
        txn.commit().await?;

        info!(
            adjustment_id = %adjustment.id,
            document_number = %adjustment.adjustment_number,
            items = items.len(),
            "Stock adjustment created"
        );
        Ok(AdjustmentWithItems { adjustment, items })
    }

    #[instrument(skip(self, input))]
    pub async fn update(
        &self,
        id: Uuid,
        input: UpdateAdjustmentInput,
    ) -> Result<AdjustmentWithItems, ServiceError> {
        input.validate()?;
        if let Some(items) = &input.items {
            validate_lines(items)?;
        }

        let txn = self.db_pool.begin().await?;
        let adjustment = lock_adjustment(&txn, id).await?;
        if adjustment.status != AdjustmentStatus::Draft {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &adjustment.adjustment_number,
                "update",
                adjustment.status,
            ));
        }

        let mut active: stock_adjustment::ActiveModel = adjustment.into();
        if let Some(reason) = input.reason {
            active.reason = Set(Some(reason));
        }
        if let Some(notes) = input.notes {
            active.notes = Set(Some(notes));
        }
        active.updated_at = Set(Utc::now());
        let adjustment = active.update(&txn).await?;

        let items = match input.items {
            Some(new_items) => {
                StockAdjustmentItem::delete_many()
                    .filter(stock_adjustment_item::Column::AdjustmentId.eq(id))
                    .exec(&txn)
                    .await?;
                snapshot_and_insert(&txn, &adjustment, &new_items).await?
            }
            None => load_items(&txn, id).await?,
        };
        txn.commit().await?;

        info!(document_number = %adjustment.adjustment_number, "Stock adjustment updated");
        Ok(AdjustmentWithItems { adjustment, items })
    }

    /// Moves DRAFT -> WAITING -> READY. No stock effect.
    #[instrument(skip(self))]
    pub async fn advance(&self, id: Uuid) -> Result<stock_adjustment::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let adjustment = lock_adjustment(&txn, id).await?;
        let next = adjustment.status.next().ok_or_else(|| {
            ServiceError::invalid_transition(
                DOCUMENT,
                &adjustment.adjustment_number,
                "advance",
                adjustment.status,
            )
        })?;

        let mut active: stock_adjustment::ActiveModel = adjustment.into();
        active.status = Set(next);
        active.updated_at = Set(Utc::now());
        let adjustment = active.update(&txn).await?;
        txn.commit().await?;

        info!(document_number = %adjustment.adjustment_number, status = %adjustment.status, "Stock adjustment advanced");
        Ok(adjustment)
    }

    /// Forces each line's stock to its counted quantity.
    ///
    /// The ledger records the difference against the quantity found under
    /// lock, which is also written back onto the line.
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<AdjustmentWithItems, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let adjustment = lock_adjustment(&txn, id).await?;
        if adjustment.status.is_terminal() {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &adjustment.adjustment_number,
                "validate",
                adjustment.status,
            ));
        }

        let items = load_items(&txn, id).await?;
        if items.is_empty() {
            return Err(ServiceError::BadRequest(format!(
                "Stock adjustment {} has no items",
                adjustment.adjustment_number
            )));
        }

        let mut booked = Vec::with_capacity(items.len());
        for item in items {
            let change = stock_movement::set_quantity(
                &txn,
                item.product_id,
                item.warehouse_id,
                item.adjusted_quantity,
            )
            .await?;

            if change.quantity_before != item.current_quantity {
                info!(
                    document_number = %adjustment.adjustment_number,
                    product_id = %item.product_id,
                    snapshot = item.current_quantity,
                    actual = change.quantity_before,
                    "Stock moved since the adjustment snapshot; booking the actual difference"
                );
            }

            stock_movement::record_ledger(
                &txn,
                LedgerEntry {
                    transaction_type: TransactionType::Adjustment,
                    document_id: adjustment.id,
                    document_number: &adjustment.adjustment_number,
                    product_id: item.product_id,
                    warehouse_id: item.warehouse_id,
                    change,
                    user_id,
                    metadata: Some(json!({
                        "item_id": item.id,
                        "reason": adjustment.reason,
                        "snapshot_quantity": item.current_quantity,
                        "adjusted_quantity": item.adjusted_quantity,
                    })),
                },
            )
            .await?;

            let mut active: stock_adjustment_item::ActiveModel = item.into();
            active.current_quantity = Set(change.quantity_before);
            active.difference = Set(change.delta());
            active.updated_at = Set(Utc::now());
            booked.push(active.update(&txn).await?);
        }

        let now = Utc::now();
        let mut active: stock_adjustment::ActiveModel = adjustment.into();
        active.status = Set(AdjustmentStatus::Done);
        active.validated_by = Set(Some(user_id));
        active.validated_at = Set(Some(now));
        active.updated_at = Set(now);
        let adjustment = active.update(&txn).await?;

        txn.commit().await?;
        metrics::record_validated(METRIC_LABEL);

        let net_change: i64 = booked.iter().map(|i| i64::from(i.difference)).sum();
        info!(
            document_number = %adjustment.adjustment_number,
            items = booked.len(),
            net_change,
            "Stock adjustment validated"
        );

        let warehouse_ids: BTreeSet<Uuid> = booked.iter().map(|i| i.warehouse_id).collect();
        self.event_sender
            .send_or_log(Event::AdjustmentValidated {
                adjustment_id: adjustment.id,
                adjustment_number: adjustment.adjustment_number.clone(),
                warehouse_ids: warehouse_ids.into_iter().collect(),
                product_ids: booked.iter().map(|i| i.product_id).collect(),
                net_change,
                validated_at: now,
            });

        Ok(AdjustmentWithItems {
            adjustment,
            items: booked,
        })
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<stock_adjustment::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let adjustment = lock_adjustment(&txn, id).await?;
        if adjustment.status.is_terminal() {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &adjustment.adjustment_number,
                "cancel",
                adjustment.status,
            ));
        }

        let mut active: stock_adjustment::ActiveModel = adjustment.into();
        active.status = Set(AdjustmentStatus::Canceled);
        active.updated_at = Set(Utc::now());
        let adjustment = active.update(&txn).await?;
        txn.commit().await?;
        metrics::record_cancelled(METRIC_LABEL);

        info!(document_number = %adjustment.adjustment_number, "Stock adjustment cancelled");
        self.event_sender
            .send_or_log(Event::DocumentCancelled {
                kind: DocumentKind::StockAdjustment,
                document_id: adjustment.id,
                document_number: adjustment.adjustment_number.clone(),
            });

        Ok(adjustment)
    }

    pub async fn get(&self, id: Uuid) -> Result<AdjustmentWithItems, ServiceError> {
        let db = &*self.db_pool;
        let adjustment = StockAdjustment::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Stock adjustment {} not found", id)))?;
        let items = load_items(db, id).await?;
        Ok(AdjustmentWithItems { adjustment, items })
    }

    pub async fn list(
        &self,
        status: Option<AdjustmentStatus>,
    ) -> Result<Vec<stock_adjustment::Model>, ServiceError> {
        let mut query = StockAdjustment::find();
        if let Some(status) = status {
            query = query.filter(stock_adjustment::Column::Status.eq(status));
        }
        Ok(query
            .order_by_desc(stock_adjustment::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }
}

async fn lock_adjustment(
    txn: &DatabaseTransaction,
    id: Uuid,
) -> Result<stock_adjustment::Model, ServiceError> {
    StockAdjustment::find_by_id(id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Stock adjustment {} not found", id)))
}

async fn load_items<C>(
    conn: &C,
    adjustment_id: Uuid,
) -> Result<Vec<stock_adjustment_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(StockAdjustmentItem::find()
        .filter(stock_adjustment_item::Column::AdjustmentId.eq(adjustment_id))
        .order_by_asc(stock_adjustment_item::Column::Position)
        .all(conn)
        .await?)
}

/// Snapshots current on-hand (0 when no stock row exists) and the difference to the target.
async fn snapshot_and_insert(
    txn: &DatabaseTransaction,
    adjustment: &stock_adjustment::Model,
    lines: &[AdjustmentItemInput],
) -> Result<Vec<stock_adjustment_item::Model>, ServiceError> {
    let product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
    require_products(txn, &product_ids).await?;

    let overrides: BTreeSet<Uuid> = lines
        .iter()
        .filter_map(|l| l.warehouse_id)
        .filter(|w| *w != adjustment.warehouse_id)
        .collect();
    for warehouse_id in overrides {
        require_active_warehouse(txn, warehouse_id).await?;
    }

    let now = Utc::now();
    let mut items = Vec::with_capacity(lines.len());
    for (position, line) in lines.iter().enumerate() {
        let warehouse_id = line.warehouse_id.unwrap_or(adjustment.warehouse_id);
        let current = StockLevel::find()
            .filter(stock_level::Column::ProductId.eq(line.product_id))
            .filter(stock_level::Column::WarehouseId.eq(warehouse_id))
            .one(txn)
            .await?
            .map(|level| level.quantity)
            .unwrap_or(0);
        let difference = line.adjusted_quantity.checked_sub(current).ok_or_else(|| {
            ServiceError::InvalidOperation(format!(
                "Stock quantity out of range: {} to {} overflows",
                current, line.adjusted_quantity
            ))
        })?;

        let item = stock_adjustment_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            adjustment_id: Set(adjustment.id),
            product_id: Set(line.product_id),
            warehouse_id: Set(warehouse_id),
            position: Set(position as i32),
            current_quantity: Set(current),
            adjusted_quantity: Set(line.adjusted_quantity),
            difference: Set(difference),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;
        items.push(item);
    }
    Ok(items)
}
