//! Outbound delivery orders.
//!
//! Creating an order soft-reserves its stock. Picking and packing progress
//! moves the order DRAFT -> PICKING -> PACKING automatically, `mark_ready`
//! moves PACKING -> READY, and `validate` ships the goods. An order's
//! reservation is released exactly once: by `validate` or by `cancel`.

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
use crate::entities::delivery_order::{self, DeliveryStatus, Entity as DeliveryOrder};
use crate::entities::delivery_order_item::{self, Entity as DeliveryOrderItem};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::metrics;

const DOCUMENT: &str = "delivery order";
const METRIC_LABEL: &str = "delivery_order";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeliveryItemInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateDeliveryOrderInput {
    pub warehouse_id: Uuid,
    pub customer: Option<String>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Delivery order must have at least one item"))]
    pub items: Vec<DeliveryItemInput>,
}

/// Header fields left as `None` are kept; `items`, when given, replaces the
/// whole set and re-reserves stock for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateDeliveryOrderInput {
    pub customer: Option<String>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Delivery order must have at least one item"))]
    pub items: Option<Vec<DeliveryItemInput>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PickLine {
    pub item_id: Uuid,
    #[validate(range(min = 0, message = "Picked quantity cannot be negative"))]
    pub picked_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PackLine {
    pub item_id: Uuid,
    #[validate(range(min = 0, message = "Packed quantity cannot be negative"))]
    pub packed_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOrderWithItems {
    #[serde(flatten)]
    pub order: delivery_order::Model,
    pub items: Vec<delivery_order_item::Model>,
}

/// Pick/pack progress of one order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineProgress {
    pub quantity: i32,
    pub picked: i32,
    pub packed: i32,
}

impl From<&delivery_order_item::Model> for LineProgress {
    fn from(item: &delivery_order_item::Model) -> Self {
        Self {
            quantity: item.quantity,
            picked: item.picked_quantity,
            packed: item.packed_quantity,
        }
    }
}

/// Status implied by pick/pack progress.
///
/// Every line packed means PACKING, every line picked means PICKING.
/// Only DRAFT and PICKING orders move, and never backwards.
pub fn derive_status(current: DeliveryStatus, lines: &[LineProgress]) -> DeliveryStatus {
    if lines.is_empty() || !matches!(current, DeliveryStatus::Draft | DeliveryStatus::Picking) {
        return current;
    }

    if lines.iter().all(|l| l.packed >= l.quantity) {
        DeliveryStatus::Packing
    } else if lines.iter().all(|l| l.picked >= l.quantity) {
        DeliveryStatus::Picking
    } else {
        current
    }
}

#[derive(Clone)]
pub struct DeliveryOrderService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl DeliveryOrderService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Creates the order and reserves stock for every line in one transaction.
    #[instrument(skip(self, input), fields(warehouse_id = %input.warehouse_id))]
    pub async fn create(
        &self,
        input: CreateDeliveryOrderInput,
        user_id: Uuid,
    ) -> Result<DeliveryOrderWithItems, ServiceError> {
        input.validate()?;
        validate_lines(&input.items)?;

        let txn = self.db_pool.begin().await?;
        require_active_warehouse(&txn, input.warehouse_id).await?;

        let now = Utc::now();
        let order = delivery_order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(document_number::generate(DocumentPrefix::DeliveryOrder)),
            warehouse_id: Set(input.warehouse_id),
            customer: Set(input.customer),
            scheduled_date: Set(input.scheduled_date),
            status: Set(DeliveryStatus::Draft),
            created_by: Set(user_id),
            validated_by: Set(None),
            validated_at: Set(None),
            shipped_date: Set(None),
            notes: Set(input.notes),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let items = reserve_and_insert(&txn, &order, &input.items).await?;
        txn.commit().await?;

        let reserved_units: i64 = items.iter().map(|i| i64::from(i.quantity)).sum();
        info!(
            order_id = %order.id,
            document_number = %order.order_number,
            reserved_units,
            "Delivery order created"
        );
        self.event_sender
            .send_or_log(Event::DeliveryOrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
                warehouse_id: order.warehouse_id,
                reserved_units,
            });

        Ok(DeliveryOrderWithItems { order, items })
    }

    #[instrument(skip(self, input))]
    pub async fn update(
        &self,
        id: Uuid,
        input: UpdateDeliveryOrderInput,
    ) -> Result<DeliveryOrderWithItems, ServiceError> {
        input.validate()?;
        if let Some(items) = &input.items {
            validate_lines(items)?;
        }

        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, id).await?;
        if order.status != DeliveryStatus::Draft {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &order.order_number,
                "update",
                order.status,
            ));
        }

        let mut active: delivery_order::ActiveModel = order.into();
        if let Some(customer) = input.customer {
            active.customer = Set(Some(customer));
        }
        if let Some(scheduled_date) = input.scheduled_date {
            active.scheduled_date = Set(Some(scheduled_date));
        }
        if let Some(notes) = input.notes {
            active.notes = Set(Some(notes));
        }
        active.updated_at = Set(Utc::now());
        let order = active.update(&txn).await?;

        let items = match input.items {
            Some(new_items) => {
                for old in load_items(&txn, id).await? {
                    stock_movement::release(&txn, old.product_id, order.warehouse_id, old.quantity)
                        .await?;
                }
                DeliveryOrderItem::delete_many()
                    .filter(delivery_order_item::Column::DeliveryOrderId.eq(id))
                    .exec(&txn)
                    .await?;
                reserve_and_insert(&txn, &order, &new_items).await?
            }
            None => load_items(&txn, id).await?,
        };
        txn.commit().await?;

        info!(document_number = %order.order_number, "Delivery order updated");
        Ok(DeliveryOrderWithItems { order, items })
    }

    /// Records picked quantities. Only DRAFT orders can be picked.
    #[instrument(skip(self, lines))]
    pub async fn pick_items(
        &self,
        id: Uuid,
        lines: Vec<PickLine>,
    ) -> Result<DeliveryOrderWithItems, ServiceError> {
        validate_lines(&lines)?;

        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, id).await?;
        if order.status != DeliveryStatus::Draft {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &order.order_number,
                "pick items of",
                order.status,
            ));
        }

        let mut items = load_items(&txn, id).await?;
        for line in &lines {
            let item = find_item(&mut items, line.item_id)?;
            if line.picked_quantity > item.quantity {
                return Err(ServiceError::BadRequest(format!(
                    "Picked quantity {} exceeds ordered quantity {}",
                    line.picked_quantity, item.quantity
                )));
            }
            if line.picked_quantity < item.packed_quantity {
                return Err(ServiceError::BadRequest(format!(
                    "Picked quantity {} is below already packed quantity {}",
                    line.picked_quantity, item.packed_quantity
                )));
            }
            item.picked_quantity = line.picked_quantity;
            let mut active: delivery_order_item::ActiveModel = item.clone().into();
            active.picked_quantity = Set(line.picked_quantity);
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;
        }

        let order = apply_derived_status(&txn, order, &items).await?;
        txn.commit().await?;

        info!(document_number = %order.order_number, status = %order.status, "Items picked");
        Ok(DeliveryOrderWithItems { order, items })
    }

    /// Records packed quantities. Allowed while DRAFT or PICKING.
    #[instrument(skip(self, lines))]
    pub async fn pack_items(
        &self,
        id: Uuid,
        lines: Vec<PackLine>,
    ) -> Result<DeliveryOrderWithItems, ServiceError> {
        validate_lines(&lines)?;

        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, id).await?;
        if !matches!(order.status, DeliveryStatus::Draft | DeliveryStatus::Picking) {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &order.order_number,
                "pack items of",
                order.status,
            ));
        }

        let mut items = load_items(&txn, id).await?;
        for line in &lines {
            let item = find_item(&mut items, line.item_id)?;
            if line.packed_quantity > item.picked_quantity {
                return Err(ServiceError::BadRequest(format!(
                    "Packed quantity {} exceeds picked quantity {}",
                    line.packed_quantity, item.picked_quantity
                )));
            }
            item.packed_quantity = line.packed_quantity;
            let mut active: delivery_order_item::ActiveModel = item.clone().into();
            active.packed_quantity = Set(line.packed_quantity);
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;
        }

        let order = apply_derived_status(&txn, order, &items).await?;
        txn.commit().await?;

        info!(document_number = %order.order_number, status = %order.status, "Items packed");
        Ok(DeliveryOrderWithItems { order, items })
    }

    /// PACKING -> READY.
    #[instrument(skip(self))]
    pub async fn mark_ready(&self, id: Uuid) -> Result<delivery_order::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, id).await?;
        if order.status != DeliveryStatus::Packing {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &order.order_number,
                "mark ready",
                order.status,
            ));
        }

        let order = set_status(&txn, order, DeliveryStatus::Ready).await?;
        txn.commit().await?;

        info!(document_number = %order.order_number, "Delivery order ready");
        Ok(order)
    }

    /// Ships every line: deducts on-hand stock and consumes the reservation.
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<DeliveryOrderWithItems, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, id).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &order.order_number,
                "validate",
                order.status,
            ));
        }

        let items = load_items(&txn, id).await?;
        if items.is_empty() {
            return Err(ServiceError::BadRequest(format!(
                "Delivery order {} has no items",
                order.order_number
            )));
        }

        for item in &items {
            let change = stock_movement::ship(&txn, item.product_id, order.warehouse_id, item.quantity)
                .await
                .map_err(track_shortfall("delivery_validate"))?;

            stock_movement::record_ledger(
                &txn,
                LedgerEntry {
                    transaction_type: TransactionType::Delivery,
                    document_id: order.id,
                    document_number: &order.order_number,
                    product_id: item.product_id,
                    warehouse_id: order.warehouse_id,
                    change,
                    user_id,
                    metadata: Some(json!({
                        "item_id": item.id,
                        "customer": order.customer,
                        "picked_quantity": item.picked_quantity,
                        "packed_quantity": item.packed_quantity,
                    })),
                },
            )
            .await?;
        }

        let now = Utc::now();
        let mut active: delivery_order::ActiveModel = order.into();
        active.status = Set(DeliveryStatus::Done);
        active.validated_by = Set(Some(user_id));
        active.validated_at = Set(Some(now));
        active.shipped_date = Set(Some(now));
        active.updated_at = Set(now);
        let order = active.update(&txn).await?;

        txn.commit().await?;
        metrics::record_validated(METRIC_LABEL);

        info!(
            document_number = %order.order_number,
            warehouse_id = %order.warehouse_id,
            items = items.len(),
            "Delivery order validated"
        );
        self.event_sender
            .send_or_log(Event::DeliveryOrderValidated {
                order_id: order.id,
                order_number: order.order_number.clone(),
                warehouse_id: order.warehouse_id,
                product_ids: items.iter().map(|i| i.product_id).collect(),
                validated_at: now,
            });

        Ok(DeliveryOrderWithItems { order, items })
    }

    /// Cancels the order and releases its reservations.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<delivery_order::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, id).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::invalid_transition(
                DOCUMENT,
                &order.order_number,
                "cancel",
                order.status,
            ));
        }

        let items = load_items(&txn, id).await?;
        for item in &items {
            stock_movement::release(&txn, item.product_id, order.warehouse_id, item.quantity)
                .await?;
        }

        let order = set_status(&txn, order, DeliveryStatus::Canceled).await?;
        txn.commit().await?;
        metrics::record_cancelled(METRIC_LABEL);

        let released_units: i64 = items.iter().map(|i| i64::from(i.quantity)).sum();
        info!(
            document_number = %order.order_number,
            released_units,
            "Delivery order cancelled"
        );
        self.event_sender
            .send_or_log(Event::DeliveryOrderCancelled {
                order_id: order.id,
                order_number: order.order_number.clone(),
                released_units,
            });

        Ok(order)
    }

    pub async fn get(&self, id: Uuid) -> Result<DeliveryOrderWithItems, ServiceError> {
        let db = &*self.db_pool;
        let order = DeliveryOrder::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Delivery order {} not found", id)))?;
        let items = load_items(db, id).await?;
        Ok(DeliveryOrderWithItems { order, items })
    }

    pub async fn list(
        &self,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<delivery_order::Model>, ServiceError> {
        let mut query = DeliveryOrder::find();
        if let Some(status) = status {
            query = query.filter(delivery_order::Column::Status.eq(status));
        }
        Ok(query
            .order_by_desc(delivery_order::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }
}

async fn lock_order(
    txn: &DatabaseTransaction,
    id: Uuid,
) -> Result<delivery_order::Model, ServiceError> {
    DeliveryOrder::find_by_id(id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Delivery order {} not found", id)))
}

async fn load_items<C>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<delivery_order_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(DeliveryOrderItem::find()
        .filter(delivery_order_item::Column::DeliveryOrderId.eq(order_id))
        .order_by_asc(delivery_order_item::Column::Position)
        .all(conn)
        .await?)
}

fn find_item(
    items: &mut [delivery_order_item::Model],
    item_id: Uuid,
) -> Result<&mut delivery_order_item::Model, ServiceError> {
    items
        .iter_mut()
        .find(|i| i.id == item_id)
        .ok_or_else(|| ServiceError::NotFound(format!("Delivery order item {} not found", item_id)))
}

async fn set_status(
    txn: &DatabaseTransaction,
    order: delivery_order::Model,
    status: DeliveryStatus,
) -> Result<delivery_order::Model, ServiceError> {
    let mut active: delivery_order::ActiveModel = order.into();
    active.status = Set(status);
    active.updated_at = Set(Utc::now());
    Ok(active.update(txn).await?)
}

async fn apply_derived_status(
    txn: &DatabaseTransaction,
    order: delivery_order::Model,
    items: &[delivery_order_item::Model],
) -> Result<delivery_order::Model, ServiceError> {
    let progress: Vec<LineProgress> = items.iter().map(LineProgress::from).collect();
    let next = derive_status(order.status, &progress);
    if next == order.status {
        return Ok(order);
    }
    info!(
        document_number = %order.order_number,
        from = %order.status,
        to = %next,
        "Delivery order status derived from pick/pack progress"
    );
    set_status(txn, order, next).await
}

/// Reserves stock for each line, then records the lines with nothing picked or packed.
async fn reserve_and_insert(
    txn: &DatabaseTransaction,
    order: &delivery_order::Model,
    lines: &[DeliveryItemInput],
) -> Result<Vec<delivery_order_item::Model>, ServiceError> {
    let product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
    require_products(txn, &product_ids).await?;

    let now = Utc::now();
    let mut items = Vec::with_capacity(lines.len());
    for (position, line) in lines.iter().enumerate() {
        stock_movement::reserve(txn, line.product_id, order.warehouse_id, line.quantity)
            .await
            .map_err(track_shortfall("delivery_reserve"))?;

        let item = delivery_order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            delivery_order_id: Set(order.id),
            product_id: Set(line.product_id),
            position: Set(position as i32),
            quantity: Set(line.quantity),
            picked_quantity: Set(0),
            packed_quantity: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;
        items.push(item);
    }
    Ok(items)
}
