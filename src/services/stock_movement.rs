//! Row-locked stock mutations shared by every movement document.
//!
//! All functions take the caller's open transaction. Each one locks the
//! affected `stock_levels` row (`SELECT ... FOR UPDATE`), checks its
//! precondition, and writes through a version compare-and-set so a stale
//! read can never overwrite a newer row.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::audit_ledger::{self, TransactionType};
use crate::entities::stock_level::{self, Entity as StockLevel};
use crate::errors::ServiceError;
use crate::metrics;

/// Before/after snapshot of one stock-level write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockChange {
    pub stock_level_id: Uuid,
    pub quantity_before: i32,
    pub quantity_after: i32,
}

impl StockChange {
    pub fn delta(&self) -> i32 {
        self.quantity_after - self.quantity_before
    }
}

/// One ledger row to append for a [`StockChange`].
#[derive(Debug, Clone)]
pub struct LedgerEntry<'a> {
    pub transaction_type: TransactionType,
    pub document_id: Uuid,
    pub document_number: &'a str,
    pub product_id: Uuid,
    pub warehouse_id: Uuid,
    pub change: StockChange,
    pub user_id: Uuid,
    pub metadata: Option<serde_json::Value>,
}

/// Locks the stock row for (product, warehouse), if it exists.
pub async fn lock_stock_level<C>(
    conn: &C,
    product_id: Uuid,
    warehouse_id: Uuid,
) -> Result<Option<stock_level::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    StockLevel::find()
        .filter(stock_level::Column::ProductId.eq(product_id))
        .filter(stock_level::Column::WarehouseId.eq(warehouse_id))
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Locks the stock row for (product, warehouse), creating an empty one first if absent.
///
/// A freshly inserted row is only visible to other transactions after commit.
pub async fn lock_or_create<C>(
    conn: &C,
    product_id: Uuid,
    warehouse_id: Uuid,
) -> Result<stock_level::Model, ServiceError>
where
    C: ConnectionTrait,
{
    if let Some(level) = lock_stock_level(conn, product_id, warehouse_id).await? {
        return Ok(level);
    }

    debug!(%product_id, %warehouse_id, "Creating stock level row");
    let now = Utc::now();
    let level = stock_level::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product_id),
        warehouse_id: Set(warehouse_id),
        quantity: Set(0),
        reserved_quantity: Set(0),
        version: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    };
    level.insert(conn).await.map_err(ServiceError::db_error)
}

/// Writes new quantities guarded by the version read under lock.
async fn write_level<C>(
    conn: &C,
    level: &stock_level::Model,
    quantity: i32,
    reserved_quantity: i32,
) -> Result<stock_level::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let next_version = level.version + 1;

    let result = StockLevel::update_many()
        .col_expr(stock_level::Column::Quantity, Expr::value(quantity))
        .col_expr(
            stock_level::Column::ReservedQuantity,
            Expr::value(reserved_quantity),
        )
        .col_expr(stock_level::Column::Version, Expr::value(next_version))
        .col_expr(stock_level::Column::UpdatedAt, Expr::value(now))
        .filter(stock_level::Column::Id.eq(level.id))
        .filter(stock_level::Column::Version.eq(level.version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        metrics::CONCURRENT_MODIFICATIONS.inc();
        warn!(
            stock_level_id = %level.id,
            expected_version = level.version,
            "Stock level changed underneath the lock holder"
        );
        return Err(ServiceError::ConcurrentModification(level.id));
    }

    Ok(stock_level::Model {
        quantity,
        reserved_quantity,
        version: next_version,
        updated_at: now,
        ..level.clone()
    })
}

fn change_of(before: &stock_level::Model, after: &stock_level::Model) -> StockChange {
    StockChange {
        stock_level_id: after.id,
        quantity_before: before.quantity,
        quantity_after: after.quantity,
    }
}

/// Adds `delta` to on-hand stock.
///
/// Without `allow_negative` a result below zero is rejected with
/// `InsufficientStock` and nothing is written.
pub async fn apply_delta<C>(
    conn: &C,
    product_id: Uuid,
    warehouse_id: Uuid,
    delta: i32,
    allow_negative: bool,
) -> Result<StockChange, ServiceError>
where
    C: ConnectionTrait,
{
    let level = lock_or_create(conn, product_id, warehouse_id).await?;
    let new_quantity = level.quantity.checked_add(delta).ok_or_else(|| {
        ServiceError::InvalidOperation(format!(
            "Stock quantity out of range: {} {:+} overflows",
            level.quantity, delta
        ))
    })?;

    if new_quantity < 0 && !allow_negative {
        return Err(ServiceError::insufficient_stock(level.quantity, -delta));
    }

    let updated = write_level(conn, &level, new_quantity, level.reserved_quantity).await?;
    Ok(change_of(&level, &updated))
}

/// Earmarks `quantity` units for an open delivery order. On-hand stock is untouched.
pub async fn reserve<C>(
    conn: &C,
    product_id: Uuid,
    warehouse_id: Uuid,
    quantity: i32,
) -> Result<stock_level::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let level = lock_stock_level(conn, product_id, warehouse_id)
        .await?
        .ok_or_else(|| ServiceError::insufficient_stock(0, quantity))?;

    let available = level.available();
    if available < quantity {
        return Err(ServiceError::insufficient_stock(available, quantity));
    }

    write_level(
        conn,
        &level,
        level.quantity,
        level.reserved_quantity + quantity,
    )
    .await
}

/// Returns `quantity` reserved units to the available pool.
///
/// Saturates at zero; an underflow means the reservation was already
/// released elsewhere and is logged rather than rejected.
pub async fn release<C>(
    conn: &C,
    product_id: Uuid,
    warehouse_id: Uuid,
    quantity: i32,
) -> Result<Option<stock_level::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    let Some(level) = lock_stock_level(conn, product_id, warehouse_id).await? else {
        warn!(%product_id, %warehouse_id, quantity, "No stock level to release reservation from");
        return Ok(None);
    };

    let reserved = release_reserved(&level, quantity);
    write_level(conn, &level, level.quantity, reserved)
        .await
        .map(Some)
}

fn release_reserved(level: &stock_level::Model, quantity: i32) -> i32 {
    if level.reserved_quantity < quantity {
        warn!(
            stock_level_id = %level.id,
            reserved = level.reserved_quantity,
            releasing = quantity,
            "Reservation release exceeds reserved quantity; clamping to zero"
        );
    }
    (level.reserved_quantity - quantity).max(0)
}

/// Deducts shipped stock and converts the matching reservation into that deduction.
///
/// Checks on-hand quantity only; the reservation is not required to cover it.
pub async fn ship<C>(
    conn: &C,
    product_id: Uuid,
    warehouse_id: Uuid,
    quantity: i32,
) -> Result<StockChange, ServiceError>
where
    C: ConnectionTrait,
{
    let level = lock_stock_level(conn, product_id, warehouse_id)
        .await?
        .ok_or_else(|| ServiceError::insufficient_stock(0, quantity))?;

    if level.quantity < quantity {
        return Err(ServiceError::insufficient_stock(level.quantity, quantity));
    }

    let reserved = release_reserved(&level, quantity);
    let updated = write_level(conn, &level, level.quantity - quantity, reserved).await?;
    Ok(change_of(&level, &updated))
}

/// Removes unreserved stock from a warehouse (transfer source leg).
pub async fn withdraw_unreserved<C>(
    conn: &C,
    product_id: Uuid,
    warehouse_id: Uuid,
    quantity: i32,
) -> Result<StockChange, ServiceError>
where
    C: ConnectionTrait,
{
    let level = lock_stock_level(conn, product_id, warehouse_id)
        .await?
        .ok_or_else(|| ServiceError::insufficient_stock(0, quantity))?;

    let available = level.available();
    if available < quantity {
        return Err(ServiceError::insufficient_stock(available, quantity));
    }

    let updated = write_level(
        conn,
        &level,
        level.quantity - quantity,
        level.reserved_quantity,
    )
    .await?;
    Ok(change_of(&level, &updated))
}

/// Forces on-hand stock to an absolute counted value.
pub async fn set_quantity<C>(
    conn: &C,
    product_id: Uuid,
    warehouse_id: Uuid,
    quantity: i32,
) -> Result<StockChange, ServiceError>
where
    C: ConnectionTrait,
{
    if quantity < 0 {
        return Err(ServiceError::ValidationError(format!(
            "Stock quantity cannot be negative: {}",
            quantity
        )));
    }

    let level = lock_or_create(conn, product_id, warehouse_id).await?;
    if quantity.checked_sub(level.quantity).is_none() {
        return Err(ServiceError::InvalidOperation(format!(
            "Stock quantity out of range: {} to {} overflows",
            level.quantity, quantity
        )));
    }
    if quantity < level.reserved_quantity {
        warn!(
            stock_level_id = %level.id,
            quantity,
            reserved = level.reserved_quantity,
            "Counted quantity is below outstanding reservations"
        );
    }

    let updated = write_level(conn, &level, quantity, level.reserved_quantity).await?;
    Ok(change_of(&level, &updated))
}

/// Appends one immutable ledger row.
pub async fn record_ledger<C>(
    conn: &C,
    entry: LedgerEntry<'_>,
) -> Result<audit_ledger::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let row = audit_ledger::ActiveModel {
        id: Set(Uuid::new_v4()),
        transaction_type: Set(entry.transaction_type),
        document_id: Set(entry.document_id),
        document_number: Set(entry.document_number.to_string()),
        product_id: Set(entry.product_id),
        warehouse_id: Set(entry.warehouse_id),
        quantity_before: Set(entry.change.quantity_before),
        quantity_after: Set(entry.change.quantity_after),
        quantity_change: Set(entry.change.delta()),
        user_id: Set(entry.user_id),
        timestamp: Set(Utc::now()),
        metadata: Set(entry.metadata),
    };

    let model = row.insert(conn).await.map_err(ServiceError::db_error)?;
    metrics::LEDGER_ENTRIES.inc();
    debug!(
        document_number = %model.document_number,
        product_id = %model.product_id,
        warehouse_id = %model.warehouse_id,
        change = model.quantity_change,
        "Ledger entry recorded"
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(quantity: i32, reserved_quantity: i32) -> stock_level::Model {
        let now = Utc::now();
        stock_level::Model {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            warehouse_id: Uuid::new_v4(),
            quantity,
            reserved_quantity,
            version: 3,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn release_clamps_at_zero() {
        assert_eq!(release_reserved(&level(10, 4), 3), 1);
        assert_eq!(release_reserved(&level(10, 2), 5), 0);
    }

    #[test]
    fn change_delta_is_signed() {
        let change = StockChange {
            stock_level_id: Uuid::nil(),
            quantity_before: 10,
            quantity_after: 6,
        };
        assert_eq!(change.delta(), -4);
    }

    mod with_database {
        use super::*;
        use crate::db::{self, DbConfig};
        use crate::services::catalog::{CatalogService, CreateProductInput, CreateWarehouseInput};
        use assert_matches::assert_matches;
        use sea_orm::{DatabaseConnection, TransactionTrait};
        use std::sync::Arc;

        async fn stocked(quantity: i32) -> (Arc<DatabaseConnection>, Uuid, Uuid) {
            let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
                .await
                .unwrap();
            db::run_migrations(&pool).await.unwrap();
            let pool = Arc::new(pool);

            let catalog = CatalogService::new(pool.clone());
            let product = catalog
                .create_product(CreateProductInput {
                    sku: "GUARD-1".to_string(),
                    name: "Guarded".to_string(),
                    reorder_point: 0,
                    category_id: None,
                })
                .await
                .unwrap();
            let warehouse = catalog
                .create_warehouse(CreateWarehouseInput {
                    name: "Main".to_string(),
                    location: None,
                })
                .await
                .unwrap();

            let txn = pool.begin().await.unwrap();
            apply_delta(&txn, product.id, warehouse.id, quantity, false)
                .await
                .unwrap();
            txn.commit().await.unwrap();
            (pool, product.id, warehouse.id)
        }

        #[tokio::test]
        async fn stale_version_is_rejected_and_rolled_back() {
            let (pool, product_id, warehouse_id) = stocked(5).await;

            let txn = pool.begin().await.unwrap();
            let snapshot = lock_stock_level(&txn, product_id, warehouse_id)
                .await
                .unwrap()
                .unwrap();
            StockLevel::update_many()
                .col_expr(
                    stock_level::Column::Version,
                    Expr::value(snapshot.version + 1),
                )
                .filter(stock_level::Column::Id.eq(snapshot.id))
                .exec(&txn)
                .await
                .unwrap();

            assert_matches!(
                write_level(&txn, &snapshot, 2, 0).await,
                Err(ServiceError::ConcurrentModification(id)) if id == snapshot.id
            );
            txn.rollback().await.unwrap();

            let stored = lock_stock_level(&*pool, product_id, warehouse_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.quantity, 5);
            assert_eq!(stored.version, snapshot.version);
        }

        #[tokio::test]
        async fn delta_past_max_quantity_is_rejected() {
            let (pool, product_id, warehouse_id) = stocked(i32::MAX).await;

            let txn = pool.begin().await.unwrap();
            assert_matches!(
                apply_delta(&txn, product_id, warehouse_id, 1, true).await,
                Err(ServiceError::InvalidOperation(_))
            );
            txn.rollback().await.unwrap();

            let stored = lock_stock_level(&*pool, product_id, warehouse_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.quantity, i32::MAX);
        }
    }
}
