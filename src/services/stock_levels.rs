//! Read side over stock levels, plus ledger reconciliation.

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::entities::audit_ledger::{self, Entity as AuditLedger};
use crate::entities::product::{self, Entity as Product};
use crate::entities::stock_level::{self, Entity as StockLevel};
use crate::errors::ServiceError;

/// Product whose total on-hand stock is at or below its reorder point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockItem {
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub reorder_point: i32,
    pub on_hand: i64,
    pub reserved: i64,
}

/// Stored quantity compared against the replayed ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub product_id: Uuid,
    pub warehouse_id: Uuid,
    pub stored_quantity: i64,
    pub ledger_quantity: i64,
    pub ledger_entries: usize,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.stored_quantity == self.ledger_quantity
    }
}

#[derive(Clone)]
pub struct StockLevelService {
    db_pool: Arc<DatabaseConnection>,
}

impl StockLevelService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    pub async fn get(
        &self,
        product_id: Uuid,
        warehouse_id: Uuid,
    ) -> Result<stock_level::Model, ServiceError> {
        StockLevel::find()
            .filter(stock_level::Column::ProductId.eq(product_id))
            .filter(stock_level::Column::WarehouseId.eq(warehouse_id))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No stock level for product {} in warehouse {}",
                    product_id, warehouse_id
                ))
            })
    }

    pub async fn list_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<stock_level::Model>, ServiceError> {
        Ok(StockLevel::find()
            .filter(stock_level::Column::ProductId.eq(product_id))
            .order_by_asc(stock_level::Column::WarehouseId)
            .all(&*self.db_pool)
            .await?)
    }

    pub async fn list_for_warehouse(
        &self,
        warehouse_id: Uuid,
    ) -> Result<Vec<stock_level::Model>, ServiceError> {
        Ok(StockLevel::find()
            .filter(stock_level::Column::WarehouseId.eq(warehouse_id))
            .order_by_asc(stock_level::Column::ProductId)
            .all(&*self.db_pool)
            .await?)
    }

    /// Products at or below their reorder point, summed across warehouses, lowest stock first.
    #[instrument(skip(self))]
    pub async fn low_stock(&self) -> Result<Vec<LowStockItem>, ServiceError> {
        let db = &*self.db_pool;
        let products = Product::find()
            .order_by_asc(product::Column::Sku)
            .all(db)
            .await?;

        let mut totals: HashMap<Uuid, (i64, i64)> = HashMap::new();
        for level in StockLevel::find().all(db).await? {
            let entry = totals.entry(level.product_id).or_default();
            entry.0 += i64::from(level.quantity);
            entry.1 += i64::from(level.reserved_quantity);
        }

        let mut low: Vec<LowStockItem> = products
            .into_iter()
            .filter_map(|p| {
                let (on_hand, reserved) = totals.get(&p.id).copied().unwrap_or_default();
                (on_hand <= i64::from(p.reorder_point)).then(|| LowStockItem {
                    product_id: p.id,
                    sku: p.sku,
                    name: p.name,
                    reorder_point: p.reorder_point,
                    on_hand,
                    reserved,
                })
            })
            .collect();
        low.sort_by_key(|item| item.on_hand);
        Ok(low)
    }

    /// Replays the ledger for (product, warehouse) and compares it with the stored quantity.
    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        product_id: Uuid,
        warehouse_id: Uuid,
    ) -> Result<Reconciliation, ServiceError> {
        let db = &*self.db_pool;
        let stored_quantity = StockLevel::find()
            .filter(stock_level::Column::ProductId.eq(product_id))
            .filter(stock_level::Column::WarehouseId.eq(warehouse_id))
            .one(db)
            .await?
            .map(|level| i64::from(level.quantity))
            .unwrap_or(0);

        let entries = AuditLedger::find()
            .filter(audit_ledger::Column::ProductId.eq(product_id))
            .filter(audit_ledger::Column::WarehouseId.eq(warehouse_id))
            .all(db)
            .await?;
        let ledger_quantity: i64 = entries
            .iter()
            .map(|e| i64::from(e.quantity_change))
            .sum();

        let result = Reconciliation {
            product_id,
            warehouse_id,
            stored_quantity,
            ledger_quantity,
            ledger_entries: entries.len(),
        };
        if !result.is_consistent() {
            warn!(
                %product_id,
                %warehouse_id,
                stored_quantity,
                ledger_quantity,
                "Stock level disagrees with ledger replay"
            );
        }
        Ok(result)
    }
}
