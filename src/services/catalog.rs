//! Product and warehouse lifecycle.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::entities::product::{self, Entity as Product};
use crate::entities::stock_level::{self, Entity as StockLevel};
use crate::entities::warehouse::{self, Entity as Warehouse};
use crate::errors::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateProductInput {
    #[validate(length(min = 1, max = 64, message = "SKU must be 1-64 characters"))]
    pub sku: String,
    #[validate(length(min = 1, message = "Product name cannot be empty"))]
    pub name: String,
    #[validate(range(min = 0, message = "Reorder point cannot be negative"))]
    pub reorder_point: i32,
    pub category_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateWarehouseInput {
    #[validate(length(min = 1, message = "Warehouse name cannot be empty"))]
    pub name: String,
    pub location: Option<String>,
}

#[derive(Clone)]
pub struct CatalogService {
    db_pool: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn create_product(
        &self,
        input: CreateProductInput,
    ) -> Result<product::Model, ServiceError> {
        input.validate()?;
        let db = &*self.db_pool;

        let existing = Product::find()
            .filter(product::Column::Sku.eq(input.sku.as_str()))
            .one(db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Product with SKU {} already exists",
                input.sku
            )));
        }

        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(input.sku),
            name: Set(input.name),
            reorder_point: Set(input.reorder_point),
            category_id: Set(input.category_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await?;

        info!(product_id = %model.id, sku = %model.sku, "Product created");
        Ok(model)
    }

    pub async fn get_product(&self, id: Uuid) -> Result<product::Model, ServiceError> {
        Product::find_by_id(id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))
    }

    pub async fn list_products(&self) -> Result<Vec<product::Model>, ServiceError> {
        Ok(Product::find()
            .order_by_asc(product::Column::Sku)
            .all(&*self.db_pool)
            .await?)
    }

    /// Deletes a product that holds no stock anywhere. Its empty stock rows go with it.
    #[instrument(skip(self))]
    pub async fn delete_product(&self, id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;

        let product = Product::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;

        let stocked = StockLevel::find()
            .filter(stock_level::Column::ProductId.eq(id))
            .filter(stock_level::Column::Quantity.gt(0))
            .count(&txn)
            .await?;
        if stocked > 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot delete product {}: stock on hand in {} warehouse(s)",
                product.sku, stocked
            )));
        }

        StockLevel::delete_many()
            .filter(stock_level::Column::ProductId.eq(id))
            .exec(&txn)
            .await?;
        let sku = product.sku.clone();
        product.delete(&txn).await?;
        txn.commit().await?;

        info!(product_id = %id, sku = %sku, "Product deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn create_warehouse(
        &self,
        input: CreateWarehouseInput,
    ) -> Result<warehouse::Model, ServiceError> {
        input.validate()?;

        let now = Utc::now();
        let model = warehouse::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name),
            location: Set(input.location),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db_pool)
        .await?;

        info!(warehouse_id = %model.id, name = %model.name, "Warehouse created");
        Ok(model)
    }

    pub async fn get_warehouse(&self, id: Uuid) -> Result<warehouse::Model, ServiceError> {
        Warehouse::find_by_id(id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Warehouse {} not found", id)))
    }

    /// Soft-deletes a warehouse that holds neither stock nor reservations.
    #[instrument(skip(self))]
    pub async fn deactivate_warehouse(&self, id: Uuid) -> Result<warehouse::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;

        let warehouse = Warehouse::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Warehouse {} not found", id)))?;

        let occupied = StockLevel::find()
            .filter(stock_level::Column::WarehouseId.eq(id))
            .filter(
                stock_level::Column::Quantity
                    .gt(0)
                    .or(stock_level::Column::ReservedQuantity.gt(0)),
            )
            .count(&txn)
            .await?;
        if occupied > 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot deactivate warehouse {}: {} product(s) still hold stock or reservations",
                warehouse.name, occupied
            )));
        }

        if !warehouse.is_active {
            return Ok(warehouse);
        }

        let mut active: warehouse::ActiveModel = warehouse.into();
        active.is_active = Set(false);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(warehouse_id = %id, "Warehouse deactivated");
        Ok(updated)
    }
}

/// Loads a warehouse that may receive new documents.
pub(crate) async fn require_active_warehouse<C>(
    conn: &C,
    id: Uuid,
) -> Result<warehouse::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let warehouse = Warehouse::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Warehouse {} not found", id)))?;

    if !warehouse.is_active {
        return Err(ServiceError::InvalidOperation(format!(
            "Warehouse {} is inactive",
            warehouse.name
        )));
    }
    Ok(warehouse)
}

/// Fails with `NotFound` naming the first unknown product id.
pub(crate) async fn require_products<C>(conn: &C, ids: &[Uuid]) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let wanted: BTreeSet<Uuid> = ids.iter().copied().collect();
    let found: BTreeSet<Uuid> = Product::find()
        .filter(product::Column::Id.is_in(wanted.iter().copied()))
        .all(conn)
        .await?
        .into_iter()
        .map(|p| p.id)
        .collect();

    match wanted.difference(&found).next() {
        Some(missing) => Err(ServiceError::NotFound(format!(
            "Product {} not found",
            missing
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_input_validation() {
        let ok = CreateProductInput {
            sku: "WID-001".into(),
            name: "Widget".into(),
            reorder_point: 5,
            category_id: None,
        };
        assert!(ok.validate().is_ok());

        let negative = CreateProductInput {
            reorder_point: -1,
            ..ok.clone()
        };
        assert!(negative.validate().is_err());

        let blank_sku = CreateProductInput {
            sku: String::new(),
            ..ok
        };
        assert!(blank_sku.validate().is_err());
    }
}
