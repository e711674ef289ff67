#![allow(dead_code)]

use std::sync::Arc;

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use stockflow::{
    db::{self, DbConfig},
    entities::{
        audit_ledger::{self, Entity as AuditLedger},
        product, stock_level, warehouse,
    },
    events::{Event, EventSender},
    services::{
        catalog::{CreateProductInput, CreateWarehouseInput},
        receipts::{CreateReceiptInput, ReceiptItemInput},
    },
    AppServices,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Fresh in-memory database with every service wired up.
pub struct TestContext {
    pub services: AppServices,
    pub events: mpsc::Receiver<Event>,
    pub user_id: Uuid,
}

impl TestContext {
    pub async fn new() -> Self {
        let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .expect("connect to in-memory sqlite");
        db::run_migrations(&pool).await.expect("run migrations");

        let (tx, rx) = mpsc::channel(1024);
        let services = AppServices::new(Arc::new(pool), Arc::new(EventSender::new(tx)));

        Self {
            services,
            events: rx,
            user_id: Uuid::new_v4(),
        }
    }

    pub async fn product(&self, sku: &str) -> product::Model {
        self.product_with_reorder_point(sku, 0).await
    }

    pub async fn product_with_reorder_point(&self, sku: &str, reorder_point: i32) -> product::Model {
        self.services
            .catalog
            .create_product(CreateProductInput {
                sku: sku.to_string(),
                name: format!("Product {}", sku),
                reorder_point,
                category_id: None,
            })
            .await
            .expect("create product")
    }

    pub async fn warehouse(&self, name: &str) -> warehouse::Model {
        self.services
            .catalog
            .create_warehouse(CreateWarehouseInput {
                name: name.to_string(),
                location: None,
            })
            .await
            .expect("create warehouse")
    }

    /// Puts `quantity` units on hand through a validated receipt.
    pub async fn seed(&self, product_id: Uuid, warehouse_id: Uuid, quantity: i32) {
        let receipt = self
            .services
            .receipts
            .create(
                CreateReceiptInput {
                    warehouse_id,
                    supplier: Some("Seed Supplier".to_string()),
                    expected_date: None,
                    notes: None,
                    items: vec![ReceiptItemInput {
                        product_id,
                        quantity,
                    }],
                },
                self.user_id,
            )
            .await
            .expect("create seed receipt");
        self.services
            .receipts
            .validate(receipt.receipt.id, None, self.user_id)
            .await
            .expect("validate seed receipt");
    }

    pub async fn level(&self, product_id: Uuid, warehouse_id: Uuid) -> stock_level::Model {
        self.services
            .stock_levels
            .get(product_id, warehouse_id)
            .await
            .expect("stock level exists")
    }

    pub async fn ledger(&self, product_id: Uuid, warehouse_id: Uuid) -> Vec<audit_ledger::Model> {
        AuditLedger::find()
            .filter(audit_ledger::Column::ProductId.eq(product_id))
            .filter(audit_ledger::Column::WarehouseId.eq(warehouse_id))
            .all(&*self.services.db)
            .await
            .expect("load ledger")
    }

    pub async fn ledger_for_document(&self, document_id: Uuid) -> Vec<audit_ledger::Model> {
        self.services
            .audit_ledger
            .for_document(document_id)
            .await
            .expect("load document ledger")
    }

    /// Everything emitted so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
