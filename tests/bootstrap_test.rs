use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use stockflow::{
    config::AppConfig,
    events::{process_events, Event, EventHandler, StockChangeLogger},
    services::{
        audit_ledger::LedgerFilter,
        catalog::{CreateProductInput, CreateWarehouseInput},
        receipts::{CreateReceiptInput, ReceiptItemInput},
    },
    AppServices,
};
use uuid::Uuid;

#[derive(Default)]
struct Collect {
    names: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl EventHandler for Collect {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        self.names.lock().unwrap().push(event.name());
        Ok(())
    }
}

#[tokio::test]
async fn services_boot_from_config_and_publish_events() {
    let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
    cfg.auto_migrate = true;
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.db_idle_timeout_secs = 3600;
    cfg.event_channel_capacity = 16;
    cfg.ledger_default_page_size = 1;

    let (services, rx) = AppServices::from_config(&cfg).await.unwrap();
    let collector = Arc::new(Collect::default());
    let handlers: Vec<Arc<dyn EventHandler>> =
        vec![collector.clone(), Arc::new(StockChangeLogger)];
    let processor = tokio::spawn(process_events(rx, handlers));

    let product = services
        .catalog
        .create_product(CreateProductInput {
            sku: "BOOT-1".to_string(),
            name: "Boot product".to_string(),
            reorder_point: 1,
            category_id: None,
        })
        .await
        .unwrap();
    let warehouse = services
        .catalog
        .create_warehouse(CreateWarehouseInput {
            name: "Boot".to_string(),
            location: None,
        })
        .await
        .unwrap();

    let user_id = Uuid::new_v4();
    let receipt = services
        .receipts
        .create(
            CreateReceiptInput {
                warehouse_id: warehouse.id,
                supplier: None,
                expected_date: None,
                notes: None,
                items: vec![
                    ReceiptItemInput {
                        product_id: product.id,
                        quantity: 3,
                    },
                    ReceiptItemInput {
                        product_id: product.id,
                        quantity: 2,
                    },
                ],
            },
            user_id,
        )
        .await
        .unwrap();
    services
        .receipts
        .validate(receipt.receipt.id, None, user_id)
        .await
        .unwrap();

    let (page, total) = services
        .audit_ledger
        .list(LedgerFilter::default(), 1, None)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(total, 2);

    // Closing every sender ends the processing loop.
    drop(services);
    processor.await.unwrap();

    assert_eq!(*collector.names.lock().unwrap(), vec!["receipt_validated"]);
}
