mod common;

use common::TestContext;
use sea_orm::TransactionTrait;
use stockflow::services::{
    delivery_orders::{CreateDeliveryOrderInput, DeliveryItemInput},
    stock_movement,
};

#[tokio::test]
async fn concurrent_reservations_never_oversell() {
    let ctx = TestContext::new().await;
    let product = ctx.product("HOT-1").await;
    let warehouse = ctx.warehouse("Main").await;
    ctx.seed(product.id, warehouse.id, 10).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let db = ctx.services.db.clone();
        let (product_id, warehouse_id) = (product.id, warehouse.id);
        tasks.push(tokio::spawn(async move {
            let txn = db.begin().await?;
            stock_movement::reserve(&txn, product_id, warehouse_id, 1).await?;
            txn.commit().await?;
            Ok::<_, stockflow::errors::ServiceError>(())
        }));
    }

    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 10, "exactly 10 reservations should succeed");

    let level = ctx.level(product.id, warehouse.id).await;
    assert_eq!(level.reserved_quantity, 10);
    assert_eq!(level.quantity, 10);
    assert_eq!(level.available(), 0);
}

#[tokio::test]
async fn concurrent_validations_ship_once() {
    let ctx = TestContext::new().await;
    let product = ctx.product("HOT-2").await;
    let warehouse = ctx.warehouse("Main").await;
    ctx.seed(product.id, warehouse.id, 10).await;

    let order = ctx
        .services
        .delivery_orders
        .create(
            CreateDeliveryOrderInput {
                warehouse_id: warehouse.id,
                customer: None,
                scheduled_date: None,
                notes: None,
                items: vec![DeliveryItemInput {
                    product_id: product.id,
                    quantity: 4,
                }],
            },
            ctx.user_id,
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let service = ctx.services.delivery_orders.clone();
        let (order_id, user_id) = (order.order.id, ctx.user_id);
        tasks.push(tokio::spawn(async move {
            service.validate(order_id, user_id).await.is_ok()
        }));
    }

    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);

    let level = ctx.level(product.id, warehouse.id).await;
    assert_eq!(level.quantity, 6);
    assert_eq!(level.reserved_quantity, 0);
    assert_eq!(ctx.ledger_for_document(order.order.id).await.len(), 1);
}
