mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestContext;
use stockflow::{
    entities::audit_ledger::TransactionType,
    errors::ServiceError,
    services::{
        audit_ledger::LedgerFilter,
        delivery_orders::{CreateDeliveryOrderInput, DeliveryItemInput},
        internal_transfers::{CreateTransferInput, TransferItemInput},
        stock_adjustments::{AdjustmentItemInput, CreateAdjustmentInput},
    },
};
use uuid::Uuid;

/// Receipt, delivery, transfer and adjustment against one product.
async fn run_mixed_flows(ctx: &TestContext, product_id: Uuid, main: Uuid, annex: Uuid) {
    ctx.seed(product_id, main, 20).await;

    let order = ctx
        .services
        .delivery_orders
        .create(
            CreateDeliveryOrderInput {
                warehouse_id: main,
                customer: None,
                scheduled_date: None,
                notes: None,
                items: vec![DeliveryItemInput {
                    product_id,
                    quantity: 6,
                }],
            },
            ctx.user_id,
        )
        .await
        .unwrap();
    ctx.services
        .delivery_orders
        .validate(order.order.id, ctx.user_id)
        .await
        .unwrap();

    let transfer = ctx
        .services
        .internal_transfers
        .create(
            CreateTransferInput {
                from_warehouse_id: main,
                to_warehouse_id: annex,
                scheduled_date: None,
                notes: None,
                items: vec![TransferItemInput {
                    product_id,
                    quantity: 5,
                }],
            },
            ctx.user_id,
        )
        .await
        .unwrap();
    ctx.services
        .internal_transfers
        .validate(transfer.transfer.id, ctx.user_id)
        .await
        .unwrap();

    let adjustment = ctx
        .services
        .stock_adjustments
        .create(
            CreateAdjustmentInput {
                warehouse_id: main,
                reason: None,
                notes: None,
                items: vec![AdjustmentItemInput {
                    product_id,
                    warehouse_id: None,
                    adjusted_quantity: 7,
                }],
            },
            ctx.user_id,
        )
        .await
        .unwrap();
    ctx.services
        .stock_adjustments
        .validate(adjustment.adjustment.id, ctx.user_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn ledger_replays_to_stored_quantity_everywhere() {
    let ctx = TestContext::new().await;
    let product = ctx.product("CABLE-1").await;
    let main = ctx.warehouse("Main").await;
    let annex = ctx.warehouse("Annex").await;
    run_mixed_flows(&ctx, product.id, main.id, annex.id).await;

    assert_eq!(ctx.level(product.id, main.id).await.quantity, 7);
    assert_eq!(ctx.level(product.id, annex.id).await.quantity, 5);

    for warehouse_id in [main.id, annex.id] {
        let reconciliation = ctx
            .services
            .stock_levels
            .reconcile(product.id, warehouse_id)
            .await
            .unwrap();
        assert!(reconciliation.is_consistent(), "{:?}", reconciliation);
    }

    let (rows, total) = ctx
        .services
        .audit_ledger
        .list(LedgerFilter::default(), 1, Some(100))
        .await
        .unwrap();
    assert_eq!(total, 5);
    for row in &rows {
        assert_eq!(row.quantity_after, row.quantity_before + row.quantity_change);
    }
}

#[tokio::test]
async fn filters_narrow_the_history() {
    let ctx = TestContext::new().await;
    let product = ctx.product("CABLE-2").await;
    let main = ctx.warehouse("Main").await;
    let annex = ctx.warehouse("Annex").await;
    run_mixed_flows(&ctx, product.id, main.id, annex.id).await;

    let (annex_rows, annex_total) = ctx
        .services
        .audit_ledger
        .list(
            LedgerFilter {
                warehouse_id: Some(annex.id),
                ..Default::default()
            },
            1,
            Some(50),
        )
        .await
        .unwrap();
    assert_eq!(annex_total, 1);
    assert_eq!(annex_rows[0].transaction_type, TransactionType::TransferIn);

    let (deliveries, _) = ctx
        .services
        .audit_ledger
        .list(
            LedgerFilter {
                transaction_type: Some(TransactionType::Delivery),
                ..Default::default()
            },
            1,
            Some(50),
        )
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].quantity_change, -6);

    let (future, future_total) = ctx
        .services
        .audit_ledger
        .list(
            LedgerFilter {
                from: Some(Utc::now() + Duration::hours(1)),
                ..Default::default()
            },
            1,
            Some(50),
        )
        .await
        .unwrap();
    assert!(future.is_empty());
    assert_eq!(future_total, 0);

    let (recent, _) = ctx
        .services
        .audit_ledger
        .list(
            LedgerFilter {
                product_id: Some(product.id),
                from: Some(Utc::now() - Duration::hours(1)),
                to: Some(Utc::now() + Duration::hours(1)),
                ..Default::default()
            },
            1,
            Some(50),
        )
        .await
        .unwrap();
    assert_eq!(recent.len(), 5);
}

#[tokio::test]
async fn pages_are_newest_first_and_bounded() {
    let ctx = TestContext::new().await;
    let product = ctx.product("CABLE-3").await;
    let main = ctx.warehouse("Main").await;
    let annex = ctx.warehouse("Annex").await;
    run_mixed_flows(&ctx, product.id, main.id, annex.id).await;

    let (first, total) = ctx
        .services
        .audit_ledger
        .list(LedgerFilter::default(), 1, Some(2))
        .await
        .unwrap();
    let (last, _) = ctx
        .services
        .audit_ledger
        .list(LedgerFilter::default(), 3, Some(2))
        .await
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(first.len(), 2);
    assert_eq!(last.len(), 1);
    assert!(first[0].timestamp >= first[1].timestamp);
    assert!(first[1].timestamp >= last[0].timestamp);
    assert_eq!(last[0].transaction_type, TransactionType::Receipt);

    assert_matches!(
        ctx.services
            .audit_ledger
            .list(LedgerFilter::default(), 0, Some(10))
            .await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        ctx.services
            .audit_ledger
            .list(LedgerFilter::default(), 1, Some(1001))
            .await,
        Err(ServiceError::ValidationError(_))
    );

    let now = Utc::now();
    assert_matches!(
        ctx.services
            .audit_ledger
            .list(
                LedgerFilter {
                    from: Some(now),
                    to: Some(now - Duration::minutes(1)),
                    ..Default::default()
                },
                1,
                None,
            )
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn low_stock_reports_products_at_or_below_reorder_point() {
    let ctx = TestContext::new().await;
    let scarce = ctx.product_with_reorder_point("SCARCE-1", 10).await;
    let plenty = ctx.product_with_reorder_point("PLENTY-1", 10).await;
    let untouched = ctx.product_with_reorder_point("NEVER-1", 0).await;
    let main = ctx.warehouse("Main").await;
    let annex = ctx.warehouse("Annex").await;

    ctx.seed(scarce.id, main.id, 4).await;
    ctx.seed(scarce.id, annex.id, 3).await;
    ctx.seed(plenty.id, main.id, 25).await;

    let low = ctx.services.stock_levels.low_stock().await.unwrap();
    let skus: Vec<&str> = low.iter().map(|item| item.sku.as_str()).collect();
    assert_eq!(skus, vec!["NEVER-1", "SCARCE-1"]);

    let scarce_row = low.iter().find(|item| item.product_id == scarce.id).unwrap();
    assert_eq!(scarce_row.on_hand, 7);
    assert_eq!(scarce_row.reserved, 0);
    assert!(low.iter().all(|item| item.product_id != plenty.id));
    assert!(low.iter().any(|item| item.product_id == untouched.id && item.on_hand == 0));

    let per_product = ctx
        .services
        .stock_levels
        .list_for_product(scarce.id)
        .await
        .unwrap();
    assert_eq!(per_product.len(), 2);
    let per_warehouse = ctx
        .services
        .stock_levels
        .list_for_warehouse(main.id)
        .await
        .unwrap();
    assert_eq!(per_warehouse.len(), 2);
}
