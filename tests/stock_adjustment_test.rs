mod common;

use assert_matches::assert_matches;
use common::TestContext;
use stockflow::{
    entities::{audit_ledger::TransactionType, stock_adjustment::AdjustmentStatus},
    errors::ServiceError,
    events::Event,
    services::{
        internal_transfers::{CreateTransferInput, TransferItemInput},
        stock_adjustments::{AdjustmentItemInput, CreateAdjustmentInput, UpdateAdjustmentInput},
    },
};
use uuid::Uuid;

fn adjustment_input(warehouse_id: Uuid, lines: &[(Uuid, i32)]) -> CreateAdjustmentInput {
    CreateAdjustmentInput {
        warehouse_id,
        reason: Some("cycle count".to_string()),
        notes: None,
        items: lines
            .iter()
            .map(|&(product_id, adjusted_quantity)| AdjustmentItemInput {
                product_id,
                warehouse_id: None,
                adjusted_quantity,
            })
            .collect(),
    }
}

#[tokio::test]
async fn adjustment_sets_the_counted_quantity() {
    let mut ctx = TestContext::new().await;
    let product = ctx.product("VALVE-1").await;
    let warehouse = ctx.warehouse("Main").await;
    ctx.seed(product.id, warehouse.id, 5).await;

    let adjustment = ctx
        .services
        .stock_adjustments
        .create(adjustment_input(warehouse.id, &[(product.id, 8)]), ctx.user_id)
        .await
        .unwrap();
    assert!(adjustment.adjustment.adjustment_number.starts_with("SA-"));
    assert_eq!(adjustment.items[0].current_quantity, 5);
    assert_eq!(adjustment.items[0].difference, 3);

    let done = ctx
        .services
        .stock_adjustments
        .validate(adjustment.adjustment.id, ctx.user_id)
        .await
        .unwrap();
    assert_eq!(done.adjustment.status, AdjustmentStatus::Done);

    assert_eq!(ctx.level(product.id, warehouse.id).await.quantity, 8);
    let ledger = ctx.ledger_for_document(adjustment.adjustment.id).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].transaction_type, TransactionType::Adjustment);
    assert_eq!(ledger[0].quantity_change, 3);

    let events = ctx.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::AdjustmentValidated { net_change: 3, .. }
    )));
}

#[tokio::test]
async fn intervening_movement_is_overridden_and_the_real_difference_booked() {
    let ctx = TestContext::new().await;
    let product = ctx.product("VALVE-2").await;
    let warehouse = ctx.warehouse("Main").await;
    let other = ctx.warehouse("Overflow").await;
    ctx.seed(product.id, warehouse.id, 5).await;

    let adjustment = ctx
        .services
        .stock_adjustments
        .create(adjustment_input(warehouse.id, &[(product.id, 8)]), ctx.user_id)
        .await
        .unwrap();

    let transfer = ctx
        .services
        .internal_transfers
        .create(
            CreateTransferInput {
                from_warehouse_id: warehouse.id,
                to_warehouse_id: other.id,
                scheduled_date: None,
                notes: None,
                items: vec![TransferItemInput {
                    product_id: product.id,
                    quantity: 2,
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
    assert_eq!(ctx.level(product.id, warehouse.id).await.quantity, 3);

    let done = ctx
        .services
        .stock_adjustments
        .validate(adjustment.adjustment.id, ctx.user_id)
        .await
        .unwrap();

    assert_eq!(ctx.level(product.id, warehouse.id).await.quantity, 8);
    assert_eq!(done.items[0].current_quantity, 3);
    assert_eq!(done.items[0].difference, 5);

    let ledger = ctx.ledger_for_document(adjustment.adjustment.id).await;
    assert_eq!(ledger[0].quantity_before, 3);
    assert_eq!(ledger[0].quantity_after, 8);
    assert_eq!(ledger[0].quantity_change, 5);

    let reconciliation = ctx
        .services
        .stock_levels
        .reconcile(product.id, warehouse.id)
        .await
        .unwrap();
    assert!(reconciliation.is_consistent());
}

#[tokio::test]
async fn adjustment_creates_missing_stock_rows_and_honours_line_warehouse() {
    let ctx = TestContext::new().await;
    let product = ctx.product("VALVE-3").await;
    let main = ctx.warehouse("Main").await;
    let annex = ctx.warehouse("Annex").await;

    let adjustment = ctx
        .services
        .stock_adjustments
        .create(
            CreateAdjustmentInput {
                warehouse_id: main.id,
                reason: Some("found stock".to_string()),
                notes: None,
                items: vec![
                    AdjustmentItemInput {
                        product_id: product.id,
                        warehouse_id: None,
                        adjusted_quantity: 2,
                    },
                    AdjustmentItemInput {
                        product_id: product.id,
                        warehouse_id: Some(annex.id),
                        adjusted_quantity: 6,
                    },
                ],
            },
            ctx.user_id,
        )
        .await
        .unwrap();
    assert_eq!(adjustment.items[0].current_quantity, 0);
    assert_eq!(adjustment.items[1].warehouse_id, annex.id);

    ctx.services
        .stock_adjustments
        .validate(adjustment.adjustment.id, ctx.user_id)
        .await
        .unwrap();

    assert_eq!(ctx.level(product.id, main.id).await.quantity, 2);
    assert_eq!(ctx.level(product.id, annex.id).await.quantity, 6);
    assert_eq!(ctx.ledger_for_document(adjustment.adjustment.id).await.len(), 2);
}

#[tokio::test]
async fn adjusting_to_zero_removes_all_stock() {
    let ctx = TestContext::new().await;
    let product = ctx.product("VALVE-4").await;
    let warehouse = ctx.warehouse("Main").await;
    ctx.seed(product.id, warehouse.id, 7).await;

    let adjustment = ctx
        .services
        .stock_adjustments
        .create(adjustment_input(warehouse.id, &[(product.id, 0)]), ctx.user_id)
        .await
        .unwrap();
    ctx.services
        .stock_adjustments
        .validate(adjustment.adjustment.id, ctx.user_id)
        .await
        .unwrap();

    assert_eq!(ctx.level(product.id, warehouse.id).await.quantity, 0);
    let ledger = ctx.ledger_for_document(adjustment.adjustment.id).await;
    assert_eq!(ledger[0].quantity_change, -7);
}

#[tokio::test]
async fn negative_target_is_rejected() {
    let ctx = TestContext::new().await;
    let product = ctx.product("VALVE-5").await;
    let warehouse = ctx.warehouse("Main").await;

    let result = ctx
        .services
        .stock_adjustments
        .create(adjustment_input(warehouse.id, &[(product.id, -1)]), ctx.user_id)
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn update_resnapshots_and_locks_after_draft() {
    let ctx = TestContext::new().await;
    let product = ctx.product("VALVE-6").await;
    let warehouse = ctx.warehouse("Main").await;
    ctx.seed(product.id, warehouse.id, 4).await;

    let adjustment = ctx
        .services
        .stock_adjustments
        .create(adjustment_input(warehouse.id, &[(product.id, 1)]), ctx.user_id)
        .await
        .unwrap();
    let id = adjustment.adjustment.id;

    let updated = ctx
        .services
        .stock_adjustments
        .update(
            id,
            UpdateAdjustmentInput {
                reason: Some("damaged".to_string()),
                items: Some(vec![AdjustmentItemInput {
                    product_id: product.id,
                    warehouse_id: None,
                    adjusted_quantity: 10,
                }]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.adjustment.reason.as_deref(), Some("damaged"));
    assert_eq!(updated.items[0].current_quantity, 4);
    assert_eq!(updated.items[0].difference, 6);

    ctx.services.stock_adjustments.advance(id).await.unwrap();
    assert_matches!(
        ctx.services
            .stock_adjustments
            .update(id, UpdateAdjustmentInput::default())
            .await,
        Err(ServiceError::InvalidStateTransition(_))
    );

    let cancelled = ctx.services.stock_adjustments.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, AdjustmentStatus::Canceled);
    assert_eq!(ctx.level(product.id, warehouse.id).await.quantity, 4);
    assert_matches!(
        ctx.services.stock_adjustments.validate(id, ctx.user_id).await,
        Err(ServiceError::InvalidStateTransition(_))
    );
}
