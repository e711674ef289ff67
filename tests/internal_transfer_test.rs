mod common;

use assert_matches::assert_matches;
use common::TestContext;
use stockflow::{
    entities::{audit_ledger::TransactionType, internal_transfer::TransferStatus},
    errors::ServiceError,
    events::Event,
    services::{
        delivery_orders::{CreateDeliveryOrderInput, DeliveryItemInput},
        internal_transfers::{CreateTransferInput, TransferItemInput, UpdateTransferInput},
    },
};
use uuid::Uuid;

fn transfer_input(from: Uuid, to: Uuid, lines: &[(Uuid, i32)]) -> CreateTransferInput {
    CreateTransferInput {
        from_warehouse_id: from,
        to_warehouse_id: to,
        scheduled_date: None,
        notes: None,
        items: lines
            .iter()
            .map(|&(product_id, quantity)| TransferItemInput {
                product_id,
                quantity,
            })
            .collect(),
    }
}

#[tokio::test]
async fn transfer_moves_stock_and_writes_a_ledger_pair() {
    let mut ctx = TestContext::new().await;
    let product = ctx.product("PIPE-1").await;
    let source = ctx.warehouse("North").await;
    let destination = ctx.warehouse("South").await;
    ctx.seed(product.id, source.id, 10).await;

    let transfer = ctx
        .services
        .internal_transfers
        .create(
            transfer_input(source.id, destination.id, &[(product.id, 4)]),
            ctx.user_id,
        )
        .await
        .unwrap();
    assert!(transfer.transfer.transfer_number.starts_with("IT-"));
    assert_eq!(ctx.level(product.id, source.id).await.reserved_quantity, 0);

    let done = ctx
        .services
        .internal_transfers
        .validate(transfer.transfer.id, ctx.user_id)
        .await
        .unwrap();
    assert_eq!(done.transfer.status, TransferStatus::Done);
    assert!(done.transfer.completed_date.is_some());

    assert_eq!(ctx.level(product.id, source.id).await.quantity, 6);
    assert_eq!(ctx.level(product.id, destination.id).await.quantity, 4);

    let ledger = ctx.ledger_for_document(transfer.transfer.id).await;
    assert_eq!(ledger.len(), 2);
    let out = ledger
        .iter()
        .find(|row| row.transaction_type == TransactionType::TransferOut)
        .unwrap();
    let inbound = ledger
        .iter()
        .find(|row| row.transaction_type == TransactionType::TransferIn)
        .unwrap();
    assert_eq!(out.warehouse_id, source.id);
    assert_eq!(out.quantity_change, -4);
    assert_eq!(inbound.warehouse_id, destination.id);
    assert_eq!(inbound.quantity_change, 4);
    assert_eq!(out.quantity_change + inbound.quantity_change, 0);
    assert!(ledger
        .windows(2)
        .all(|pair| (pair[0].timestamp, pair[0].id) <= (pair[1].timestamp, pair[1].id)));
    let reread = ctx.ledger_for_document(transfer.transfer.id).await;
    assert_eq!(
        reread.iter().map(|row| row.id).collect::<Vec<_>>(),
        ledger.iter().map(|row| row.id).collect::<Vec<_>>()
    );

    let events = ctx.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::TransferValidated { transfer_id, .. } if *transfer_id == transfer.transfer.id
    )));
}

#[tokio::test]
async fn same_source_and_destination_is_rejected() {
    let ctx = TestContext::new().await;
    let product = ctx.product("PIPE-2").await;
    let warehouse = ctx.warehouse("North").await;
    let other = ctx.warehouse("South").await;

    let result = ctx
        .services
        .internal_transfers
        .create(
            transfer_input(warehouse.id, warehouse.id, &[(product.id, 1)]),
            ctx.user_id,
        )
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));

    let transfer = ctx
        .services
        .internal_transfers
        .create(
            transfer_input(warehouse.id, other.id, &[(product.id, 1)]),
            ctx.user_id,
        )
        .await
        .unwrap();
    let update = ctx
        .services
        .internal_transfers
        .update(
            transfer.transfer.id,
            UpdateTransferInput {
                to_warehouse_id: Some(warehouse.id),
                ..Default::default()
            },
        )
        .await;
    assert_matches!(update, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn reserved_stock_cannot_be_transferred() {
    let ctx = TestContext::new().await;
    let product = ctx.product("PIPE-3").await;
    let source = ctx.warehouse("North").await;
    let destination = ctx.warehouse("South").await;
    ctx.seed(product.id, source.id, 10).await;

    ctx.services
        .delivery_orders
        .create(
            CreateDeliveryOrderInput {
                warehouse_id: source.id,
                customer: None,
                scheduled_date: None,
                notes: None,
                items: vec![DeliveryItemInput {
                    product_id: product.id,
                    quantity: 8,
                }],
            },
            ctx.user_id,
        )
        .await
        .unwrap();

    let transfer = ctx
        .services
        .internal_transfers
        .create(
            transfer_input(source.id, destination.id, &[(product.id, 3)]),
            ctx.user_id,
        )
        .await
        .unwrap();

    let result = ctx
        .services
        .internal_transfers
        .validate(transfer.transfer.id, ctx.user_id)
        .await;
    assert_matches!(
        result,
        Err(ServiceError::InsufficientStock(msg)) if msg.contains("Available: 2, Requested: 3")
    );

    let level = ctx.level(product.id, source.id).await;
    assert_eq!(level.quantity, 10);
    assert_eq!(level.reserved_quantity, 8);
}

#[tokio::test]
async fn failure_on_a_later_line_leaves_everything_untouched() {
    let ctx = TestContext::new().await;
    let stocked = ctx.product("PIPE-4").await;
    let short = ctx.product("PIPE-5").await;
    let source = ctx.warehouse("North").await;
    let destination = ctx.warehouse("South").await;
    ctx.seed(stocked.id, source.id, 10).await;
    ctx.seed(short.id, source.id, 1).await;

    let transfer = ctx
        .services
        .internal_transfers
        .create(
            transfer_input(source.id, destination.id, &[(stocked.id, 5), (short.id, 2)]),
            ctx.user_id,
        )
        .await
        .unwrap();

    let result = ctx
        .services
        .internal_transfers
        .validate(transfer.transfer.id, ctx.user_id)
        .await;
    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));

    assert_eq!(ctx.level(stocked.id, source.id).await.quantity, 10);
    assert_matches!(
        ctx.services.stock_levels.get(stocked.id, destination.id).await,
        Err(ServiceError::NotFound(_))
    );
    assert!(ctx.ledger_for_document(transfer.transfer.id).await.is_empty());

    let reloaded = ctx
        .services
        .internal_transfers
        .get(transfer.transfer.id)
        .await
        .unwrap();
    assert_eq!(reloaded.transfer.status, TransferStatus::Draft);
}

#[tokio::test]
async fn inactive_destination_is_rejected_at_creation() {
    let ctx = TestContext::new().await;
    let product = ctx.product("PIPE-6").await;
    let source = ctx.warehouse("North").await;
    let closed = ctx.warehouse("Closed").await;
    ctx.services
        .catalog
        .deactivate_warehouse(closed.id)
        .await
        .unwrap();

    let result = ctx
        .services
        .internal_transfers
        .create(
            transfer_input(source.id, closed.id, &[(product.id, 1)]),
            ctx.user_id,
        )
        .await;
    assert_matches!(result, Err(ServiceError::InvalidOperation(_)));
}

#[tokio::test]
async fn cancelled_transfer_cannot_be_validated() {
    let ctx = TestContext::new().await;
    let product = ctx.product("PIPE-7").await;
    let source = ctx.warehouse("North").await;
    let destination = ctx.warehouse("South").await;
    ctx.seed(product.id, source.id, 3).await;

    let transfer = ctx
        .services
        .internal_transfers
        .create(
            transfer_input(source.id, destination.id, &[(product.id, 3)]),
            ctx.user_id,
        )
        .await
        .unwrap();
    let id = transfer.transfer.id;

    let waiting = ctx.services.internal_transfers.advance(id).await.unwrap();
    assert_eq!(waiting.status, TransferStatus::Waiting);

    let cancelled = ctx.services.internal_transfers.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, TransferStatus::Canceled);

    assert_matches!(
        ctx.services.internal_transfers.validate(id, ctx.user_id).await,
        Err(ServiceError::InvalidStateTransition(_))
    );
    assert_eq!(ctx.level(product.id, source.id).await.quantity, 3);
    assert_eq!(
        ctx.services
            .internal_transfers
            .list(Some(TransferStatus::Canceled))
            .await
            .unwrap()
            .len(),
        1
    );
}
