//! StockFlow
//!
//! Warehouse stock-movement engine: receipts, delivery orders, internal
//! transfers and stock adjustments mutate per-warehouse stock levels under
//! row locks, and every change lands in an append-only audit ledger.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod migrator;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::{
    audit_ledger::AuditLedgerService, catalog::CatalogService,
    delivery_orders::DeliveryOrderService, internal_transfers::InternalTransferService,
    receipts::ReceiptService, stock_adjustments::StockAdjustmentService,
    stock_levels::StockLevelService,
};

/// Every service, wired to one database handle and one event channel.
#[derive(Clone)]
pub struct AppServices {
    pub db: Arc<DatabaseConnection>,
    pub event_sender: Arc<EventSender>,
    pub catalog: CatalogService,
    pub stock_levels: StockLevelService,
    pub audit_ledger: AuditLedgerService,
    pub receipts: ReceiptService,
    pub delivery_orders: DeliveryOrderService,
    pub internal_transfers: InternalTransferService,
    pub stock_adjustments: StockAdjustmentService,
}

impl AppServices {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            catalog: CatalogService::new(db.clone()),
            stock_levels: StockLevelService::new(db.clone()),
            audit_ledger: AuditLedgerService::new(db.clone()),
            receipts: ReceiptService::new(db.clone(), event_sender.clone()),
            delivery_orders: DeliveryOrderService::new(db.clone(), event_sender.clone()),
            internal_transfers: InternalTransferService::new(db.clone(), event_sender.clone()),
            stock_adjustments: StockAdjustmentService::new(db.clone(), event_sender.clone()),
            db,
            event_sender,
        }
    }

    /// Connects using `cfg`, migrates when `auto_migrate` is set, and opens the event channel.
    ///
    /// The caller owns the receiving end, typically handing it to
    /// [`events::process_events`].
    pub async fn from_config(
        cfg: &AppConfig,
    ) -> Result<(Self, mpsc::Receiver<Event>), ServiceError> {
        let pool = db::establish_connection_from_app_config(cfg).await?;
        if cfg.auto_migrate {
            db::run_migrations(&pool).await?;
        }

        let (tx, rx) = mpsc::channel(cfg.event_channel_capacity);
        info!(
            environment = %cfg.environment,
            event_channel_capacity = cfg.event_channel_capacity,
            "Stock services initialised"
        );
        let mut services = Self::new(Arc::new(pool), Arc::new(EventSender::new(tx)));
        services.audit_ledger = services
            .audit_ledger
            .with_default_page_size(cfg.ledger_default_page_size);
        Ok((services, rx))
    }
}
