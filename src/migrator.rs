use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_catalog_tables::Migration),
            Box::new(m20240301_000002_create_stock_tables::Migration),
            Box::new(m20240301_000003_create_receipt_tables::Migration),
            Box::new(m20240301_000004_create_delivery_order_tables::Migration),
            Box::new(m20240301_000005_create_internal_transfer_tables::Migration),
            Box::new(m20240301_000006_create_stock_adjustment_tables::Migration),
        ]
    }
}

mod m20240301_000001_create_catalog_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Products::Sku)
                                .string_len(64)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(
                            ColumnDef::new(Products::ReorderPoint)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Products::CategoryId).uuid().null())
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Warehouses::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Warehouses::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Warehouses::Name).string().not_null())
                        .col(ColumnDef::new(Warehouses::Location).string().null())
                        .col(
                            ColumnDef::new(Warehouses::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Warehouses::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Warehouses::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Warehouses::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        Sku,
        Name,
        ReorderPoint,
        CategoryId,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Warehouses {
        Table,
        Id,
        Name,
        Location,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000002_create_stock_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_stock_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StockLevels::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockLevels::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockLevels::ProductId).uuid().not_null())
                        .col(ColumnDef::new(StockLevels::WarehouseId).uuid().not_null())
                        .col(
                            ColumnDef::new(StockLevels::Quantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockLevels::ReservedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockLevels::Version)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockLevels::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockLevels::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_levels_product_id")
                                .from(StockLevels::Table, StockLevels::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_levels_warehouse_id")
                                .from(StockLevels::Table, StockLevels::WarehouseId)
                                .to(Warehouses::Table, Warehouses::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            // One row per (product, warehouse)
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_levels_product_warehouse")
                        .table(StockLevels::Table)
                        .col(StockLevels::ProductId)
                        .col(StockLevels::WarehouseId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_levels_warehouse_id")
                        .table(StockLevels::Table)
                        .col(StockLevels::WarehouseId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(AuditLedger::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(AuditLedger::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(AuditLedger::TransactionType)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(AuditLedger::DocumentId).uuid().not_null())
                        .col(
                            ColumnDef::new(AuditLedger::DocumentNumber)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(AuditLedger::ProductId).uuid().not_null())
                        .col(ColumnDef::new(AuditLedger::WarehouseId).uuid().not_null())
                        .col(
                            ColumnDef::new(AuditLedger::QuantityBefore)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(AuditLedger::QuantityAfter)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(AuditLedger::QuantityChange)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(AuditLedger::UserId).uuid().not_null())
                        .col(
                            ColumnDef::new(AuditLedger::Timestamp)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(AuditLedger::Metadata).json().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_audit_ledger_product_warehouse")
                        .table(AuditLedger::Table)
                        .col(AuditLedger::ProductId)
                        .col(AuditLedger::WarehouseId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_audit_ledger_document_id")
                        .table(AuditLedger::Table)
                        .col(AuditLedger::DocumentId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_audit_ledger_timestamp")
                        .table(AuditLedger::Table)
                        .col(AuditLedger::Timestamp)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(AuditLedger::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(StockLevels::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum StockLevels {
        Table,
        Id,
        ProductId,
        WarehouseId,
        Quantity,
        ReservedQuantity,
        Version,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum AuditLedger {
        Table,
        Id,
        TransactionType,
        DocumentId,
        DocumentNumber,
        ProductId,
        WarehouseId,
        QuantityBefore,
        QuantityAfter,
        QuantityChange,
        UserId,
        Timestamp,
        Metadata,
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
    }

    #[derive(DeriveIden)]
    enum Warehouses {
        Table,
        Id,
    }
}

mod m20240301_000003_create_receipt_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_receipt_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Receipts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Receipts::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Receipts::ReceiptNumber)
                                .string_len(32)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Receipts::WarehouseId).uuid().not_null())
                        .col(ColumnDef::new(Receipts::Supplier).string().null())
                        .col(
                            ColumnDef::new(Receipts::ExpectedDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Receipts::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Receipts::CreatedBy).uuid().not_null())
                        .col(ColumnDef::new(Receipts::ValidatedBy).uuid().null())
                        .col(
                            ColumnDef::new(Receipts::ValidatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Receipts::ReceivedDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Receipts::Notes).text().null())
                        .col(
                            ColumnDef::new(Receipts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Receipts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_receipts_warehouse_id")
                                .from(Receipts::Table, Receipts::WarehouseId)
                                .to(Warehouses::Table, Warehouses::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ReceiptItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ReceiptItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ReceiptItems::ReceiptId).uuid().not_null())
                        .col(ColumnDef::new(ReceiptItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(ReceiptItems::Position).integer().not_null())
                        .col(ColumnDef::new(ReceiptItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(ReceiptItems::ReceivedQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ReceiptItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_receipt_items_receipt_id")
                                .from(ReceiptItems::Table, ReceiptItems::ReceiptId)
                                .to(Receipts::Table, Receipts::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_receipt_items_receipt_id")
                        .table(ReceiptItems::Table)
                        .col(ReceiptItems::ReceiptId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ReceiptItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Receipts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Receipts {
        Table,
        Id,
        ReceiptNumber,
        WarehouseId,
        Supplier,
        ExpectedDate,
        Status,
        CreatedBy,
        ValidatedBy,
        ValidatedAt,
        ReceivedDate,
        Notes,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ReceiptItems {
        Table,
        Id,
        ReceiptId,
        ProductId,
        Position,
        Quantity,
        ReceivedQuantity,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Warehouses {
        Table,
        Id,
    }
}

mod m20240301_000004_create_delivery_order_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_delivery_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(DeliveryOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DeliveryOrders::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrders::OrderNumber)
                                .string_len(32)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(DeliveryOrders::WarehouseId).uuid().not_null())
                        .col(ColumnDef::new(DeliveryOrders::Customer).string().null())
                        .col(
                            ColumnDef::new(DeliveryOrders::ScheduledDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrders::Status)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(DeliveryOrders::CreatedBy).uuid().not_null())
                        .col(ColumnDef::new(DeliveryOrders::ValidatedBy).uuid().null())
                        .col(
                            ColumnDef::new(DeliveryOrders::ValidatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrders::ShippedDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(DeliveryOrders::Notes).text().null())
                        .col(
                            ColumnDef::new(DeliveryOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_delivery_orders_warehouse_id")
                                .from(DeliveryOrders::Table, DeliveryOrders::WarehouseId)
                                .to(Warehouses::Table, Warehouses::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(DeliveryOrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DeliveryOrderItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrderItems::DeliveryOrderId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrderItems::ProductId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrderItems::Position)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrderItems::Quantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrderItems::PickedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrderItems::PackedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrderItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_delivery_order_items_order_id")
                                .from(
                                    DeliveryOrderItems::Table,
                                    DeliveryOrderItems::DeliveryOrderId,
                                )
                                .to(DeliveryOrders::Table, DeliveryOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_delivery_order_items_order_id")
                        .table(DeliveryOrderItems::Table)
                        .col(DeliveryOrderItems::DeliveryOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(DeliveryOrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(DeliveryOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum DeliveryOrders {
        Table,
        Id,
        OrderNumber,
        WarehouseId,
        Customer,
        ScheduledDate,
        Status,
        CreatedBy,
        ValidatedBy,
        ValidatedAt,
        ShippedDate,
        Notes,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum DeliveryOrderItems {
        Table,
        Id,
        DeliveryOrderId,
        ProductId,
        Position,
        Quantity,
        PickedQuantity,
        PackedQuantity,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Warehouses {
        Table,
        Id,
    }
}

mod m20240301_000005_create_internal_transfer_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000005_create_internal_transfer_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(InternalTransfers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InternalTransfers::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransfers::TransferNumber)
                                .string_len(32)
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(InternalTransfers::FromWarehouseId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransfers::ToWarehouseId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransfers::ScheduledDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransfers::Status)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransfers::CreatedBy)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InternalTransfers::ValidatedBy).uuid().null())
                        .col(
                            ColumnDef::new(InternalTransfers::ValidatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransfers::CompletedDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(InternalTransfers::Notes).text().null())
                        .col(
                            ColumnDef::new(InternalTransfers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransfers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_internal_transfers_from_warehouse_id")
                                .from(InternalTransfers::Table, InternalTransfers::FromWarehouseId)
                                .to(Warehouses::Table, Warehouses::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_internal_transfers_to_warehouse_id")
                                .from(InternalTransfers::Table, InternalTransfers::ToWarehouseId)
                                .to(Warehouses::Table, Warehouses::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(InternalTransferItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InternalTransferItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransferItems::TransferId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransferItems::ProductId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransferItems::Position)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransferItems::Quantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InternalTransferItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_internal_transfer_items_transfer_id")
                                .from(
                                    InternalTransferItems::Table,
                                    InternalTransferItems::TransferId,
                                )
                                .to(InternalTransfers::Table, InternalTransfers::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_internal_transfer_items_transfer_id")
                        .table(InternalTransferItems::Table)
                        .col(InternalTransferItems::TransferId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InternalTransferItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(InternalTransfers::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum InternalTransfers {
        Table,
        Id,
        TransferNumber,
        FromWarehouseId,
        ToWarehouseId,
        ScheduledDate,
        Status,
        CreatedBy,
        ValidatedBy,
        ValidatedAt,
        CompletedDate,
        Notes,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum InternalTransferItems {
        Table,
        Id,
        TransferId,
        ProductId,
        Position,
        Quantity,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Warehouses {
        Table,
        Id,
    }
}

mod m20240301_000006_create_stock_adjustment_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000006_create_stock_adjustment_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StockAdjustments::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockAdjustments::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustments::AdjustmentNumber)
                                .string_len(32)
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustments::WarehouseId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockAdjustments::Reason).string().null())
                        .col(
                            ColumnDef::new(StockAdjustments::Status)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockAdjustments::CreatedBy).uuid().not_null())
                        .col(ColumnDef::new(StockAdjustments::ValidatedBy).uuid().null())
                        .col(
                            ColumnDef::new(StockAdjustments::ValidatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(StockAdjustments::Notes).text().null())
                        .col(
                            ColumnDef::new(StockAdjustments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_adjustments_warehouse_id")
                                .from(StockAdjustments::Table, StockAdjustments::WarehouseId)
                                .to(Warehouses::Table, Warehouses::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(StockAdjustmentItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockAdjustmentItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustmentItems::AdjustmentId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustmentItems::ProductId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustmentItems::WarehouseId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustmentItems::Position)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustmentItems::CurrentQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustmentItems::AdjustedQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustmentItems::Difference)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustmentItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockAdjustmentItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_adjustment_items_adjustment_id")
                                .from(
                                    StockAdjustmentItems::Table,
                                    StockAdjustmentItems::AdjustmentId,
                                )
                                .to(StockAdjustments::Table, StockAdjustments::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_adjustment_items_adjustment_id")
                        .table(StockAdjustmentItems::Table)
                        .col(StockAdjustmentItems::AdjustmentId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockAdjustmentItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(StockAdjustments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum StockAdjustments {
        Table,
        Id,
        AdjustmentNumber,
        WarehouseId,
        Reason,
        Status,
        CreatedBy,
        ValidatedBy,
        ValidatedAt,
        Notes,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum StockAdjustmentItems {
        Table,
        Id,
        AdjustmentId,
        ProductId,
        WarehouseId,
        Position,
        CurrentQuantity,
        AdjustedQuantity,
        Difference,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Warehouses {
        Table,
        Id,
    }
}
