use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use super::document_status::DocumentStatus as ReceiptStatus;

/// Inbound movement document.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "receipts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub receipt_number: String,
    pub warehouse_id: Uuid,
    #[sea_orm(nullable)]
    pub supplier: Option<String>,
    #[sea_orm(nullable)]
    pub expected_date: Option<DateTime<Utc>>,
    pub status: ReceiptStatus,
    pub created_by: Uuid,
    #[sea_orm(nullable)]
    pub validated_by: Option<Uuid>,
    #[sea_orm(nullable)]
    pub validated_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub received_date: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::receipt_item::Entity")]
    Items,
    #[sea_orm(
        belongs_to = "super::warehouse::Entity",
        from = "Column::WarehouseId",
        to = "super::warehouse::Column::Id"
    )]
    Warehouse,
}

impl Related<super::receipt_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Items.def()
    }
}

impl Related<super::warehouse::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Warehouse.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
