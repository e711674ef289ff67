use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use super::document_status::DocumentStatus as TransferStatus;

/// Warehouse-to-warehouse movement document.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "internal_transfers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub transfer_number: String,
    pub from_warehouse_id: Uuid,
    pub to_warehouse_id: Uuid,
    #[sea_orm(nullable)]
    pub scheduled_date: Option<DateTime<Utc>>,
    pub status: TransferStatus,
    pub created_by: Uuid,
    #[sea_orm(nullable)]
    pub validated_by: Option<Uuid>,
    #[sea_orm(nullable)]
    pub validated_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub completed_date: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::internal_transfer_item::Entity")]
    Items,
}

impl Related<super::internal_transfer_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Items.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
