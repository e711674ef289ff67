use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use super::document_status::DeliveryStatus;

/// Outbound movement document. Open orders hold soft reservations on stock.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "delivery_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    pub warehouse_id: Uuid,
    #[sea_orm(nullable)]
    pub customer: Option<String>,
    #[sea_orm(nullable)]
    pub scheduled_date: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    pub created_by: Uuid,
    #[sea_orm(nullable)]
    pub validated_by: Option<Uuid>,
    #[sea_orm(nullable)]
    pub validated_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub shipped_date: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::delivery_order_item::Entity")]
    Items,
    #[sea_orm(
        belongs_to = "super::warehouse::Entity",
        from = "Column::WarehouseId",
        to = "super::warehouse::Column::Id"
    )]
    Warehouse,
}

impl Related<super::delivery_order_item::Entity> for Entity {
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
