use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "delivery_order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub delivery_order_id: Uuid,
    pub product_id: Uuid,
    pub position: i32,
    pub quantity: i32,
    pub picked_quantity: i32,
    pub packed_quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::delivery_order::Entity",
        from = "Column::DeliveryOrderId",
        to = "super::delivery_order::Column::Id",
        on_delete = "Cascade"
    )]
    DeliveryOrder,
}

impl Related<super::delivery_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeliveryOrder.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
