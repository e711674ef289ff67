use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "receipt_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub product_id: Uuid,
    pub position: i32,
    /// Ordered quantity.
    pub quantity: i32,
    /// Quantity actually received; defaults to the ordered quantity.
    pub received_quantity: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::receipt::Entity",
        from = "Column::ReceiptId",
        to = "super::receipt::Column::Id",
        on_delete = "Cascade"
    )]
    Receipt,
}

impl Related<super::receipt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Receipt.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
