use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_adjustment_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub adjustment_id: Uuid,
    pub product_id: Uuid,
    /// Warehouse the line applies to; may differ from the header's.
    pub warehouse_id: Uuid,
    pub position: i32,
    /// On-hand quantity at the last snapshot (creation, update or validation).
    pub current_quantity: i32,
    /// Counted target quantity.
    pub adjusted_quantity: i32,
    pub difference: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::stock_adjustment::Entity",
        from = "Column::AdjustmentId",
        to = "super::stock_adjustment::Column::Id",
        on_delete = "Cascade"
    )]
    Adjustment,
}

impl Related<super::stock_adjustment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Adjustment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
