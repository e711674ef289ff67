use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle shared by receipts, internal transfers and stock adjustments.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    #[sea_orm(string_value = "DRAFT")]
    Draft,
    #[sea_orm(string_value = "WAITING")]
    Waiting,
    #[sea_orm(string_value = "READY")]
    Ready,
    #[sea_orm(string_value = "DONE")]
    Done,
    #[sea_orm(string_value = "CANCELED")]
    Canceled,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }

    /// Next non-stock lifecycle step, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Draft => Some(Self::Waiting),
            Self::Waiting => Some(Self::Ready),
            Self::Ready | Self::Done | Self::Canceled => None,
        }
    }
}

/// Delivery-order lifecycle, including the pick/pack sub-states.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    #[sea_orm(string_value = "DRAFT")]
    Draft,
    #[sea_orm(string_value = "PICKING")]
    Picking,
    #[sea_orm(string_value = "PACKING")]
    Packing,
    #[sea_orm(string_value = "READY")]
    Ready,
    #[sea_orm(string_value = "DONE")]
    Done,
    #[sea_orm(string_value = "CANCELED")]
    Canceled,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }
}
