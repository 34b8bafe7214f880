use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum StocktakingPalletStatus {
    #[sea_orm(string_value = "Unchecked")]
    Unchecked,
    #[sea_orm(string_value = "Counted")]
    Counted,
    #[sea_orm(string_value = "Missing")]
    Missing,
}

/// Snapshot of a pallet taken when the sheet was created.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stocktaking_pallets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub stocktaking_location_id: Uuid,
    pub pallet_id: Uuid,
    pub expected_quantity: i32,
    pub counted_quantity: Option<i32>,
    pub status: StocktakingPalletStatus,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
