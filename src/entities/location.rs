use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A storage slot holding at most one pallet.
///
/// `is_available` is flipped only by pallet assignment and release
/// (see `services::pallets`).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "locations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub area_id: Uuid,
    #[sea_orm(unique)]
    pub code: String,
    pub is_available: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
