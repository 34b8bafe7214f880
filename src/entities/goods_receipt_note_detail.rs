use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One received line; `pallet_count` pallets are built from it on completion.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "goods_receipt_note_details")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub note_id: Uuid,
    pub goods_id: Uuid,
    pub goods_packing_id: Uuid,
    pub batch_id: Uuid,
    pub package_quantity: i32,
    pub pallet_count: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
