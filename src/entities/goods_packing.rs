use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A packing format of a goods item (e.g. carton of 12 x 1L).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "goods_packings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub goods_id: Uuid,
    pub name: String,
    pub units_per_package: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
