use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum LedgerSourceType {
    #[sea_orm(string_value = "GoodsReceipt")]
    GoodsReceipt,
    #[sea_orm(string_value = "GoodsIssue")]
    GoodsIssue,
    #[sea_orm(string_value = "Disposal")]
    Disposal,
    #[sea_orm(string_value = "Stocktaking")]
    Stocktaking,
    #[sea_orm(string_value = "ManualPallet")]
    ManualPallet,
}

impl LedgerSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoodsReceipt => "GoodsReceipt",
            Self::GoodsIssue => "GoodsIssue",
            Self::Disposal => "Disposal",
            Self::Stocktaking => "Stocktaking",
            Self::ManualPallet => "ManualPallet",
        }
    }
}

/// Append-only journal row of one (goods, packing) pair.
///
/// `balance_after = previous balance_after + in_quantity - out_quantity + stocktaking_change`
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_ledger")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub goods_id: Uuid,
    pub goods_packing_id: Uuid,
    pub sequence: i32,
    pub event_date: DateTime<Utc>,
    pub in_quantity: i32,
    pub out_quantity: i32,
    pub stocktaking_change: i32,
    pub balance_after: i32,
    pub source_type: LedgerSourceType,
    pub source_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Net movement carried by this row.
    pub fn net_change(&self) -> i32 {
        self.in_quantity - self.out_quantity + self.stocktaking_change
    }
}
