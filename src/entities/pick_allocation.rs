use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PickAllocationStatus {
    #[sea_orm(string_value = "UnScanned")]
    UnScanned,
    #[sea_orm(string_value = "Scanned")]
    Scanned,
    #[sea_orm(string_value = "Fulfilled")]
    Fulfilled,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
}

impl PickAllocationStatus {
    /// Statuses that still hold quantity on the pallet.
    pub fn committed() -> [PickAllocationStatus; 2] {
        [Self::UnScanned, Self::Scanned]
    }
}

/// Reservation of part of a pallet for one disposal or goods issue line.
///
/// Exactly one of the two detail references is set.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pick_allocations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub disposal_note_detail_id: Option<Uuid>,
    pub goods_issue_note_detail_id: Option<Uuid>,
    pub pallet_id: Uuid,
    pub package_quantity: i32,
    pub status: PickAllocationStatus,
    pub scanned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
