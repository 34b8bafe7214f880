use sea_orm::{ConnectionTrait, EntityTrait};
use uuid::Uuid;

use crate::entities::{goods, goods_packing};
use crate::errors::ServiceError;

// Master data and stock
pub mod batches;
pub mod pallets;

// Allocation and the ledger
pub mod inventory_ledger;
pub mod pick_allocation;

// Warehouse documents
pub mod disposal_notes;
pub mod goods_issues;
pub mod goods_receipts;

// Stocktaking
pub mod stocktaking;
pub mod stocktaking_status;

// Background jobs and staff messages
pub mod expiry_check;
pub mod notifications;

// Service factory for dependency injection
pub mod factory;

/// "Goods name (packing name)" after checking the packing belongs to the goods.
pub(crate) async fn goods_label<C: ConnectionTrait>(
    conn: &C,
    goods_id: Uuid,
    goods_packing_id: Uuid,
) -> Result<String, ServiceError> {
    let goods = goods::Entity::find_by_id(goods_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Goods {} not found", goods_id)))?;
    let packing = goods_packing::Entity::find_by_id(goods_packing_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Goods packing {} not found", goods_packing_id))
        })?;
    if packing.goods_id != goods.id {
        return Err(ServiceError::ValidationError(format!(
            "Packing {} does not belong to {}",
            packing.name, goods.name
        )));
    }
    Ok(format!("{} ({})", goods.name, packing.name))
}
