use chrono::Utc;
use metrics::counter;
use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::UnitOfWork;
use crate::entities::{
    batch, goods_packing,
    inventory_ledger::LedgerSourceType,
    location,
    pallet::{self, Entity as PalletEntity, PalletStatus},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory_ledger::{append_entries, LedgerSource, StockMovement};
use crate::services::stocktaking::ensure_no_stocktaking_in_progress;

/// Outcome of changing a pallet's quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantityChange {
    pub pallet: pallet::Model,
    pub previous_quantity: i32,
    /// The pallet reached zero and was soft-deleted.
    pub depleted: bool,
    pub released_location_id: Option<Uuid>,
}

pub(crate) async fn find_pallet<C: ConnectionTrait>(
    conn: &C,
    pallet_id: Uuid,
) -> Result<pallet::Model, ServiceError> {
    PalletEntity::find_by_id(pallet_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Pallet {} not found", pallet_id)))
}

async fn set_location_availability<C: ConnectionTrait>(
    conn: &C,
    location_id: Uuid,
    is_available: bool,
) -> Result<(), ServiceError> {
    let loc = location::Entity::find_by_id(location_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Location {} not found", location_id)))?;

    let mut active: location::ActiveModel = loc.into();
    active.is_available = Set(is_available);
    active.update(conn).await.map_err(ServiceError::db_error)?;
    Ok(())
}

/// Writes a new quantity; zero soft-deletes the pallet and frees its location.
///
/// A deleted pallet brought back to stock is placed on `revive_at`.
async fn apply_quantity<C: ConnectionTrait>(
    conn: &C,
    current: pallet::Model,
    new_quantity: i32,
    revive_at: Option<Uuid>,
) -> Result<QuantityChange, ServiceError> {
    let previous_quantity = current.package_quantity;
    let depleted = new_quantity == 0;
    let released_location_id = if depleted { current.location_id } else { None };

    if let Some(location_id) = released_location_id {
        set_location_availability(conn, location_id, true).await?;
    }

    let revive = !depleted && current.status == PalletStatus::Deleted;
    let mut active: pallet::ActiveModel = current.into();
    active.package_quantity = Set(new_quantity);
    active.updated_at = Set(Utc::now());
    if depleted {
        active.status = Set(PalletStatus::Deleted);
        active.location_id = Set(None);
    } else if revive {
        active.status = Set(PalletStatus::Active);
        if let Some(location_id) = revive_at {
            set_location_availability(conn, location_id, false).await?;
            active.location_id = Set(Some(location_id));
        }
    }
    let pallet = active.update(conn).await.map_err(ServiceError::db_error)?;

    if depleted {
        counter!("pallets.depleted", 1);
    }

    Ok(QuantityChange {
        pallet,
        previous_quantity,
        depleted,
        released_location_id,
    })
}

/// Removes `quantity` packages from a pallet, checking what is on hand now.
///
/// Fails with `InsufficientStock` when another consumer already took the stock.
pub async fn deduct_package_quantity<C: ConnectionTrait>(
    conn: &C,
    pallet_id: Uuid,
    quantity: i32,
) -> Result<QuantityChange, ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "Deducted quantity must be positive, got {}",
            quantity
        )));
    }

    let current = find_pallet(conn, pallet_id).await?;
    if current.status == PalletStatus::Deleted {
        return Err(ServiceError::InsufficientStock(format!(
            "Pallet {} is already empty",
            current.code
        )));
    }
    if current.package_quantity < quantity {
        return Err(ServiceError::InsufficientStock(format!(
            "Pallet {} has {} packages on hand, {} required",
            current.code, current.package_quantity, quantity
        )));
    }

    let remaining = current.package_quantity - quantity;
    apply_quantity(conn, current, remaining, None).await
}

/// Overwrites a pallet's quantity with a counted value.
///
/// A deleted pallet counted above zero goes back onto `counted_at`.
pub async fn set_package_quantity<C: ConnectionTrait>(
    conn: &C,
    pallet_id: Uuid,
    quantity: i32,
    counted_at: Option<Uuid>,
) -> Result<QuantityChange, ServiceError> {
    if quantity < 0 {
        return Err(ServiceError::ValidationError(format!(
            "Pallet quantity cannot be negative, got {}",
            quantity
        )));
    }
    let current = find_pallet(conn, pallet_id).await?;
    apply_quantity(conn, current, quantity, counted_at).await
}

/// Events for a quantity change that emptied a pallet.
pub(crate) fn depletion_event(change: &QuantityChange) -> Option<Event> {
    change.depleted.then(|| Event::PalletDepleted {
        pallet_id: change.pallet.id,
        released_location_id: change.released_location_id,
    })
}

/// Fields of a new pallet built by a receipt or by hand.
#[derive(Debug, Clone)]
pub struct NewPallet {
    pub code: String,
    pub warehouse_id: Uuid,
    pub batch_id: Uuid,
    pub goods_packing_id: Uuid,
    pub goods_receipt_note_id: Option<Uuid>,
    pub package_quantity: i32,
}

pub(crate) async fn insert_pallet<C: ConnectionTrait>(
    conn: &C,
    new: NewPallet,
) -> Result<pallet::Model, ServiceError> {
    let now = Utc::now();
    let row = pallet::ActiveModel {
        id: Set(Uuid::new_v4()),
        code: Set(new.code),
        warehouse_id: Set(new.warehouse_id),
        batch_id: Set(new.batch_id),
        goods_packing_id: Set(new.goods_packing_id),
        location_id: Set(None),
        goods_receipt_note_id: Set(new.goods_receipt_note_id),
        package_quantity: Set(new.package_quantity),
        status: Set(PalletStatus::Active),
        created_at: Set(now),
        updated_at: Set(now),
    };
    row.insert(conn).await.map_err(ServiceError::db_error)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePalletInput {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub warehouse_id: Uuid,
    pub batch_id: Uuid,
    pub goods_packing_id: Uuid,
    #[validate(range(min = 1))]
    pub package_quantity: i32,
    pub location_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct PalletService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl PalletService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Creates a pallet outside of a goods receipt.
    ///
    /// The stock enters the ledger as a `ManualPallet` movement.
    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_pallet(
        &self,
        input: CreatePalletInput,
    ) -> Result<pallet::Model, ServiceError> {
        input.validate()?;

        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        ensure_no_stocktaking_in_progress(uow.conn(), input.warehouse_id).await?;

        let batch = batch::Entity::find_by_id(input.batch_id)
            .one(uow.conn())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", input.batch_id)))?;
        let packing = goods_packing::Entity::find_by_id(input.goods_packing_id)
            .one(uow.conn())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Goods packing {} not found",
                    input.goods_packing_id
                ))
            })?;
        if packing.goods_id != batch.goods_id {
            return Err(ServiceError::ValidationError(format!(
                "Packing {} does not belong to the goods of batch {}",
                packing.name, batch.code
            )));
        }

        let created = insert_pallet(
            uow.conn(),
            NewPallet {
                code: input.code.clone(),
                warehouse_id: input.warehouse_id,
                batch_id: batch.id,
                goods_packing_id: packing.id,
                goods_receipt_note_id: None,
                package_quantity: input.package_quantity,
            },
        )
        .await?;

        let created = match input.location_id {
            Some(location_id) => {
                let placed = place_on_location(uow.conn(), created, location_id).await?;
                uow.record(Event::PalletLocationAssigned {
                    pallet_id: placed.id,
                    location_id,
                });
                placed
            }
            None => created,
        };

        append_entries(
            uow.conn(),
            LedgerSource::new(LedgerSourceType::ManualPallet, created.id),
            Utc::now(),
            &[StockMovement::inbound(
                batch.goods_id,
                packing.id,
                created.package_quantity,
            )],
        )
        .await?;

        uow.record(Event::PalletCreated {
            pallet_id: created.id,
            goods_packing_id: created.goods_packing_id,
            package_quantity: created.package_quantity,
        });
        uow.commit(&self.event_sender).await?;

        counter!("pallets.created", 1);
        info!(pallet_id = %created.id, code = %created.code, "Pallet created");
        Ok(created)
    }

    /// Puts a pallet on a free location, freeing its previous one.
    #[instrument(skip(self))]
    pub async fn assign_location(
        &self,
        pallet_id: Uuid,
        location_id: Uuid,
    ) -> Result<pallet::Model, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;

        let current = find_pallet(uow.conn(), pallet_id).await?;
        if current.status == PalletStatus::Deleted {
            return Err(ServiceError::InvalidOperation(format!(
                "Pallet {} is deleted and cannot be stored",
                current.code
            )));
        }
        if current.location_id == Some(location_id) {
            return Ok(current);
        }

        let previous = current.location_id;
        let placed = place_on_location(uow.conn(), current, location_id).await?;

        if let Some(old) = previous {
            uow.record(Event::PalletLocationReleased {
                pallet_id,
                location_id: old,
            });
        }
        uow.record(Event::PalletLocationAssigned {
            pallet_id,
            location_id,
        });
        uow.commit(&self.event_sender).await?;

        info!(pallet_id = %pallet_id, location_id = %location_id, "Pallet stored");
        Ok(placed)
    }

    /// Takes a pallet off its location.
    #[instrument(skip(self))]
    pub async fn release_location(&self, pallet_id: Uuid) -> Result<pallet::Model, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;

        let current = find_pallet(uow.conn(), pallet_id).await?;
        let Some(location_id) = current.location_id else {
            warn!(pallet_id = %pallet_id, "Pallet has no location to release");
            return Ok(current);
        };

        set_location_availability(uow.conn(), location_id, true).await?;
        let mut active: pallet::ActiveModel = current.into();
        active.location_id = Set(None);
        active.updated_at = Set(Utc::now());
        let released = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        uow.record(Event::PalletLocationReleased {
            pallet_id,
            location_id,
        });
        uow.commit(&self.event_sender).await?;
        Ok(released)
    }

    pub async fn get_pallet(&self, pallet_id: Uuid) -> Result<pallet::Model, ServiceError> {
        find_pallet(&*self.db_pool, pallet_id).await
    }
}

async fn place_on_location<C: ConnectionTrait>(
    conn: &C,
    current: pallet::Model,
    location_id: Uuid,
) -> Result<pallet::Model, ServiceError> {
    let target = location::Entity::find_by_id(location_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Location {} not found", location_id)))?;
    if !target.is_available {
        return Err(ServiceError::Conflict(format!(
            "Location {} is already occupied",
            target.code
        )));
    }

    if let Some(old) = current.location_id {
        set_location_availability(conn, old, true).await?;
    }
    set_location_availability(conn, location_id, false).await?;

    let mut active: pallet::ActiveModel = current.into();
    active.location_id = Set(Some(location_id));
    active.updated_at = Set(Utc::now());
    active.update(conn).await.map_err(ServiceError::db_error)
}
