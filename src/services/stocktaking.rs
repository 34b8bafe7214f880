//! Stocktaking
//!
//! A sheet snapshots every active pallet of the assigned areas. Staff count
//! pallets and submit locations; statuses roll up to the sheet, which is then
//! approved to turn the counts into pallet quantities and ledger adjustments.
//!
//! From the snapshot until approval or cancel no other workflow may change
//! stock in the same warehouse.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::db::UnitOfWork;
use crate::entities::{
    area, goods_packing, location,
    pallet::{self, PalletStatus},
    stocktaking_area::{self, StocktakingAreaStatus},
    stocktaking_location::{self, StocktakingLocationStatus},
    stocktaking_pallet::{self, StocktakingPalletStatus},
    stocktaking_sheet::{self, StocktakingSheetStatus},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory_ledger::{
    create_inventory_ledger_by_stocktaking_sheet, StockMovement,
};
use crate::services::notifications::{entity_types, notify_or_log, NotificationService};
use crate::services::pallets::{depletion_event, find_pallet, set_package_quantity};
use crate::services::stocktaking_status::{
    derive_area_status, initial_sheet_status, rollup_from_location, RollupOutcome,
};

/// Sheet statuses whose snapshot is still live.
const OPEN_SHEET_STATUSES: [StocktakingSheetStatus; 3] = [
    StocktakingSheetStatus::Assigned,
    StocktakingSheetStatus::InProgress,
    StocktakingSheetStatus::PendingApproval,
];

/// Whether a count is under way in the warehouse, from snapshot to approval.
pub async fn is_stocktaking_in_progress<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: Uuid,
) -> Result<bool, ServiceError> {
    let active = stocktaking_sheet::Entity::find()
        .filter(stocktaking_sheet::Column::WarehouseId.eq(warehouse_id))
        .filter(stocktaking_sheet::Column::Status.is_in(OPEN_SHEET_STATUSES))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(active.is_some())
}

/// Refuses stock mutation while a count is under way.
pub async fn ensure_no_stocktaking_in_progress<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: Uuid,
) -> Result<(), ServiceError> {
    if is_stocktaking_in_progress(conn, warehouse_id).await? {
        counter!("stocktaking.guard.rejections", 1);
        return Err(ServiceError::Conflict(format!(
            "Stocktaking is in progress for warehouse {}",
            warehouse_id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaAssignment {
    pub area_id: Uuid,
    pub assigned_to: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateStocktakingSheetInput {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub warehouse_id: Uuid,
    pub created_by: Uuid,
    #[validate(length(min = 1))]
    pub assignments: Vec<AreaAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StocktakingSheetSummary {
    pub sheet: stocktaking_sheet::Model,
    pub areas: usize,
    pub locations: usize,
    pub pallets: usize,
}

/// A leaf write together with the rollup it triggered.
#[derive(Debug, Clone)]
pub struct CountResult {
    pub pallet: stocktaking_pallet::Model,
    pub rollup: RollupOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StocktakingApproval {
    pub sheet: stocktaking_sheet::Model,
    pub adjusted_pallets: usize,
    pub ledger_entries: usize,
}

#[derive(Clone)]
pub struct StocktakingService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
    notifier: Arc<dyn NotificationService>,
}

impl StocktakingService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        event_sender: EventSender,
        notifier: Arc<dyn NotificationService>,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            notifier,
        }
    }

    /// Opens a sheet and snapshots the pallets of every assigned area.
    #[instrument(skip(self, input), fields(code = %input.code, warehouse_id = %input.warehouse_id))]
    pub async fn create_sheet(
        &self,
        input: CreateStocktakingSheetInput,
    ) -> Result<StocktakingSheetSummary, ServiceError> {
        input.validate()?;

        let mut seen = HashSet::new();
        if !input.assignments.iter().all(|a| seen.insert(a.area_id)) {
            return Err(ServiceError::ValidationError(
                "An area can only be assigned once per sheet".to_string(),
            ));
        }

        let mut uow = UnitOfWork::begin(&self.db_pool).await?;

        let open_sheet = stocktaking_sheet::Entity::find()
            .filter(stocktaking_sheet::Column::WarehouseId.eq(input.warehouse_id))
            .filter(stocktaking_sheet::Column::Status.is_in(OPEN_SHEET_STATUSES))
            .one(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;
        if let Some(open) = open_sheet {
            return Err(ServiceError::Conflict(format!(
                "Stocktaking sheet {} is still open for this warehouse",
                open.code
            )));
        }

        let sheet = stocktaking_sheet::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(input.code.clone()),
            warehouse_id: Set(input.warehouse_id),
            status: Set(StocktakingSheetStatus::Assigned),
            created_by: Set(input.created_by),
            approved_by: Set(None),
            completed_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(uow.conn())
        .await
        .map_err(ServiceError::db_error)?;

        let mut location_count = 0;
        let mut pallet_count = 0;
        let mut area_statuses = Vec::with_capacity(input.assignments.len());
        for assignment in &input.assignments {
            let area = area::Entity::find_by_id(assignment.area_id)
                .one(uow.conn())
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Area {} not found", assignment.area_id))
                })?;
            if area.warehouse_id != input.warehouse_id {
                return Err(ServiceError::ValidationError(format!(
                    "Area {} belongs to another warehouse",
                    area.name
                )));
            }

            let locations = location::Entity::find()
                .filter(location::Column::AreaId.eq(area.id))
                .all(uow.conn())
                .await
                .map_err(ServiceError::db_error)?;

            let area_status = if locations.is_empty() {
                derive_area_status(&[], false)
            } else {
                StocktakingAreaStatus::Assigned
            };
            area_statuses.push(area_status);

            let st_area = stocktaking_area::ActiveModel {
                id: Set(Uuid::new_v4()),
                sheet_id: Set(sheet.id),
                area_id: Set(area.id),
                assigned_to: Set(assignment.assigned_to),
                status: Set(area_status),
            }
            .insert(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

            for loc in locations {
                let st_location = stocktaking_location::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    stocktaking_area_id: Set(st_area.id),
                    location_id: Set(loc.id),
                    status: Set(StocktakingLocationStatus::Unchecked),
                }
                .insert(uow.conn())
                .await
                .map_err(ServiceError::db_error)?;
                location_count += 1;

                let pallets = pallet::Entity::find()
                    .filter(pallet::Column::LocationId.eq(loc.id))
                    .filter(pallet::Column::Status.eq(PalletStatus::Active))
                    .all(uow.conn())
                    .await
                    .map_err(ServiceError::db_error)?;

                for p in pallets {
                    stocktaking_pallet::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        stocktaking_location_id: Set(st_location.id),
                        pallet_id: Set(p.id),
                        expected_quantity: Set(p.package_quantity),
                        counted_quantity: Set(None),
                        status: Set(StocktakingPalletStatus::Unchecked),
                    }
                    .insert(uow.conn())
                    .await
                    .map_err(ServiceError::db_error)?;
                    pallet_count += 1;
                }
            }
        }

        let opening_status = initial_sheet_status(&area_statuses);
        let sheet = if opening_status != sheet.status {
            let mut active: stocktaking_sheet::ActiveModel = sheet.into();
            active.status = Set(opening_status);
            active
                .update(uow.conn())
                .await
                .map_err(ServiceError::db_error)?
        } else {
            sheet
        };

        uow.record(Event::StocktakingSheetCreated {
            sheet_id: sheet.id,
            warehouse_id: sheet.warehouse_id,
            pallets: pallet_count,
        });
        uow.commit(&self.event_sender).await?;

        for assignment in &input.assignments {
            notify_or_log(
                self.notifier.as_ref(),
                assignment.assigned_to,
                sheet.id,
                entity_types::STOCKTAKING_SHEET,
                &format!("You were assigned to stocktaking sheet {}", sheet.code),
            )
            .await;
        }

        counter!("stocktaking.sheets.created", 1);
        info!(
            sheet_id = %sheet.id,
            locations = location_count,
            pallets = pallet_count,
            "Stocktaking sheet created"
        );

        Ok(StocktakingSheetSummary {
            areas: input.assignments.len(),
            locations: location_count,
            pallets: pallet_count,
            sheet,
        })
    }

    /// Records the counted quantity of one pallet.
    #[instrument(skip(self))]
    pub async fn record_count(
        &self,
        stocktaking_pallet_id: Uuid,
        counted: i32,
    ) -> Result<CountResult, ServiceError> {
        if counted < 0 {
            return Err(ServiceError::ValidationError(format!(
                "Counted quantity cannot be negative, got {}",
                counted
            )));
        }
        self.write_pallet_count(
            stocktaking_pallet_id,
            StocktakingPalletStatus::Counted,
            counted,
        )
        .await
    }

    /// Records that a snapshotted pallet was not found.
    #[instrument(skip(self))]
    pub async fn mark_missing(
        &self,
        stocktaking_pallet_id: Uuid,
    ) -> Result<CountResult, ServiceError> {
        self.write_pallet_count(stocktaking_pallet_id, StocktakingPalletStatus::Missing, 0)
            .await
    }

    async fn write_pallet_count(
        &self,
        stocktaking_pallet_id: Uuid,
        status: StocktakingPalletStatus,
        counted: i32,
    ) -> Result<CountResult, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;

        let st_pallet = stocktaking_pallet::Entity::find_by_id(stocktaking_pallet_id)
            .one(uow.conn())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Stocktaking pallet {} not found",
                    stocktaking_pallet_id
                ))
            })?;
        open_location(uow.conn(), st_pallet.stocktaking_location_id).await?;

        let location_id = st_pallet.stocktaking_location_id;
        let mut active: stocktaking_pallet::ActiveModel = st_pallet.into();
        active.status = Set(status);
        active.counted_quantity = Set(Some(counted));
        let updated = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        let rollup = rollup_from_location(uow.conn(), location_id).await?;
        record_sheet_change(&mut uow, &rollup);
        uow.commit(&self.event_sender).await?;

        counter!("stocktaking.pallets.counted", 1);
        Ok(CountResult {
            pallet: updated,
            rollup,
        })
    }

    /// Closes a location once every pallet on it was counted or marked missing.
    #[instrument(skip(self))]
    pub async fn submit_location(
        &self,
        stocktaking_location_id: Uuid,
    ) -> Result<RollupOutcome, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;

        let st_location = open_location(uow.conn(), stocktaking_location_id).await?;

        let unchecked = stocktaking_pallet::Entity::find()
            .filter(stocktaking_pallet::Column::StocktakingLocationId.eq(stocktaking_location_id))
            .filter(stocktaking_pallet::Column::Status.eq(StocktakingPalletStatus::Unchecked))
            .all(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;
        if !unchecked.is_empty() {
            return Err(ServiceError::InvalidOperation(format!(
                "{} pallet(s) on this location are not counted yet",
                unchecked.len()
            )));
        }

        let mut active: stocktaking_location::ActiveModel = st_location.into();
        active.status = Set(StocktakingLocationStatus::Pending);
        active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        let rollup = rollup_from_location(uow.conn(), stocktaking_location_id).await?;
        record_sheet_change(&mut uow, &rollup);
        uow.commit(&self.event_sender).await?;

        info!(
            stocktaking_location_id = %stocktaking_location_id,
            sheet_status = rollup.sheet_status.as_str(),
            "Stocktaking location submitted"
        );
        Ok(rollup)
    }

    /// Applies the counts of a sheet awaiting approval.
    ///
    /// Each pallet is set to its counted quantity; the ledger records
    /// `counted - on hand at approval` per (goods, packing) pair.
    #[instrument(skip(self))]
    pub async fn approve_sheet(
        &self,
        sheet_id: Uuid,
        approved_by: Uuid,
    ) -> Result<StocktakingApproval, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;

        let sheet = find_sheet(uow.conn(), sheet_id).await?;
        if sheet.status != StocktakingSheetStatus::PendingApproval {
            return Err(ServiceError::InvalidOperation(format!(
                "Stocktaking sheet {} is {} and cannot be approved",
                sheet.code,
                sheet.status.as_str()
            )));
        }

        let counted = sheet_pallets(uow.conn(), sheet_id).await?;
        let mut goods_by_packing: HashMap<Uuid, Uuid> = HashMap::new();
        let mut adjustments = Vec::new();
        let mut adjusted_pallets = 0;

        for st_pallet in counted {
            let counted_quantity = st_pallet.counted_quantity.unwrap_or(0);
            let current = find_pallet(uow.conn(), st_pallet.pallet_id).await?;
            if current.status == PalletStatus::Deleted && counted_quantity == 0 {
                continue;
            }

            let change = counted_quantity - current.package_quantity;
            if change == 0 {
                continue;
            }

            let goods_id = match goods_by_packing.get(&current.goods_packing_id) {
                Some(id) => *id,
                None => {
                    let packing = goods_packing::Entity::find_by_id(current.goods_packing_id)
                        .one(uow.conn())
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Goods packing {} not found",
                                current.goods_packing_id
                            ))
                        })?;
                    goods_by_packing.insert(packing.id, packing.goods_id);
                    packing.goods_id
                }
            };

            let counted_at = if current.status == PalletStatus::Deleted {
                stocktaking_location::Entity::find_by_id(st_pallet.stocktaking_location_id)
                    .one(uow.conn())
                    .await
                    .map_err(ServiceError::db_error)?
                    .map(|l| l.location_id)
            } else {
                None
            };
            let applied =
                set_package_quantity(uow.conn(), current.id, counted_quantity, counted_at).await?;
            if let Some(event) = depletion_event(&applied) {
                uow.record(event);
            }
            adjustments.push(StockMovement::adjustment(
                goods_id,
                current.goods_packing_id,
                change,
            ));
            adjusted_pallets += 1;
        }

        let now = Utc::now();
        let entries =
            create_inventory_ledger_by_stocktaking_sheet(uow.conn(), sheet_id, &adjustments, now)
                .await?;

        let old_status = sheet.status;
        let created_by = sheet.created_by;
        let mut active: stocktaking_sheet::ActiveModel = sheet.into();
        active.status = Set(StocktakingSheetStatus::Completed);
        active.approved_by = Set(Some(approved_by));
        active.completed_at = Set(Some(now));
        let completed = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        uow.record(Event::StocktakingSheetStatusChanged {
            sheet_id,
            old_status: old_status.as_str().to_string(),
            new_status: completed.status.as_str().to_string(),
        });
        uow.record(Event::StocktakingCompleted {
            sheet_id,
            adjusted_pallets,
        });
        uow.commit(&self.event_sender).await?;

        notify_or_log(
            self.notifier.as_ref(),
            created_by,
            sheet_id,
            entity_types::STOCKTAKING_SHEET,
            &format!("Stocktaking sheet {} was approved", completed.code),
        )
        .await;

        counter!("stocktaking.sheets.approved", 1);
        info!(
            sheet_id = %sheet_id,
            adjusted_pallets,
            ledger_entries = entries.len(),
            "Stocktaking sheet approved"
        );

        Ok(StocktakingApproval {
            sheet: completed,
            adjusted_pallets,
            ledger_entries: entries.len(),
        })
    }

    #[instrument(skip(self))]
    pub async fn cancel_sheet(
        &self,
        sheet_id: Uuid,
    ) -> Result<stocktaking_sheet::Model, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;

        let sheet = find_sheet(uow.conn(), sheet_id).await?;
        if sheet.status.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Stocktaking sheet {} is already {}",
                sheet.code,
                sheet.status.as_str()
            )));
        }

        let old_status = sheet.status;
        let mut active: stocktaking_sheet::ActiveModel = sheet.into();
        active.status = Set(StocktakingSheetStatus::Cancelled);
        let cancelled = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        uow.record(Event::StocktakingSheetStatusChanged {
            sheet_id,
            old_status: old_status.as_str().to_string(),
            new_status: cancelled.status.as_str().to_string(),
        });
        uow.commit(&self.event_sender).await?;
        Ok(cancelled)
    }

    pub async fn get_sheet(
        &self,
        sheet_id: Uuid,
    ) -> Result<stocktaking_sheet::Model, ServiceError> {
        find_sheet(&*self.db_pool, sheet_id).await
    }

    /// Snapshotted pallets of a sheet.
    pub async fn list_pallets(
        &self,
        sheet_id: Uuid,
    ) -> Result<Vec<stocktaking_pallet::Model>, ServiceError> {
        sheet_pallets(&*self.db_pool, sheet_id).await
    }

    /// Stocktaking locations of a sheet.
    pub async fn list_locations(
        &self,
        sheet_id: Uuid,
    ) -> Result<Vec<stocktaking_location::Model>, ServiceError> {
        sheet_locations(&*self.db_pool, sheet_id).await
    }
}

fn record_sheet_change(uow: &mut UnitOfWork, rollup: &RollupOutcome) {
    if let Some(old) = rollup.sheet_changed_from {
        uow.record(Event::StocktakingSheetStatusChanged {
            sheet_id: rollup.sheet_id,
            old_status: old.as_str().to_string(),
            new_status: rollup.sheet_status.as_str().to_string(),
        });
    }
}

async fn find_sheet<C: ConnectionTrait>(
    conn: &C,
    sheet_id: Uuid,
) -> Result<stocktaking_sheet::Model, ServiceError> {
    stocktaking_sheet::Entity::find_by_id(sheet_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Stocktaking sheet {} not found", sheet_id)))
}

/// A location that still accepts counts, on a sheet that is being counted.
async fn open_location<C: ConnectionTrait>(
    conn: &C,
    stocktaking_location_id: Uuid,
) -> Result<stocktaking_location::Model, ServiceError> {
    let st_location = stocktaking_location::Entity::find_by_id(stocktaking_location_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "Stocktaking location {} not found",
                stocktaking_location_id
            ))
        })?;
    if st_location.status == StocktakingLocationStatus::Pending {
        return Err(ServiceError::InvalidOperation(
            "Location was already submitted".to_string(),
        ));
    }

    let st_area = stocktaking_area::Entity::find_by_id(st_location.stocktaking_area_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "Stocktaking area {} not found",
                st_location.stocktaking_area_id
            ))
        })?;
    let sheet = find_sheet(conn, st_area.sheet_id).await?;
    if !matches!(
        sheet.status,
        StocktakingSheetStatus::Assigned | StocktakingSheetStatus::InProgress
    ) {
        return Err(ServiceError::InvalidOperation(format!(
            "Stocktaking sheet {} is {} and no longer accepts counts",
            sheet.code,
            sheet.status.as_str()
        )));
    }
    Ok(st_location)
}

async fn sheet_locations<C: ConnectionTrait>(
    conn: &C,
    sheet_id: Uuid,
) -> Result<Vec<stocktaking_location::Model>, ServiceError> {
    let area_ids: Vec<Uuid> = stocktaking_area::Entity::find()
        .filter(stocktaking_area::Column::SheetId.eq(sheet_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|a| a.id)
        .collect();
    if area_ids.is_empty() {
        return Ok(Vec::new());
    }

    stocktaking_location::Entity::find()
        .filter(stocktaking_location::Column::StocktakingAreaId.is_in(area_ids))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

async fn sheet_pallets<C: ConnectionTrait>(
    conn: &C,
    sheet_id: Uuid,
) -> Result<Vec<stocktaking_pallet::Model>, ServiceError> {
    let location_ids: Vec<Uuid> = sheet_locations(conn, sheet_id)
        .await?
        .into_iter()
        .map(|l| l.id)
        .collect();
    if location_ids.is_empty() {
        return Ok(Vec::new());
    }

    stocktaking_pallet::Entity::find()
        .filter(stocktaking_pallet::Column::StocktakingLocationId.is_in(location_ids))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}
