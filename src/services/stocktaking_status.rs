//! Bottom-up status propagation for stocktaking sheets.
//!
//! Pallet counts drive location, area and sheet statuses. The rollup runs in
//! the same unit of work as the write that triggered it, so an aggregate status
//! is never committed out of step with its children.

use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use tracing::debug;
use uuid::Uuid;

use crate::entities::{
    stocktaking_area::{self, StocktakingAreaStatus},
    stocktaking_location::{self, StocktakingLocationStatus},
    stocktaking_pallet::{self, StocktakingPalletStatus},
    stocktaking_sheet::{self, StocktakingSheetStatus},
};
use crate::errors::ServiceError;

/// Area status from its locations.
///
/// `counting_started` is true once any pallet of the area was counted or
/// marked missing. An area without locations has nothing left to count.
pub fn derive_area_status(
    locations: &[StocktakingLocationStatus],
    counting_started: bool,
) -> StocktakingAreaStatus {
    if locations
        .iter()
        .all(|s| *s == StocktakingLocationStatus::Pending)
    {
        StocktakingAreaStatus::Pending
    } else if counting_started
        || locations
            .iter()
            .any(|s| *s == StocktakingLocationStatus::Pending)
    {
        StocktakingAreaStatus::InProgress
    } else {
        StocktakingAreaStatus::Assigned
    }
}

/// Sheet status from its areas.
pub fn derive_sheet_status(areas: &[StocktakingAreaStatus]) -> StocktakingSheetStatus {
    if !areas.is_empty() && areas.iter().all(|s| *s == StocktakingAreaStatus::Pending) {
        StocktakingSheetStatus::PendingApproval
    } else if areas.iter().any(|s| *s != StocktakingAreaStatus::Assigned) {
        StocktakingSheetStatus::InProgress
    } else {
        StocktakingSheetStatus::Assigned
    }
}

/// Sheet status right after the snapshot, before anything was counted.
///
/// Areas without locations are already `Pending`; the sheet only waits for
/// approval when every area is.
pub fn initial_sheet_status(areas: &[StocktakingAreaStatus]) -> StocktakingSheetStatus {
    match derive_sheet_status(areas) {
        StocktakingSheetStatus::PendingApproval => StocktakingSheetStatus::PendingApproval,
        _ => StocktakingSheetStatus::Assigned,
    }
}

/// What a rollup changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupOutcome {
    pub sheet_id: Uuid,
    pub area_status: StocktakingAreaStatus,
    pub sheet_status: StocktakingSheetStatus,
    /// Previous sheet status when the sheet moved.
    pub sheet_changed_from: Option<StocktakingSheetStatus>,
}

/// Recomputes every area of the sheet above a stocktaking location, then the
/// sheet itself.
pub async fn rollup_from_location<C: ConnectionTrait>(
    conn: &C,
    stocktaking_location_id: Uuid,
) -> Result<RollupOutcome, ServiceError> {
    let location = stocktaking_location::Entity::find_by_id(stocktaking_location_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "Stocktaking location {} not found",
                stocktaking_location_id
            ))
        })?;

    let area = stocktaking_area::Entity::find_by_id(location.stocktaking_area_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "Stocktaking area {} not found",
                location.stocktaking_area_id
            ))
        })?;

    let sheet_id = area.sheet_id;
    let written_area_id = area.id;

    let sheet = stocktaking_sheet::Entity::find_by_id(sheet_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Stocktaking sheet {} not found", sheet_id)))?;

    let areas = stocktaking_area::Entity::find()
        .filter(stocktaking_area::Column::SheetId.eq(sheet_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut area_status = area.status;
    let mut area_statuses = Vec::with_capacity(areas.len());
    for sibling in areas {
        let is_written = sibling.id == written_area_id;
        let status = refresh_area(conn, sibling).await?;
        if is_written {
            area_status = status;
        }
        area_statuses.push(status);
    }

    let old_status = sheet.status;
    let derived = derive_sheet_status(&area_statuses);

    let sheet_changed_from = if !old_status.is_terminal() && derived != old_status {
        let mut active: stocktaking_sheet::ActiveModel = sheet.into();
        active.status = Set(derived);
        active.update(conn).await.map_err(ServiceError::db_error)?;
        debug!(
            sheet_id = %sheet_id,
            from = old_status.as_str(),
            to = derived.as_str(),
            "Stocktaking sheet status rolled up"
        );
        Some(old_status)
    } else {
        None
    };

    Ok(RollupOutcome {
        sheet_id,
        area_status,
        sheet_status: if sheet_changed_from.is_some() {
            derived
        } else {
            old_status
        },
        sheet_changed_from,
    })
}

/// Writes the derived status of one area and returns it.
async fn refresh_area<C: ConnectionTrait>(
    conn: &C,
    area: stocktaking_area::Model,
) -> Result<StocktakingAreaStatus, ServiceError> {
    let locations = stocktaking_location::Entity::find()
        .filter(stocktaking_location::Column::StocktakingAreaId.eq(area.id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let location_ids: Vec<Uuid> = locations.iter().map(|l| l.id).collect();
    let counting_started = if location_ids.is_empty() {
        false
    } else {
        stocktaking_pallet::Entity::find()
            .filter(stocktaking_pallet::Column::StocktakingLocationId.is_in(location_ids))
            .filter(stocktaking_pallet::Column::Status.ne(StocktakingPalletStatus::Unchecked))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .is_some()
    };

    let statuses: Vec<StocktakingLocationStatus> = locations.iter().map(|l| l.status).collect();
    let derived = derive_area_status(&statuses, counting_started);

    if derived != area.status {
        let mut active: stocktaking_area::ActiveModel = area.into();
        active.status = Set(derived);
        active.update(conn).await.map_err(ServiceError::db_error)?;
    }
    Ok(derived)
}
