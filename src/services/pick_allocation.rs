//! Pick allocation
//!
//! FEFO (first-expired-first-out) selection of pallets for disposal and goods
//! issue, and the scan step that confirms a picker took the right pallet.
//!
//! Allocating never touches `pallets.package_quantity`. Quantities are only
//! deducted when the owning document is approved or completed.

use chrono::{NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::entities::{
    batch,
    disposal_note::{self, DisposalNoteStatus},
    disposal_note_detail::{self, DisposalDetailStatus},
    goods_issue_note::{self, GoodsIssueStatus},
    goods_issue_note_detail,
    pallet::{self, PalletStatus},
    pick_allocation::{self, Entity as PickAllocationEntity, PickAllocationStatus},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// A pallet that may satisfy an allocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePallet {
    pub pallet_id: Uuid,
    pub pallet_code: String,
    pub expiry_date: NaiveDate,
    pub on_hand: i32,
}

/// Quantity to take from one pallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPick {
    pub pallet_id: Uuid,
    pub quantity: i32,
}

/// Which stock a request may draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockAge {
    /// `expiry_date < today`
    Expired,
    /// `expiry_date >= today`
    Fresh,
}

#[derive(Debug, Clone)]
pub struct AllocationRequest<'a> {
    pub warehouse_id: Uuid,
    pub goods_id: Uuid,
    pub goods_packing_id: Uuid,
    pub required: i32,
    /// Used in the shortage message.
    pub goods_label: &'a str,
}

/// The document line an allocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOwner {
    DisposalDetail(Uuid),
    GoodsIssueDetail(Uuid),
}

/// Plans which pallets satisfy `required` packages.
///
/// Each candidate offers `on_hand - committed`; candidates with nothing left
/// are ignored. The rest are ordered by expiry date, then by smallest
/// available quantity, then by pallet code, and consumed greedily.
pub fn plan_fefo_allocation(
    candidates: &[CandidatePallet],
    committed: &HashMap<Uuid, i32>,
    required: i32,
    goods_label: &str,
) -> Result<Vec<PlannedPick>, ServiceError> {
    if required <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "Requested quantity for {} must be positive",
            goods_label
        )));
    }

    let mut available: Vec<(&CandidatePallet, i32)> = candidates
        .iter()
        .map(|c| {
            let reserved = committed.get(&c.pallet_id).copied().unwrap_or(0);
            (c, c.on_hand - reserved)
        })
        .filter(|(_, free)| *free > 0)
        .collect();

    if available.is_empty() {
        return Err(ServiceError::InsufficientStock(format!(
            "No eligible pallets for {}",
            goods_label
        )));
    }

    let total: i64 = available.iter().map(|(_, free)| i64::from(*free)).sum();
    if total < i64::from(required) {
        return Err(ServiceError::InsufficientStock(format!(
            "{} has {} packages available, {} requested",
            goods_label, total, required
        )));
    }

    available.sort_by(|(a, a_free), (b, b_free)| {
        a.expiry_date
            .cmp(&b.expiry_date)
            .then(a_free.cmp(b_free))
            .then_with(|| a.pallet_code.cmp(&b.pallet_code))
    });

    let mut remaining = required;
    let mut picks = Vec::new();
    for (candidate, free) in available {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(free);
        picks.push(PlannedPick {
            pallet_id: candidate.pallet_id,
            quantity: take,
        });
        remaining -= take;
    }

    Ok(picks)
}

/// Adds planned picks to a committed map so later requests in the same unit
/// see them.
pub fn record_planned(committed: &mut HashMap<Uuid, i32>, picks: &[PlannedPick]) {
    for pick in picks {
        *committed.entry(pick.pallet_id).or_insert(0) += pick.quantity;
    }
}

/// Quantities held by open (UnScanned or Scanned) allocations, keyed by pallet,
/// for every pallet of the warehouse.
pub async fn committed_quantities<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: Uuid,
) -> Result<HashMap<Uuid, i32>, ServiceError> {
    let pallet_ids: Vec<Uuid> = pallet::Entity::find()
        .filter(pallet::Column::WarehouseId.eq(warehouse_id))
        .filter(pallet::Column::Status.ne(PalletStatus::Deleted))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|p| p.id)
        .collect();

    if pallet_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let open = PickAllocationEntity::find()
        .filter(pick_allocation::Column::PalletId.is_in(pallet_ids))
        .filter(pick_allocation::Column::Status.is_in(PickAllocationStatus::committed()))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut committed = HashMap::new();
    for allocation in open {
        *committed.entry(allocation.pallet_id).or_insert(0) += allocation.package_quantity;
    }
    Ok(committed)
}

/// Active pallets of the requested packing holding stock of the given age.
pub async fn load_candidates<C: ConnectionTrait>(
    conn: &C,
    request: &AllocationRequest<'_>,
    age: StockAge,
    today: NaiveDate,
) -> Result<Vec<CandidatePallet>, ServiceError> {
    let expiry_filter = match age {
        StockAge::Expired => batch::Column::ExpiryDate.lt(today),
        StockAge::Fresh => batch::Column::ExpiryDate.gte(today),
    };

    let rows = pallet::Entity::find()
        .find_also_related(batch::Entity)
        .filter(pallet::Column::WarehouseId.eq(request.warehouse_id))
        .filter(pallet::Column::GoodsPackingId.eq(request.goods_packing_id))
        .filter(pallet::Column::Status.eq(PalletStatus::Active))
        .filter(pallet::Column::PackageQuantity.gt(0))
        .filter(batch::Column::GoodsId.eq(request.goods_id))
        .filter(expiry_filter)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(rows
        .into_iter()
        .filter_map(|(p, b)| {
            b.map(|b| CandidatePallet {
                pallet_id: p.id,
                pallet_code: p.code,
                expiry_date: b.expiry_date,
                on_hand: p.package_quantity,
            })
        })
        .collect())
}

/// FEFO over expired pallets, for disposal.
pub async fn allocate_expired_for_disposal<C: ConnectionTrait>(
    conn: &C,
    request: &AllocationRequest<'_>,
    committed: &HashMap<Uuid, i32>,
    today: NaiveDate,
) -> Result<Vec<PlannedPick>, ServiceError> {
    let candidates = load_candidates(conn, request, StockAge::Expired, today).await?;
    debug!(
        goods_packing_id = %request.goods_packing_id,
        candidates = candidates.len(),
        "Loaded expired pallets for disposal"
    );
    plan_fefo_allocation(&candidates, committed, request.required, request.goods_label)
}

/// FEFO over pallets still within their shelf life, for goods issue.
pub async fn allocate_fresh_for_issue<C: ConnectionTrait>(
    conn: &C,
    request: &AllocationRequest<'_>,
    committed: &HashMap<Uuid, i32>,
    today: NaiveDate,
) -> Result<Vec<PlannedPick>, ServiceError> {
    let candidates = load_candidates(conn, request, StockAge::Fresh, today).await?;
    plan_fefo_allocation(&candidates, committed, request.required, request.goods_label)
}

/// Persists planned picks as `UnScanned` allocations of `owner`.
pub async fn insert_allocations<C: ConnectionTrait>(
    conn: &C,
    owner: AllocationOwner,
    picks: &[PlannedPick],
) -> Result<Vec<pick_allocation::Model>, ServiceError> {
    let (disposal_detail, issue_detail) = match owner {
        AllocationOwner::DisposalDetail(id) => (Some(id), None),
        AllocationOwner::GoodsIssueDetail(id) => (None, Some(id)),
    };

    let now = Utc::now();
    let mut saved = Vec::with_capacity(picks.len());
    for pick in picks {
        let row = pick_allocation::ActiveModel {
            id: Set(Uuid::new_v4()),
            disposal_note_detail_id: Set(disposal_detail),
            goods_issue_note_detail_id: Set(issue_detail),
            pallet_id: Set(pick.pallet_id),
            package_quantity: Set(pick.quantity),
            status: Set(PickAllocationStatus::UnScanned),
            scanned_at: Set(None),
            created_at: Set(now),
        };
        saved.push(row.insert(conn).await.map_err(ServiceError::db_error)?);
    }

    counter!("allocations.created", saved.len() as u64);
    Ok(saved)
}

/// Open allocations of a set of disposal details.
pub async fn allocations_for_disposal_details<C: ConnectionTrait>(
    conn: &C,
    detail_ids: Vec<Uuid>,
) -> Result<Vec<pick_allocation::Model>, ServiceError> {
    PickAllocationEntity::find()
        .filter(pick_allocation::Column::DisposalNoteDetailId.is_in(detail_ids))
        .filter(pick_allocation::Column::Status.ne(PickAllocationStatus::Cancelled))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Open allocations of a set of goods issue details.
pub async fn allocations_for_issue_details<C: ConnectionTrait>(
    conn: &C,
    detail_ids: Vec<Uuid>,
) -> Result<Vec<pick_allocation::Model>, ServiceError> {
    PickAllocationEntity::find()
        .filter(pick_allocation::Column::GoodsIssueNoteDetailId.is_in(detail_ids))
        .filter(pick_allocation::Column::Status.ne(PickAllocationStatus::Cancelled))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Moves allocations to a new status.
pub async fn set_allocation_status<C: ConnectionTrait>(
    conn: &C,
    allocations: &[pick_allocation::Model],
    status: PickAllocationStatus,
) -> Result<(), ServiceError> {
    for allocation in allocations {
        let mut active: pick_allocation::ActiveModel = allocation.clone().into();
        active.status = Set(status);
        if status == PickAllocationStatus::UnScanned {
            active.scanned_at = Set(None);
        }
        active.update(conn).await.map_err(ServiceError::db_error)?;
    }
    Ok(())
}

/// Result of scanning a pallet for an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub allocation: pick_allocation::Model,
    /// Set when the scan finished the owning line or note.
    pub line_completed: bool,
}

/// Confirms picks on the floor.
#[derive(Clone)]
pub struct PickAllocationService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl PickAllocationService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Marks an allocation scanned once the picker's pallet code matches.
    ///
    /// A disposal detail becomes `Picked` when all its allocations are
    /// scanned; a goods issue note becomes `Picked` when all allocations of
    /// all its lines are scanned.
    #[instrument(skip(self))]
    pub async fn scan(
        &self,
        allocation_id: Uuid,
        pallet_code: &str,
    ) -> Result<ScanResult, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;

        let allocation = PickAllocationEntity::find_by_id(allocation_id)
            .one(uow.conn())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Pick allocation {} not found", allocation_id))
            })?;

        match allocation.status {
            PickAllocationStatus::UnScanned => {}
            PickAllocationStatus::Scanned => {
                return Err(ServiceError::Conflict(format!(
                    "Pick allocation {} was already scanned",
                    allocation_id
                )))
            }
            other => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Pick allocation {} is {:?} and cannot be scanned",
                    allocation_id, other
                )))
            }
        }

        let pallet = pallet::Entity::find_by_id(allocation.pallet_id)
            .one(uow.conn())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Pallet {} not found", allocation.pallet_id))
            })?;

        if pallet.code != pallet_code {
            return Err(ServiceError::ValidationError(format!(
                "Scanned pallet {} does not match allocated pallet {}",
                pallet_code, pallet.code
            )));
        }

        match (
            allocation.disposal_note_detail_id,
            allocation.goods_issue_note_detail_id,
        ) {
            (Some(detail_id), _) => ensure_disposal_line_picking(uow.conn(), detail_id).await?,
            (None, Some(detail_id)) => ensure_issue_note_picking(uow.conn(), detail_id).await?,
            (None, None) => {
                return Err(ServiceError::InternalError(format!(
                    "Pick allocation {} has no owner",
                    allocation_id
                )))
            }
        }

        let mut active: pick_allocation::ActiveModel = allocation.clone().into();
        active.status = Set(PickAllocationStatus::Scanned);
        active.scanned_at = Set(Some(Utc::now()));
        let scanned = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        let line_completed = match (
            scanned.disposal_note_detail_id,
            scanned.goods_issue_note_detail_id,
        ) {
            (Some(detail_id), _) => complete_disposal_line_if_scanned(uow.conn(), detail_id).await?,
            (None, Some(detail_id)) => complete_issue_note_if_scanned(uow.conn(), detail_id).await?,
            (None, None) => false,
        };

        uow.record(Event::PickAllocationScanned {
            allocation_id,
            pallet_id: scanned.pallet_id,
        });
        uow.commit(&self.event_sender).await?;

        counter!("allocations.scanned", 1);
        info!(
            allocation_id = %allocation_id,
            pallet_code,
            line_completed,
            "Pick allocation scanned"
        );

        Ok(ScanResult {
            allocation: scanned,
            line_completed,
        })
    }
}

async fn ensure_disposal_line_picking<C: ConnectionTrait>(
    conn: &C,
    detail_id: Uuid,
) -> Result<(), ServiceError> {
    let detail = disposal_note_detail::Entity::find_by_id(detail_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Disposal note detail {} not found", detail_id))
        })?;
    let note = disposal_note::Entity::find_by_id(detail.note_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Disposal note {} not found", detail.note_id))
        })?;

    if note.status != DisposalNoteStatus::Picking || detail.status != DisposalDetailStatus::Picking
    {
        return Err(ServiceError::InvalidOperation(format!(
            "Disposal note {} is not being picked",
            note.code
        )));
    }
    Ok(())
}

async fn ensure_issue_note_picking<C: ConnectionTrait>(
    conn: &C,
    detail_id: Uuid,
) -> Result<(), ServiceError> {
    let note = issue_note_for_detail(conn, detail_id).await?;
    if note.status != GoodsIssueStatus::Picking {
        return Err(ServiceError::InvalidOperation(format!(
            "Goods issue note {} is not being picked",
            note.code
        )));
    }
    Ok(())
}

async fn issue_note_for_detail<C: ConnectionTrait>(
    conn: &C,
    detail_id: Uuid,
) -> Result<goods_issue_note::Model, ServiceError> {
    let detail = goods_issue_note_detail::Entity::find_by_id(detail_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Goods issue detail {} not found", detail_id))
        })?;
    goods_issue_note::Entity::find_by_id(detail.note_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Goods issue note {} not found", detail.note_id)))
}

async fn complete_disposal_line_if_scanned<C: ConnectionTrait>(
    conn: &C,
    detail_id: Uuid,
) -> Result<bool, ServiceError> {
    let allocations = allocations_for_disposal_details(conn, vec![detail_id]).await?;
    if allocations
        .iter()
        .any(|a| a.status != PickAllocationStatus::Scanned)
    {
        return Ok(false);
    }

    let detail = disposal_note_detail::Entity::find_by_id(detail_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Disposal note detail {} not found", detail_id))
        })?;
    let mut active: disposal_note_detail::ActiveModel = detail.into();
    active.status = Set(DisposalDetailStatus::Picked);
    active.update(conn).await.map_err(ServiceError::db_error)?;
    Ok(true)
}

async fn complete_issue_note_if_scanned<C: ConnectionTrait>(
    conn: &C,
    detail_id: Uuid,
) -> Result<bool, ServiceError> {
    let note = issue_note_for_detail(conn, detail_id).await?;
    let detail_ids: Vec<Uuid> = goods_issue_note_detail::Entity::find()
        .filter(goods_issue_note_detail::Column::NoteId.eq(note.id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|d| d.id)
        .collect();

    let allocations = allocations_for_issue_details(conn, detail_ids).await?;
    if allocations
        .iter()
        .any(|a| a.status != PickAllocationStatus::Scanned)
    {
        return Ok(false);
    }

    let mut active: goods_issue_note::ActiveModel = note.into();
    active.status = Set(GoodsIssueStatus::Picked);
    active.update(conn).await.map_err(ServiceError::db_error)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn candidate(code: &str, expiry: NaiveDate, on_hand: i32) -> CandidatePallet {
        CandidatePallet {
            pallet_id: Uuid::new_v4(),
            pallet_code: code.to_string(),
            expiry_date: expiry,
            on_hand,
        }
    }

    #[test]
    fn earliest_expiry_is_drained_first() {
        let p1 = candidate("P1", date(2024, 1, 1), 100);
        let p2 = candidate("P2", date(2024, 2, 1), 80);
        let candidates = vec![p2.clone(), p1.clone()];

        let picks = plan_fefo_allocation(&candidates, &HashMap::new(), 150, "Milk 1L").unwrap();

        assert_eq!(
            picks,
            vec![
                PlannedPick {
                    pallet_id: p1.pallet_id,
                    quantity: 100
                },
                PlannedPick {
                    pallet_id: p2.pallet_id,
                    quantity: 50
                },
            ]
        );
    }

    #[test]
    fn same_expiry_prefers_smaller_remainder() {
        let big = candidate("A", date(2024, 1, 1), 90);
        let small = candidate("B", date(2024, 1, 1), 20);

        let picks = plan_fefo_allocation(
            &[big.clone(), small.clone()],
            &HashMap::new(),
            30,
            "Yogurt",
        )
        .unwrap();

        assert_eq!(picks[0].pallet_id, small.pallet_id);
        assert_eq!(picks[0].quantity, 20);
        assert_eq!(picks[1].pallet_id, big.pallet_id);
        assert_eq!(picks[1].quantity, 10);
    }

    #[test]
    fn committed_quantity_reduces_availability() {
        let p1 = candidate("P1", date(2024, 1, 1), 100);
        let p2 = candidate("P2", date(2024, 2, 1), 80);
        let mut committed = HashMap::new();
        committed.insert(p1.pallet_id, 70);

        let picks =
            plan_fefo_allocation(&[p1.clone(), p2.clone()], &committed, 50, "Milk 1L").unwrap();

        assert_eq!(picks[0].quantity, 30);
        assert_eq!(picks[1].quantity, 20);
    }

    #[test]
    fn fully_committed_pallets_are_skipped() {
        let p1 = candidate("P1", date(2024, 1, 1), 40);
        let mut committed = HashMap::new();
        committed.insert(p1.pallet_id, 40);

        let err = plan_fefo_allocation(&[p1], &committed, 10, "Butter").unwrap_err();
        assert_matches!(err, ServiceError::InsufficientStock(msg) if msg.contains("Butter"));
    }

    #[rstest]
    #[case(0)]
    #[case(-5)]
    fn non_positive_request_is_rejected(#[case] required: i32) {
        let p1 = candidate("P1", date(2024, 1, 1), 40);
        let err = plan_fefo_allocation(&[p1], &HashMap::new(), required, "Cream").unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[test]
    fn shortage_names_goods_and_totals() {
        let p1 = candidate("P1", date(2024, 1, 1), 40);
        let err = plan_fefo_allocation(&[p1], &HashMap::new(), 50, "Milk 1L").unwrap_err();
        assert_matches!(
            err,
            ServiceError::InsufficientStock(msg) if msg.contains("Milk 1L") && msg.contains("40")
        );
    }

    #[test]
    fn record_planned_accumulates() {
        let id = Uuid::new_v4();
        let mut committed = HashMap::new();
        record_planned(
            &mut committed,
            &[
                PlannedPick {
                    pallet_id: id,
                    quantity: 5,
                },
                PlannedPick {
                    pallet_id: id,
                    quantity: 7,
                },
            ],
        );
        assert_eq!(committed.get(&id), Some(&12));
    }
}
