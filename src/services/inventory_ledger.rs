//! Inventory ledger
//!
//! Append-only running balance per (goods, packing) pair. Every movement of
//! stock writes exactly one row per pair and source event:
//!
//! `balance_after(n) = balance_after(n - 1) + in - out + stocktaking_change`
//!
//! Appends are idempotent per source: a second call for the same event returns
//! the rows written by the first one.

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::{
    disposal_note, disposal_note_detail, goods_issue_note, goods_issue_note_detail,
    goods_receipt_note, goods_receipt_note_detail,
    inventory_ledger::{self, Entity as LedgerEntity, LedgerSourceType},
    pallet::{self, PalletStatus},
    pick_allocation::{self, PickAllocationStatus},
};
use crate::errors::ServiceError;

/// The business event a ledger row is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerSource {
    pub source_type: LedgerSourceType,
    pub source_id: Uuid,
}

impl LedgerSource {
    pub fn new(source_type: LedgerSourceType, source_id: Uuid) -> Self {
        Self {
            source_type,
            source_id,
        }
    }
}

/// Signed change of one (goods, packing) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub goods_id: Uuid,
    pub goods_packing_id: Uuid,
    pub in_quantity: i32,
    pub out_quantity: i32,
    pub stocktaking_change: i32,
}

impl StockMovement {
    pub fn inbound(goods_id: Uuid, goods_packing_id: Uuid, quantity: i32) -> Self {
        Self {
            goods_id,
            goods_packing_id,
            in_quantity: quantity,
            out_quantity: 0,
            stocktaking_change: 0,
        }
    }

    pub fn outbound(goods_id: Uuid, goods_packing_id: Uuid, quantity: i32) -> Self {
        Self {
            goods_id,
            goods_packing_id,
            in_quantity: 0,
            out_quantity: quantity,
            stocktaking_change: 0,
        }
    }

    pub fn adjustment(goods_id: Uuid, goods_packing_id: Uuid, change: i32) -> Self {
        Self {
            goods_id,
            goods_packing_id,
            in_quantity: 0,
            out_quantity: 0,
            stocktaking_change: change,
        }
    }

    pub fn net(&self) -> i32 {
        self.in_quantity - self.out_quantity + self.stocktaking_change
    }

    fn is_empty(&self) -> bool {
        self.in_quantity == 0 && self.out_quantity == 0 && self.stocktaking_change == 0
    }
}

/// Merges movements of the same pair, keeping first-seen order. A pair is
/// dropped only when its in, out and stocktaking totals are all zero; in 5 and
/// out 5 still yields a row.
pub fn aggregate_movements(movements: &[StockMovement]) -> Vec<StockMovement> {
    let mut order: Vec<(Uuid, Uuid)> = Vec::new();
    let mut merged: HashMap<(Uuid, Uuid), StockMovement> = HashMap::new();

    for m in movements {
        let key = (m.goods_id, m.goods_packing_id);
        match merged.get_mut(&key) {
            Some(acc) => {
                acc.in_quantity += m.in_quantity;
                acc.out_quantity += m.out_quantity;
                acc.stocktaking_change += m.stocktaking_change;
            }
            None => {
                order.push(key);
                merged.insert(key, *m);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .filter(|m| !m.is_empty())
        .collect()
}

/// Sequence and balance of the row that follows `previous`.
pub fn next_position(previous: Option<&inventory_ledger::Model>, movement: &StockMovement) -> (i32, i32) {
    match previous {
        Some(last) => (last.sequence + 1, last.balance_after + movement.net()),
        None => (1, movement.net()),
    }
}

/// Sequence of the first row breaking the running balance, if any.
///
/// Rows must be ordered by sequence.
pub fn find_chain_break(entries: &[inventory_ledger::Model]) -> Option<i32> {
    let mut balance = 0;
    for (idx, entry) in entries.iter().enumerate() {
        let expected_sequence = idx as i32 + 1;
        if entry.sequence != expected_sequence || entry.balance_after != balance + entry.net_change() {
            return Some(entry.sequence);
        }
        balance = entry.balance_after;
    }
    None
}

/// Most recent ledger row of a pair.
pub async fn latest_entry<C: ConnectionTrait>(
    conn: &C,
    goods_id: Uuid,
    goods_packing_id: Uuid,
) -> Result<Option<inventory_ledger::Model>, ServiceError> {
    LedgerEntity::find()
        .filter(inventory_ledger::Column::GoodsId.eq(goods_id))
        .filter(inventory_ledger::Column::GoodsPackingId.eq(goods_packing_id))
        .order_by_desc(inventory_ledger::Column::Sequence)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Rows already written for a source event.
pub async fn entries_for_source<C: ConnectionTrait>(
    conn: &C,
    source: LedgerSource,
) -> Result<Vec<inventory_ledger::Model>, ServiceError> {
    LedgerEntity::find()
        .filter(inventory_ledger::Column::SourceType.eq(source.source_type))
        .filter(inventory_ledger::Column::SourceId.eq(source.source_id))
        .order_by_asc(inventory_ledger::Column::CreatedAt)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Appends one row per pair for `source`.
///
/// Must run inside the unit of work that applied the stock change.
pub async fn append_entries<C: ConnectionTrait>(
    conn: &C,
    source: LedgerSource,
    event_date: DateTime<Utc>,
    movements: &[StockMovement],
) -> Result<Vec<inventory_ledger::Model>, ServiceError> {
    let existing = entries_for_source(conn, source).await?;
    if !existing.is_empty() {
        info!(
            source_type = source.source_type.as_str(),
            source_id = %source.source_id,
            entries = existing.len(),
            "Ledger already written for source, skipping"
        );
        return Ok(existing);
    }

    let now = Utc::now();
    let mut written = Vec::new();
    for movement in aggregate_movements(movements) {
        let previous = latest_entry(conn, movement.goods_id, movement.goods_packing_id).await?;
        let (sequence, balance_after) = next_position(previous.as_ref(), &movement);

        if balance_after < 0 {
            warn!(
                goods_id = %movement.goods_id,
                goods_packing_id = %movement.goods_packing_id,
                balance_after,
                "Ledger balance went negative"
            );
        }

        let row = inventory_ledger::ActiveModel {
            id: Set(Uuid::new_v4()),
            goods_id: Set(movement.goods_id),
            goods_packing_id: Set(movement.goods_packing_id),
            sequence: Set(sequence),
            event_date: Set(event_date),
            in_quantity: Set(movement.in_quantity),
            out_quantity: Set(movement.out_quantity),
            stocktaking_change: Set(movement.stocktaking_change),
            balance_after: Set(balance_after),
            source_type: Set(source.source_type),
            source_id: Set(source.source_id),
            created_at: Set(now),
        };
        written.push(row.insert(conn).await.map_err(ServiceError::db_error)?);
    }

    counter!("inventory.ledger.entries_appended", written.len() as u64);
    Ok(written)
}

/// Ledger rows for a completed goods receipt.
pub async fn create_inventory_ledger_by_goods_receipt<C: ConnectionTrait>(
    conn: &C,
    note_id: Uuid,
    event_date: DateTime<Utc>,
) -> Result<Vec<inventory_ledger::Model>, ServiceError> {
    goods_receipt_note::Entity::find_by_id(note_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Goods receipt note {} not found", note_id)))?;

    let movements: Vec<StockMovement> = goods_receipt_note_detail::Entity::find()
        .filter(goods_receipt_note_detail::Column::NoteId.eq(note_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|d| StockMovement::inbound(d.goods_id, d.goods_packing_id, d.package_quantity))
        .collect();

    append_entries(
        conn,
        LedgerSource::new(LedgerSourceType::GoodsReceipt, note_id),
        event_date,
        &movements,
    )
    .await
}

/// Ledger rows for a completed goods issue, from its fulfilled allocations.
pub async fn create_inventory_ledger_by_goods_issue<C: ConnectionTrait>(
    conn: &C,
    note_id: Uuid,
    event_date: DateTime<Utc>,
) -> Result<Vec<inventory_ledger::Model>, ServiceError> {
    goods_issue_note::Entity::find_by_id(note_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Goods issue note {} not found", note_id)))?;

    let details = goods_issue_note_detail::Entity::find()
        .filter(goods_issue_note_detail::Column::NoteId.eq(note_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut movements = Vec::with_capacity(details.len());
    for detail in details {
        let fulfilled = fulfilled_quantity(
            conn,
            pick_allocation::Column::GoodsIssueNoteDetailId,
            detail.id,
        )
        .await?;
        movements.push(StockMovement::outbound(
            detail.goods_id,
            detail.goods_packing_id,
            fulfilled,
        ));
    }

    append_entries(
        conn,
        LedgerSource::new(LedgerSourceType::GoodsIssue, note_id),
        event_date,
        &movements,
    )
    .await
}

/// Ledger rows for an approved disposal note, from its fulfilled allocations.
pub async fn create_inventory_ledger_by_disposal_note<C: ConnectionTrait>(
    conn: &C,
    note_id: Uuid,
    event_date: DateTime<Utc>,
) -> Result<Vec<inventory_ledger::Model>, ServiceError> {
    disposal_note::Entity::find_by_id(note_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Disposal note {} not found", note_id)))?;

    let details = disposal_note_detail::Entity::find()
        .filter(disposal_note_detail::Column::NoteId.eq(note_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut movements = Vec::with_capacity(details.len());
    for detail in details {
        let fulfilled = fulfilled_quantity(
            conn,
            pick_allocation::Column::DisposalNoteDetailId,
            detail.id,
        )
        .await?;
        movements.push(StockMovement::outbound(
            detail.goods_id,
            detail.goods_packing_id,
            fulfilled,
        ));
    }

    append_entries(
        conn,
        LedgerSource::new(LedgerSourceType::Disposal, note_id),
        event_date,
        &movements,
    )
    .await
}

/// Ledger rows for an approved stocktaking sheet.
///
/// The adjustments are computed at approval time against the live pallet
/// quantities, so the caller passes them in.
pub async fn create_inventory_ledger_by_stocktaking_sheet<C: ConnectionTrait>(
    conn: &C,
    sheet_id: Uuid,
    adjustments: &[StockMovement],
    event_date: DateTime<Utc>,
) -> Result<Vec<inventory_ledger::Model>, ServiceError> {
    append_entries(
        conn,
        LedgerSource::new(LedgerSourceType::Stocktaking, sheet_id),
        event_date,
        adjustments,
    )
    .await
}

async fn fulfilled_quantity<C: ConnectionTrait>(
    conn: &C,
    owner_column: pick_allocation::Column,
    detail_id: Uuid,
) -> Result<i32, ServiceError> {
    let allocations = pick_allocation::Entity::find()
        .filter(owner_column.eq(detail_id))
        .filter(pick_allocation::Column::Status.eq(PickAllocationStatus::Fulfilled))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(allocations.iter().map(|a| a.package_quantity).sum())
}

/// Result of checking a pair's chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    pub entries: usize,
    pub balance: i32,
    pub first_break: Option<i32>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Ledger balance against the stock physically on pallets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    pub goods_id: Uuid,
    pub goods_packing_id: Uuid,
    pub ledger_balance: i32,
    pub on_hand: i32,
}

impl Reconciliation {
    pub fn difference(&self) -> i32 {
        self.on_hand - self.ledger_balance
    }
}

/// Read side of the ledger.
#[derive(Clone)]
pub struct InventoryLedgerService {
    db_pool: Arc<DatabaseConnection>,
}

impl InventoryLedgerService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    /// Current balance of a pair, zero when it never moved.
    pub async fn latest_balance(
        &self,
        goods_id: Uuid,
        goods_packing_id: Uuid,
    ) -> Result<i32, ServiceError> {
        Ok(latest_entry(&*self.db_pool, goods_id, goods_packing_id)
            .await?
            .map(|e| e.balance_after)
            .unwrap_or(0))
    }

    pub async fn history(
        &self,
        goods_id: Uuid,
        goods_packing_id: Uuid,
    ) -> Result<Vec<inventory_ledger::Model>, ServiceError> {
        LedgerEntity::find()
            .filter(inventory_ledger::Column::GoodsId.eq(goods_id))
            .filter(inventory_ledger::Column::GoodsPackingId.eq(goods_packing_id))
            .order_by_asc(inventory_ledger::Column::Sequence)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn verify_chain(
        &self,
        goods_id: Uuid,
        goods_packing_id: Uuid,
    ) -> Result<ChainReport, ServiceError> {
        let entries = self.history(goods_id, goods_packing_id).await?;
        let first_break = find_chain_break(&entries);
        if let Some(sequence) = first_break {
            warn!(
                goods_id = %goods_id,
                goods_packing_id = %goods_packing_id,
                sequence,
                "Ledger chain is broken"
            );
        }
        Ok(ChainReport {
            entries: entries.len(),
            balance: entries.last().map(|e| e.balance_after).unwrap_or(0),
            first_break,
        })
    }

    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        goods_id: Uuid,
        goods_packing_id: Uuid,
    ) -> Result<Reconciliation, ServiceError> {
        let ledger_balance = self.latest_balance(goods_id, goods_packing_id).await?;
        let on_hand: i32 = pallet::Entity::find()
            .filter(pallet::Column::GoodsPackingId.eq(goods_packing_id))
            .filter(pallet::Column::Status.ne(PalletStatus::Deleted))
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .iter()
            .map(|p| p.package_quantity)
            .sum();

        Ok(Reconciliation {
            goods_id,
            goods_packing_id,
            ledger_balance,
            on_hand,
        })
    }
}
