use chrono::{NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::db::UnitOfWork;
use crate::entities::{
    goods_issue_note::{self, GoodsIssueStatus},
    goods_issue_note_detail,
    pick_allocation::{self, PickAllocationStatus},
    warehouse,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::goods_label;
use crate::services::inventory_ledger::create_inventory_ledger_by_goods_issue;
use crate::services::notifications::{entity_types, notify_or_log, NotificationService};
use crate::services::pallets::{deduct_package_quantity, depletion_event};
use crate::services::pick_allocation::{
    allocate_fresh_for_issue, allocations_for_issue_details, committed_quantities,
    insert_allocations, record_planned, set_allocation_status, AllocationOwner,
    AllocationRequest,
};
use crate::services::stocktaking::ensure_no_stocktaking_in_progress;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IssueLineInput {
    pub goods_id: Uuid,
    pub goods_packing_id: Uuid,
    #[validate(range(min = 1))]
    pub package_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateGoodsIssueInput {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub warehouse_id: Uuid,
    pub requested_by: Uuid,
    #[validate(length(min = 1))]
    pub lines: Vec<IssueLineInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueLine {
    pub detail: goods_issue_note_detail::Model,
    pub allocations: Vec<pick_allocation::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodsIssueView {
    pub note: goods_issue_note::Model,
    pub lines: Vec<IssueLine>,
}

#[derive(Clone)]
pub struct GoodsIssueService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
    notifier: Arc<dyn NotificationService>,
}

impl GoodsIssueService {
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

    /// Opens an issue note with FEFO allocations over unexpired pallets.
    #[instrument(skip(self, input), fields(code = %input.code, warehouse_id = %input.warehouse_id))]
    pub async fn create_note(
        &self,
        input: CreateGoodsIssueInput,
        today: NaiveDate,
    ) -> Result<GoodsIssueView, ServiceError> {
        input.validate()?;
        for line in &input.lines {
            line.validate()?;
        }
        let mut pairs = HashSet::new();
        if !input
            .lines
            .iter()
            .all(|l| pairs.insert((l.goods_id, l.goods_packing_id)))
        {
            return Err(ServiceError::ValidationError(
                "Each goods packing may appear only once per issue note".to_string(),
            ));
        }

        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        ensure_no_stocktaking_in_progress(uow.conn(), input.warehouse_id).await?;
        warehouse::Entity::find_by_id(input.warehouse_id)
            .one(uow.conn())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Warehouse {} not found", input.warehouse_id))
            })?;

        let note = goods_issue_note::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(input.code.clone()),
            warehouse_id: Set(input.warehouse_id),
            status: Set(GoodsIssueStatus::Picking),
            requested_by: Set(input.requested_by),
            completed_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(uow.conn())
        .await
        .map_err(ServiceError::db_error)?;

        let mut committed = committed_quantities(uow.conn(), input.warehouse_id).await?;
        let mut lines = Vec::with_capacity(input.lines.len());
        for line in &input.lines {
            let label = goods_label(uow.conn(), line.goods_id, line.goods_packing_id).await?;
            let detail = goods_issue_note_detail::ActiveModel {
                id: Set(Uuid::new_v4()),
                note_id: Set(note.id),
                goods_id: Set(line.goods_id),
                goods_packing_id: Set(line.goods_packing_id),
                package_quantity: Set(line.package_quantity),
            }
            .insert(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

            let request = AllocationRequest {
                warehouse_id: input.warehouse_id,
                goods_id: line.goods_id,
                goods_packing_id: line.goods_packing_id,
                required: line.package_quantity,
                goods_label: &label,
            };
            let picks = allocate_fresh_for_issue(uow.conn(), &request, &committed, today).await?;
            record_planned(&mut committed, &picks);
            let allocations = insert_allocations(
                uow.conn(),
                AllocationOwner::GoodsIssueDetail(detail.id),
                &picks,
            )
            .await?;
            lines.push(IssueLine {
                detail,
                allocations,
            });
        }

        let allocation_count: usize = lines.iter().map(|l| l.allocations.len()).sum();
        uow.record(Event::GoodsIssueCreated {
            note_id: note.id,
            allocations: allocation_count,
        });
        uow.commit(&self.event_sender).await?;

        counter!("goods_issues.created", 1);
        info!(note_id = %note.id, allocations = allocation_count, "Goods issue created");
        Ok(GoodsIssueView { note, lines })
    }

    /// Ships a picked note: deducts every allocation and books the ledger.
    #[instrument(skip(self))]
    pub async fn complete_note(
        &self,
        note_id: Uuid,
    ) -> Result<goods_issue_note::Model, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        let note = find_note(uow.conn(), note_id).await?;
        ensure_no_stocktaking_in_progress(uow.conn(), note.warehouse_id).await?;
        if note.status != GoodsIssueStatus::Picked {
            return Err(ServiceError::InvalidOperation(format!(
                "Goods issue {} must be picked before completion, it is {:?}",
                note.code, note.status
            )));
        }

        let ids = detail_ids(uow.conn(), note_id).await?;
        let allocations = allocations_for_issue_details(uow.conn(), ids).await?;
        for allocation in &allocations {
            let change =
                deduct_package_quantity(uow.conn(), allocation.pallet_id, allocation.package_quantity)
                    .await?;
            if let Some(event) = depletion_event(&change) {
                uow.record(event);
            }
        }
        set_allocation_status(uow.conn(), &allocations, PickAllocationStatus::Fulfilled).await?;

        let now = Utc::now();
        let requested_by = note.requested_by;
        let mut active: goods_issue_note::ActiveModel = note.into();
        active.status = Set(GoodsIssueStatus::Completed);
        active.completed_at = Set(Some(now));
        let completed = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        let entries = create_inventory_ledger_by_goods_issue(uow.conn(), note_id, now).await?;

        uow.record(Event::GoodsIssued { note_id });
        uow.record(Event::LedgerEntriesAppended {
            source_type: "GoodsIssue".to_string(),
            source_id: note_id,
            entries: entries.len(),
        });
        uow.commit(&self.event_sender).await?;

        notify_or_log(
            self.notifier.as_ref(),
            requested_by,
            note_id,
            entity_types::GOODS_ISSUE_NOTE,
            &format!("Goods issue {} was shipped", completed.code),
        )
        .await;

        counter!("goods_issues.completed", 1);
        Ok(completed)
    }

    /// Cancels an unshipped note and frees its allocations.
    #[instrument(skip(self))]
    pub async fn cancel_note(&self, note_id: Uuid) -> Result<goods_issue_note::Model, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        let note = find_note(uow.conn(), note_id).await?;
        if !matches!(note.status, GoodsIssueStatus::Picking | GoodsIssueStatus::Picked) {
            return Err(ServiceError::InvalidOperation(format!(
                "Goods issue {} is {:?} and cannot be cancelled",
                note.code, note.status
            )));
        }

        let ids = detail_ids(uow.conn(), note_id).await?;
        let allocations = allocations_for_issue_details(uow.conn(), ids).await?;
        set_allocation_status(uow.conn(), &allocations, PickAllocationStatus::Cancelled).await?;

        let mut active: goods_issue_note::ActiveModel = note.into();
        active.status = Set(GoodsIssueStatus::Cancelled);
        let cancelled = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        uow.record(Event::GoodsIssueCancelled { note_id });
        uow.commit(&self.event_sender).await?;
        Ok(cancelled)
    }

    pub async fn get_note(&self, note_id: Uuid) -> Result<GoodsIssueView, ServiceError> {
        let db = &*self.db_pool;
        let note = find_note(db, note_id).await?;
        let details = goods_issue_note_detail::Entity::find()
            .filter(goods_issue_note_detail::Column::NoteId.eq(note_id))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut lines = Vec::with_capacity(details.len());
        for detail in details {
            let allocations = pick_allocation::Entity::find()
                .filter(pick_allocation::Column::GoodsIssueNoteDetailId.eq(detail.id))
                .all(db)
                .await
                .map_err(ServiceError::db_error)?;
            lines.push(IssueLine {
                detail,
                allocations,
            });
        }
        Ok(GoodsIssueView { note, lines })
    }
}

async fn find_note<C: ConnectionTrait>(
    conn: &C,
    note_id: Uuid,
) -> Result<goods_issue_note::Model, ServiceError> {
    goods_issue_note::Entity::find_by_id(note_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Goods issue note {} not found", note_id)))
}

async fn detail_ids<C: ConnectionTrait>(conn: &C, note_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
    Ok(goods_issue_note_detail::Entity::find()
        .filter(goods_issue_note_detail::Column::NoteId.eq(note_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|d| d.id)
        .collect())
}
