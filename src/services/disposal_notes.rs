//! Disposal notes
//!
//! Removal of expired stock. A note walks
//! `Draft -> AssignedForPicking -> Picking -> PendingApproval -> Completed`;
//! a reviewer may send single lines back to picking before approving.
//!
//! Pallets are allocated when the note is created but only deducted on
//! approval, after a fresh on-hand check.

use chrono::{NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::UnitOfWork;
use crate::entities::{
    disposal_note::{self, DisposalNoteStatus, Entity as DisposalNoteEntity},
    disposal_note_detail::{self, DisposalDetailStatus},
    pick_allocation::{self, PickAllocationStatus},
    warehouse,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::goods_label;
use crate::services::inventory_ledger::create_inventory_ledger_by_disposal_note;
use crate::services::notifications::{entity_types, notify_or_log, NotificationService};
use crate::services::pallets::{deduct_package_quantity, depletion_event};
use crate::services::pick_allocation::{
    allocate_expired_for_disposal, allocations_for_disposal_details, committed_quantities,
    insert_allocations, record_planned, set_allocation_status, AllocationOwner,
    AllocationRequest,
};
use crate::services::stocktaking::ensure_no_stocktaking_in_progress;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DisposalLineInput {
    pub goods_id: Uuid,
    pub goods_packing_id: Uuid,
    #[validate(range(min = 1))]
    pub package_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateDisposalNoteInput {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub warehouse_id: Uuid,
    pub requested_by: Uuid,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    #[validate(length(min = 1))]
    pub lines: Vec<DisposalLineInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisposalLine {
    pub detail: disposal_note_detail::Model,
    pub allocations: Vec<pick_allocation::Model>,
}

impl DisposalLine {
    pub fn allocated_quantity(&self) -> i32 {
        self.allocations.iter().map(|a| a.package_quantity).sum()
    }
}

/// A note with its lines and their allocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisposalNoteView {
    pub note: disposal_note::Model,
    pub lines: Vec<DisposalLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisposalApproval {
    pub note: disposal_note::Model,
    pub pallets_depleted: usize,
    pub ledger_entries: usize,
}

#[derive(Clone)]
pub struct DisposalNoteService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
    notifier: Arc<dyn NotificationService>,
}

impl DisposalNoteService {
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

    /// Creates a draft note and allocates expired pallets to every line.
    ///
    /// A shortage on any line rolls back the whole note.
    #[instrument(skip(self, input), fields(code = %input.code, warehouse_id = %input.warehouse_id))]
    pub async fn create_disposal_note(
        &self,
        input: CreateDisposalNoteInput,
        today: NaiveDate,
    ) -> Result<DisposalNoteView, ServiceError> {
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
                "Each goods packing may appear only once per disposal note".to_string(),
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

        let now = Utc::now();
        let note = disposal_note::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(input.code.clone()),
            warehouse_id: Set(input.warehouse_id),
            status: Set(DisposalNoteStatus::Draft),
            reason: Set(input.reason.clone()),
            requested_by: Set(input.requested_by),
            assigned_to: Set(None),
            approved_by: Set(None),
            approved_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(uow.conn())
        .await
        .map_err(ServiceError::db_error)?;

        let mut committed = committed_quantities(uow.conn(), input.warehouse_id).await?;
        let mut lines = Vec::with_capacity(input.lines.len());

        for line in &input.lines {
            let label = goods_label(uow.conn(), line.goods_id, line.goods_packing_id).await?;

            let detail = disposal_note_detail::ActiveModel {
                id: Set(Uuid::new_v4()),
                note_id: Set(note.id),
                goods_id: Set(line.goods_id),
                goods_packing_id: Set(line.goods_packing_id),
                package_quantity: Set(line.package_quantity),
                status: Set(DisposalDetailStatus::Pending),
                rejection_reason: Set(None),
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
            let picks = allocate_expired_for_disposal(uow.conn(), &request, &committed, today)
                .await
                .map_err(|e| {
                    warn!(goods = %label, error = %e, "Disposal allocation failed");
                    e
                })?;
            record_planned(&mut committed, &picks);

            let allocations =
                insert_allocations(uow.conn(), AllocationOwner::DisposalDetail(detail.id), &picks)
                    .await?;
            lines.push(DisposalLine {
                detail,
                allocations,
            });
        }

        let allocation_count: usize = lines.iter().map(|l| l.allocations.len()).sum();
        uow.record(Event::DisposalNoteCreated {
            note_id: note.id,
            warehouse_id: note.warehouse_id,
            allocations: allocation_count,
        });
        uow.commit(&self.event_sender).await?;

        counter!("disposal.notes.created", 1);
        info!(
            note_id = %note.id,
            lines = lines.len(),
            allocations = allocation_count,
            "Disposal note created"
        );

        Ok(DisposalNoteView { note, lines })
    }

    /// Hands a draft note to a picker.
    #[instrument(skip(self))]
    pub async fn assign_for_picking(
        &self,
        note_id: Uuid,
        picker_id: Uuid,
    ) -> Result<disposal_note::Model, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        let note = find_note(uow.conn(), note_id).await?;
        let old_status = note.status;
        ensure_transition(&note, DisposalNoteStatus::AssignedForPicking)?;

        let mut active: disposal_note::ActiveModel = note.into();
        active.status = Set(DisposalNoteStatus::AssignedForPicking);
        active.assigned_to = Set(Some(picker_id));
        active.updated_at = Set(Utc::now());
        let updated = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        record_status_change(&mut uow, note_id, old_status, updated.status);
        uow.commit(&self.event_sender).await?;

        notify_or_log(
            self.notifier.as_ref(),
            picker_id,
            note_id,
            entity_types::DISPOSAL_NOTE,
            &format!("Disposal note {} is ready for picking", updated.code),
        )
        .await;
        Ok(updated)
    }

    /// Picker starts working on the note; every line goes to picking.
    #[instrument(skip(self))]
    pub async fn start_picking(&self, note_id: Uuid) -> Result<disposal_note::Model, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        let note = find_note(uow.conn(), note_id).await?;
        let old_status = note.status;
        ensure_transition(&note, DisposalNoteStatus::Picking)?;

        for detail in note_details(uow.conn(), note_id).await? {
            let mut active: disposal_note_detail::ActiveModel = detail.into();
            active.status = Set(DisposalDetailStatus::Picking);
            active
                .update(uow.conn())
                .await
                .map_err(ServiceError::db_error)?;
        }

        let updated = set_note_status(uow.conn(), note, DisposalNoteStatus::Picking).await?;
        record_status_change(&mut uow, note_id, old_status, updated.status);
        uow.commit(&self.event_sender).await?;
        Ok(updated)
    }

    /// Sends a fully picked note to the approver.
    #[instrument(skip(self))]
    pub async fn submit_for_approval(
        &self,
        note_id: Uuid,
    ) -> Result<disposal_note::Model, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        let note = find_note(uow.conn(), note_id).await?;
        let old_status = note.status;
        ensure_transition(&note, DisposalNoteStatus::PendingApproval)?;

        let unfinished = note_details(uow.conn(), note_id)
            .await?
            .into_iter()
            .filter(|d| d.status != DisposalDetailStatus::Picked)
            .count();
        if unfinished > 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "{} line(s) of disposal note {} are still being picked",
                unfinished, note.code
            )));
        }

        let requested_by = note.requested_by;
        let updated =
            set_note_status(uow.conn(), note, DisposalNoteStatus::PendingApproval).await?;
        record_status_change(&mut uow, note_id, old_status, updated.status);
        uow.commit(&self.event_sender).await?;

        notify_or_log(
            self.notifier.as_ref(),
            requested_by,
            note_id,
            entity_types::DISPOSAL_NOTE,
            &format!("Disposal note {} is waiting for approval", updated.code),
        )
        .await;
        Ok(updated)
    }

    /// Rejects a picked line: its allocations go back to unscanned and the
    /// line (and note) return to picking.
    #[instrument(skip(self))]
    pub async fn repick_detail(
        &self,
        detail_id: Uuid,
        reason: &str,
    ) -> Result<DisposalLine, ServiceError> {
        if reason.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "A reason is required to re-pick a line".to_string(),
            ));
        }

        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        let detail = disposal_note_detail::Entity::find_by_id(detail_id)
            .one(uow.conn())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Disposal note detail {} not found", detail_id))
            })?;
        let note = find_note(uow.conn(), detail.note_id).await?;

        let allowed = match note.status {
            DisposalNoteStatus::PendingApproval => true,
            DisposalNoteStatus::Picking => detail.status == DisposalDetailStatus::Picked,
            _ => false,
        };
        if !allowed {
            return Err(ServiceError::InvalidOperation(format!(
                "Line of disposal note {} cannot be re-picked while the note is {}",
                note.code,
                note.status.as_str()
            )));
        }

        let allocations = allocations_for_disposal_details(uow.conn(), vec![detail_id]).await?;
        set_allocation_status(uow.conn(), &allocations, PickAllocationStatus::UnScanned).await?;

        let mut active: disposal_note_detail::ActiveModel = detail.into();
        active.status = Set(DisposalDetailStatus::Picking);
        active.rejection_reason = Set(Some(reason.to_string()));
        let detail = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        let assigned_to = note.assigned_to;
        let note_id = note.id;
        let code = note.code.clone();
        if note.status == DisposalNoteStatus::PendingApproval {
            let old_status = note.status;
            let updated = set_note_status(uow.conn(), note, DisposalNoteStatus::Picking).await?;
            record_status_change(&mut uow, note_id, old_status, updated.status);
        }

        uow.record(Event::DisposalDetailRepicked {
            note_id,
            detail_id,
            reason: reason.to_string(),
        });
        uow.commit(&self.event_sender).await?;

        if let Some(picker) = assigned_to {
            notify_or_log(
                self.notifier.as_ref(),
                picker,
                note_id,
                entity_types::DISPOSAL_NOTE,
                &format!("A line of disposal note {} must be picked again: {}", code, reason),
            )
            .await;
        }

        counter!("disposal.lines.repicked", 1);
        let allocations = allocations_for_disposal_details(&*self.db_pool, vec![detail_id]).await?;
        Ok(DisposalLine {
            detail,
            allocations,
        })
    }

    /// Approves the note and removes the picked stock.
    ///
    /// Every allocation is checked against the pallet's quantity on hand now;
    /// a shortfall rolls back the whole approval without ledger rows.
    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        note_id: Uuid,
        approved_by: Uuid,
    ) -> Result<DisposalApproval, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        let note = find_note(uow.conn(), note_id).await?;
        ensure_no_stocktaking_in_progress(uow.conn(), note.warehouse_id).await?;
        let old_status = note.status;
        ensure_transition(&note, DisposalNoteStatus::Completed)?;

        let detail_ids: Vec<Uuid> = note_details(uow.conn(), note_id)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let allocations = allocations_for_disposal_details(uow.conn(), detail_ids).await?;
        if let Some(open) = allocations
            .iter()
            .find(|a| a.status != PickAllocationStatus::Scanned)
        {
            return Err(ServiceError::InvalidOperation(format!(
                "Pick allocation {} was not scanned",
                open.id
            )));
        }

        let mut pallets_depleted = 0;
        for allocation in &allocations {
            let change =
                deduct_package_quantity(uow.conn(), allocation.pallet_id, allocation.package_quantity)
                    .await
                    .map_err(|e| {
                        warn!(
                            note_id = %note_id,
                            pallet_id = %allocation.pallet_id,
                            error = %e,
                            "Disposal approval could not deduct pallet"
                        );
                        e
                    })?;
            if let Some(event) = depletion_event(&change) {
                pallets_depleted += 1;
                uow.record(event);
            }
        }
        set_allocation_status(uow.conn(), &allocations, PickAllocationStatus::Fulfilled).await?;

        let now = Utc::now();
        let requested_by = note.requested_by;
        let mut active: disposal_note::ActiveModel = note.into();
        active.status = Set(DisposalNoteStatus::Completed);
        active.approved_by = Set(Some(approved_by));
        active.approved_at = Set(Some(now));
        active.updated_at = Set(now);
        let completed = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        let entries = create_inventory_ledger_by_disposal_note(uow.conn(), note_id, now).await?;

        record_status_change(&mut uow, note_id, old_status, completed.status);
        uow.record(Event::DisposalNoteApproved {
            note_id,
            approved_by,
            pallets_depleted,
        });
        uow.record(Event::LedgerEntriesAppended {
            source_type: "Disposal".to_string(),
            source_id: note_id,
            entries: entries.len(),
        });
        uow.commit(&self.event_sender).await?;

        notify_or_log(
            self.notifier.as_ref(),
            requested_by,
            note_id,
            entity_types::DISPOSAL_NOTE,
            &format!("Disposal note {} was approved", completed.code),
        )
        .await;

        counter!("disposal.notes.approved", 1);
        info!(
            note_id = %note_id,
            pallets_depleted,
            ledger_entries = entries.len(),
            "Disposal note approved"
        );

        Ok(DisposalApproval {
            note: completed,
            pallets_depleted,
            ledger_entries: entries.len(),
        })
    }

    /// Cancels a note that has not been picked yet and frees its allocations.
    #[instrument(skip(self))]
    pub async fn cancel(&self, note_id: Uuid) -> Result<disposal_note::Model, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        let note = find_note(uow.conn(), note_id).await?;
        let old_status = note.status;
        ensure_transition(&note, DisposalNoteStatus::Cancelled)?;

        let detail_ids: Vec<Uuid> = note_details(uow.conn(), note_id)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let allocations = allocations_for_disposal_details(uow.conn(), detail_ids).await?;
        set_allocation_status(uow.conn(), &allocations, PickAllocationStatus::Cancelled).await?;

        let updated = set_note_status(uow.conn(), note, DisposalNoteStatus::Cancelled).await?;
        record_status_change(&mut uow, note_id, old_status, updated.status);
        uow.commit(&self.event_sender).await?;

        counter!("disposal.notes.cancelled", 1);
        Ok(updated)
    }

    pub async fn get_disposal_note(&self, note_id: Uuid) -> Result<DisposalNoteView, ServiceError> {
        let db = &*self.db_pool;
        let note = find_note(db, note_id).await?;

        let mut lines = Vec::new();
        for detail in note_details(db, note_id).await? {
            let allocations = pick_allocation::Entity::find()
                .filter(pick_allocation::Column::DisposalNoteDetailId.eq(detail.id))
                .all(db)
                .await
                .map_err(ServiceError::db_error)?;
            lines.push(DisposalLine {
                detail,
                allocations,
            });
        }
        Ok(DisposalNoteView { note, lines })
    }
}

fn ensure_transition(
    note: &disposal_note::Model,
    next: DisposalNoteStatus,
) -> Result<(), ServiceError> {
    if note.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(ServiceError::InvalidOperation(format!(
            "Disposal note {} cannot move from {} to {}",
            note.code,
            note.status.as_str(),
            next.as_str()
        )))
    }
}

fn record_status_change(
    uow: &mut UnitOfWork,
    note_id: Uuid,
    old: DisposalNoteStatus,
    new: DisposalNoteStatus,
) {
    uow.record(Event::DisposalNoteStatusChanged {
        note_id,
        old_status: old.as_str().to_string(),
        new_status: new.as_str().to_string(),
    });
}

async fn find_note<C: ConnectionTrait>(
    conn: &C,
    note_id: Uuid,
) -> Result<disposal_note::Model, ServiceError> {
    DisposalNoteEntity::find_by_id(note_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Disposal note {} not found", note_id)))
}

async fn note_details<C: ConnectionTrait>(
    conn: &C,
    note_id: Uuid,
) -> Result<Vec<disposal_note_detail::Model>, ServiceError> {
    disposal_note_detail::Entity::find()
        .filter(disposal_note_detail::Column::NoteId.eq(note_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

async fn set_note_status<C: ConnectionTrait>(
    conn: &C,
    note: disposal_note::Model,
    status: DisposalNoteStatus,
) -> Result<disposal_note::Model, ServiceError> {
    let mut active: disposal_note::ActiveModel = note.into();
    active.status = Set(status);
    active.updated_at = Set(Utc::now());
    active.update(conn).await.map_err(ServiceError::db_error)
}
