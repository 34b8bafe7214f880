use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::db::UnitOfWork;
use crate::entities::{
    batch,
    goods_receipt_note::{self, GoodsReceiptStatus},
    goods_receipt_note_detail, pallet, warehouse,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::goods_label;
use crate::services::inventory_ledger::create_inventory_ledger_by_goods_receipt;
use crate::services::pallets::{insert_pallet, NewPallet};
use crate::services::stocktaking::ensure_no_stocktaking_in_progress;

/// Splits `total` packages over `pallets` pallets as evenly as possible; the
/// first pallets carry the remainder.
pub fn split_into_pallets(total: i32, pallets: i32) -> Vec<i32> {
    if pallets <= 0 || total <= 0 {
        return Vec::new();
    }
    let base = total / pallets;
    let remainder = total % pallets;
    (0..pallets)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReceiptLineInput {
    pub goods_id: Uuid,
    pub goods_packing_id: Uuid,
    pub batch_id: Uuid,
    #[validate(range(min = 1))]
    pub package_quantity: i32,
    #[validate(range(min = 1))]
    pub pallet_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateGoodsReceiptInput {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub warehouse_id: Uuid,
    pub received_by: Uuid,
    #[validate(length(min = 1))]
    pub lines: Vec<ReceiptLineInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodsReceiptView {
    pub note: goods_receipt_note::Model,
    pub details: Vec<goods_receipt_note_detail::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedReceipt {
    pub note: goods_receipt_note::Model,
    pub pallets: Vec<pallet::Model>,
    pub ledger_entries: usize,
}

#[derive(Clone)]
pub struct GoodsReceiptService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl GoodsReceiptService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_note(
        &self,
        input: CreateGoodsReceiptInput,
    ) -> Result<GoodsReceiptView, ServiceError> {
        input.validate()?;
        for line in &input.lines {
            line.validate()?;
            if line.pallet_count > line.package_quantity {
                return Err(ServiceError::ValidationError(format!(
                    "Cannot spread {} packages over {} pallets",
                    line.package_quantity, line.pallet_count
                )));
            }
        }

        let uow = UnitOfWork::begin(&self.db_pool).await?;
        warehouse::Entity::find_by_id(input.warehouse_id)
            .one(uow.conn())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Warehouse {} not found", input.warehouse_id))
            })?;

        let note = goods_receipt_note::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(input.code.clone()),
            warehouse_id: Set(input.warehouse_id),
            status: Set(GoodsReceiptStatus::Draft),
            received_by: Set(input.received_by),
            received_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(uow.conn())
        .await
        .map_err(ServiceError::db_error)?;

        let mut details = Vec::with_capacity(input.lines.len());
        for line in &input.lines {
            goods_label(uow.conn(), line.goods_id, line.goods_packing_id).await?;
            let batch = batch::Entity::find_by_id(line.batch_id)
                .one(uow.conn())
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", line.batch_id)))?;
            if batch.goods_id != line.goods_id {
                return Err(ServiceError::ValidationError(format!(
                    "Batch {} belongs to other goods",
                    batch.code
                )));
            }

            let detail = goods_receipt_note_detail::ActiveModel {
                id: Set(Uuid::new_v4()),
                note_id: Set(note.id),
                goods_id: Set(line.goods_id),
                goods_packing_id: Set(line.goods_packing_id),
                batch_id: Set(line.batch_id),
                package_quantity: Set(line.package_quantity),
                pallet_count: Set(line.pallet_count),
            }
            .insert(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;
            details.push(detail);
        }

        uow.commit(&self.event_sender).await?;
        info!(note_id = %note.id, lines = details.len(), "Goods receipt drafted");
        Ok(GoodsReceiptView { note, details })
    }

    /// Builds the pallets of a draft receipt and books them into the ledger.
    #[instrument(skip(self))]
    pub async fn complete_note(&self, note_id: Uuid) -> Result<CompletedReceipt, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;
        let note = find_note(uow.conn(), note_id).await?;
        ensure_no_stocktaking_in_progress(uow.conn(), note.warehouse_id).await?;

        if note.status != GoodsReceiptStatus::Draft {
            return Err(ServiceError::InvalidOperation(format!(
                "Goods receipt {} is already completed",
                note.code
            )));
        }

        let details = goods_receipt_note_detail::Entity::find()
            .filter(goods_receipt_note_detail::Column::NoteId.eq(note_id))
            .all(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        let mut pallets = Vec::new();
        for detail in &details {
            for quantity in split_into_pallets(detail.package_quantity, detail.pallet_count) {
                let created = insert_pallet(
                    uow.conn(),
                    NewPallet {
                        code: format!("{}-{:03}", note.code, pallets.len() + 1),
                        warehouse_id: note.warehouse_id,
                        batch_id: detail.batch_id,
                        goods_packing_id: detail.goods_packing_id,
                        goods_receipt_note_id: Some(note_id),
                        package_quantity: quantity,
                    },
                )
                .await?;
                uow.record(Event::PalletCreated {
                    pallet_id: created.id,
                    goods_packing_id: created.goods_packing_id,
                    package_quantity: created.package_quantity,
                });
                pallets.push(created);
            }
        }

        let now = Utc::now();
        let mut active: goods_receipt_note::ActiveModel = note.into();
        active.status = Set(GoodsReceiptStatus::Completed);
        active.received_at = Set(Some(now));
        let completed = active
            .update(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        let entries = create_inventory_ledger_by_goods_receipt(uow.conn(), note_id, now).await?;

        uow.record(Event::GoodsReceived {
            note_id,
            pallets_created: pallets.len(),
        });
        uow.record(Event::LedgerEntriesAppended {
            source_type: "GoodsReceipt".to_string(),
            source_id: note_id,
            entries: entries.len(),
        });
        uow.commit(&self.event_sender).await?;

        counter!("goods_receipts.completed", 1);
        counter!("pallets.created", pallets.len() as u64);
        info!(note_id = %note_id, pallets = pallets.len(), "Goods receipt completed");

        Ok(CompletedReceipt {
            note: completed,
            pallets,
            ledger_entries: entries.len(),
        })
    }

    pub async fn get_note(&self, note_id: Uuid) -> Result<goods_receipt_note::Model, ServiceError> {
        find_note(&*self.db_pool, note_id).await
    }
}

async fn find_note<C: ConnectionTrait>(
    conn: &C,
    note_id: Uuid,
) -> Result<goods_receipt_note::Model, ServiceError> {
    goods_receipt_note::Entity::find_by_id(note_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Goods receipt note {} not found", note_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(100, 1, vec![100])]
    #[case(100, 3, vec![34, 33, 33])]
    #[case(10, 5, vec![2, 2, 2, 2, 2])]
    #[case(0, 2, vec![])]
    fn quantity_is_split_evenly(#[case] total: i32, #[case] count: i32, #[case] expected: Vec<i32>) {
        let split = split_into_pallets(total, count);
        assert_eq!(split, expected);
        assert_eq!(split.iter().sum::<i32>(), total.max(0));
    }
}
