mod common;

use assert_matches::assert_matches;
use chrono::NaiveDate;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use uuid::Uuid;

use common::{today, TestWarehouse};
use dairy_wms::entities::{
    disposal_note::DisposalNoteStatus,
    disposal_note_detail::DisposalDetailStatus,
    inventory_ledger::LedgerSourceType,
    pallet::{self, PalletStatus},
    pick_allocation::PickAllocationStatus,
};
use dairy_wms::errors::ServiceError;
use dairy_wms::services::disposal_notes::{
    CreateDisposalNoteInput, DisposalLineInput, DisposalNoteView,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Two expired pallets (100 and 80 packages) and one fresh pallet of 200.
struct MilkStock {
    goods_id: Uuid,
    packing_id: Uuid,
    oldest: pallet::Model,
    older: pallet::Model,
    fresh: pallet::Model,
    oldest_location: Uuid,
}

async fn seed_milk(wh: &TestWarehouse) -> MilkStock {
    let (goods_id, packing_id) = wh.add_goods("MILK-1L", "Whole milk 1L").await;
    let b1 = wh.add_batch(goods_id, "B-0501", date(2024, 5, 1)).await;
    let b2 = wh.add_batch(goods_id, "B-0520", date(2024, 5, 20)).await;
    let b3 = wh.add_batch(goods_id, "B-0701", date(2024, 7, 1)).await;
    let oldest_location = wh.add_location(wh.area_id, "A-01-01").await;

    let oldest = wh
        .stock_pallet("P-001", b1, packing_id, 100, Some(oldest_location))
        .await;
    let older = wh.stock_pallet("P-002", b2, packing_id, 80, None).await;
    let fresh = wh.stock_pallet("P-003", b3, packing_id, 200, None).await;

    MilkStock {
        goods_id,
        packing_id,
        oldest,
        older,
        fresh,
        oldest_location,
    }
}

fn disposal_input(wh: &TestWarehouse, stock: &MilkStock, code: &str, qty: i32) -> CreateDisposalNoteInput {
    CreateDisposalNoteInput {
        code: code.to_string(),
        warehouse_id: wh.warehouse_id,
        requested_by: Uuid::new_v4(),
        reason: "Expired stock".to_string(),
        lines: vec![DisposalLineInput {
            goods_id: stock.goods_id,
            goods_packing_id: stock.packing_id,
            package_quantity: qty,
        }],
    }
}

/// Drives a new note through picking until it waits for approval.
async fn picked_note(wh: &TestWarehouse, stock: &MilkStock, qty: i32) -> DisposalNoteView {
    let disposals = &wh.services.disposal_notes;
    let view = disposals
        .create_disposal_note(disposal_input(wh, stock, "DN-001", qty), today())
        .await
        .expect("create note");
    let note_id = view.note.id;

    disposals
        .assign_for_picking(note_id, Uuid::new_v4())
        .await
        .expect("assign");
    disposals.start_picking(note_id).await.expect("start picking");

    for allocation in &view.lines[0].allocations {
        let code = wh.pallet(allocation.pallet_id).await.code;
        wh.services
            .picking
            .scan(allocation.id, &code)
            .await
            .expect("scan");
    }
    disposals
        .submit_for_approval(note_id)
        .await
        .expect("submit for approval");
    disposals.get_disposal_note(note_id).await.expect("reload")
}

#[tokio::test]
async fn expired_pallets_are_allocated_earliest_expiry_first() {
    let wh = TestWarehouse::new().await;
    let stock = seed_milk(&wh).await;

    let view = wh
        .services
        .disposal_notes
        .create_disposal_note(disposal_input(&wh, &stock, "DN-001", 150), today())
        .await
        .unwrap();

    assert_eq!(view.note.status, DisposalNoteStatus::Draft);
    let line = &view.lines[0];
    assert_eq!(line.allocated_quantity(), 150);

    let picks: Vec<(Uuid, i32)> = line
        .allocations
        .iter()
        .map(|a| (a.pallet_id, a.package_quantity))
        .collect();
    assert_eq!(picks, vec![(stock.oldest.id, 100), (stock.older.id, 50)]);
    assert!(line.allocations.iter().all(|a| a.status == PickAllocationStatus::UnScanned));
    assert!(!picks.iter().any(|(id, _)| *id == stock.fresh.id));
}

#[tokio::test]
async fn committed_stock_is_not_allocated_twice() {
    let wh = TestWarehouse::new().await;
    let stock = seed_milk(&wh).await;
    let disposals = &wh.services.disposal_notes;

    disposals
        .create_disposal_note(disposal_input(&wh, &stock, "DN-001", 150), today())
        .await
        .unwrap();
    let second = disposals
        .create_disposal_note(disposal_input(&wh, &stock, "DN-002", 30), today())
        .await
        .unwrap();
    assert_eq!(second.lines[0].allocations.len(), 1);
    assert_eq!(second.lines[0].allocations[0].pallet_id, stock.older.id);
    assert_eq!(second.lines[0].allocations[0].package_quantity, 30);

    let err = disposals
        .create_disposal_note(disposal_input(&wh, &stock, "DN-003", 1), today())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));
}

#[tokio::test]
async fn shortage_names_the_goods_and_creates_nothing() {
    let wh = TestWarehouse::new().await;
    let stock = seed_milk(&wh).await;

    let err = wh
        .services
        .disposal_notes
        .create_disposal_note(disposal_input(&wh, &stock, "DN-001", 500), today())
        .await
        .unwrap_err();
    match err {
        ServiceError::InsufficientStock(message) => {
            assert!(message.contains("Whole milk 1L"), "got: {message}");
        }
        other => panic!("expected insufficient stock, got {other:?}"),
    }

    let notes = dairy_wms::entities::disposal_note::Entity::find()
        .all(&*wh.db)
        .await
        .unwrap();
    assert!(notes.is_empty());
}

#[tokio::test]
async fn scanning_checks_the_pallet_code_and_completes_the_line() {
    let wh = TestWarehouse::new().await;
    let stock = seed_milk(&wh).await;
    let disposals = &wh.services.disposal_notes;

    let view = disposals
        .create_disposal_note(disposal_input(&wh, &stock, "DN-001", 150), today())
        .await
        .unwrap();
    let first = view.lines[0].allocations[0].clone();
    let second = view.lines[0].allocations[1].clone();

    // Draft notes cannot be scanned yet.
    let err = wh.services.picking.scan(first.id, "P-001").await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    disposals
        .assign_for_picking(view.note.id, Uuid::new_v4())
        .await
        .unwrap();
    disposals.start_picking(view.note.id).await.unwrap();

    let err = wh.services.picking.scan(first.id, "P-002").await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let scanned = wh.services.picking.scan(first.id, "P-001").await.unwrap();
    assert_eq!(scanned.allocation.status, PickAllocationStatus::Scanned);
    assert!(scanned.allocation.scanned_at.is_some());
    assert!(!scanned.line_completed);

    let err = wh.services.picking.scan(first.id, "P-001").await.unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    let err = disposals.submit_for_approval(view.note.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let scanned = wh.services.picking.scan(second.id, "P-002").await.unwrap();
    assert!(scanned.line_completed);

    let reloaded = disposals.get_disposal_note(view.note.id).await.unwrap();
    assert_eq!(reloaded.lines[0].detail.status, DisposalDetailStatus::Picked);

    let submitted = disposals.submit_for_approval(view.note.id).await.unwrap();
    assert_eq!(submitted.status, DisposalNoteStatus::PendingApproval);
}

#[tokio::test]
async fn approval_deducts_pallets_and_books_the_ledger() {
    let wh = TestWarehouse::new().await;
    let stock = seed_milk(&wh).await;
    let view = picked_note(&wh, &stock, 150).await;
    let approver = Uuid::new_v4();

    let approval = wh
        .services
        .disposal_notes
        .approve(view.note.id, approver)
        .await
        .unwrap();
    assert_eq!(approval.note.status, DisposalNoteStatus::Completed);
    assert_eq!(approval.note.approved_by, Some(approver));
    assert_eq!(approval.pallets_depleted, 1);
    assert_eq!(approval.ledger_entries, 1);

    let oldest = wh.pallet(stock.oldest.id).await;
    assert_eq!(oldest.package_quantity, 0);
    assert_eq!(oldest.status, PalletStatus::Deleted);
    assert_eq!(oldest.location_id, None);
    assert!(wh.location(stock.oldest_location).await.is_available);

    let older = wh.pallet(stock.older.id).await;
    assert_eq!(older.package_quantity, 30);
    assert_eq!(older.status, PalletStatus::Active);

    let reloaded = wh
        .services
        .disposal_notes
        .get_disposal_note(view.note.id)
        .await
        .unwrap();
    assert!(reloaded.lines[0]
        .allocations
        .iter()
        .all(|a| a.status == PickAllocationStatus::Fulfilled));

    let ledger = &wh.services.ledger;
    let history = ledger.history(stock.goods_id, stock.packing_id).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.source_type, LedgerSourceType::Disposal);
    assert_eq!(last.out_quantity, 150);
    assert_eq!(last.balance_after, 380 - 150);

    let chain = ledger
        .verify_chain(stock.goods_id, stock.packing_id)
        .await
        .unwrap();
    assert!(chain.is_valid());
    let reconciliation = ledger
        .reconcile(stock.goods_id, stock.packing_id)
        .await
        .unwrap();
    assert_eq!(reconciliation.difference(), 0);

    let unread = wh
        .factory
        .notifier()
        .unread_for_user(view.note.requested_by)
        .await
        .unwrap();
    assert!(unread.iter().any(|n| n.message.contains("approved")));
}

#[tokio::test]
async fn repick_returns_the_line_to_picking() {
    let wh = TestWarehouse::new().await;
    let stock = seed_milk(&wh).await;
    let view = picked_note(&wh, &stock, 150).await;
    let detail_id = view.lines[0].detail.id;

    let err = wh
        .services
        .disposal_notes
        .repick_detail(detail_id, "  ")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let line = wh
        .services
        .disposal_notes
        .repick_detail(detail_id, "Wrong pallet on the fork")
        .await
        .unwrap();
    assert_eq!(line.detail.status, DisposalDetailStatus::Picking);
    assert_eq!(
        line.detail.rejection_reason.as_deref(),
        Some("Wrong pallet on the fork")
    );
    assert!(line.allocations.iter().all(|a| {
        a.status == PickAllocationStatus::UnScanned && a.scanned_at.is_none()
    }));

    let note = wh
        .services
        .disposal_notes
        .get_disposal_note(view.note.id)
        .await
        .unwrap()
        .note;
    assert_eq!(note.status, DisposalNoteStatus::Picking);

    let err = wh
        .services
        .disposal_notes
        .approve(view.note.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    // The picker can scan the same pallets again.
    let rescanned = wh
        .services
        .picking
        .scan(line.allocations[0].id, &wh.pallet(line.allocations[0].pallet_id).await.code)
        .await
        .unwrap();
    assert_eq!(rescanned.allocation.status, PickAllocationStatus::Scanned);
}

#[tokio::test]
async fn approval_rolls_back_when_a_pallet_shrank_meanwhile() {
    let wh = TestWarehouse::new().await;
    let stock = seed_milk(&wh).await;
    let view = picked_note(&wh, &stock, 150).await;

    // Another process took 40 packages off the second pallet.
    let mut older: pallet::ActiveModel = wh.pallet(stock.older.id).await.into();
    older.package_quantity = Set(40);
    older.update(&*wh.db).await.unwrap();

    let err = wh
        .services
        .disposal_notes
        .approve(view.note.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    assert_eq!(wh.pallet(stock.oldest.id).await.package_quantity, 100);
    assert_eq!(wh.pallet(stock.older.id).await.package_quantity, 40);

    let reloaded = wh
        .services
        .disposal_notes
        .get_disposal_note(view.note.id)
        .await
        .unwrap();
    assert_eq!(reloaded.note.status, DisposalNoteStatus::PendingApproval);
    assert!(reloaded.lines[0]
        .allocations
        .iter()
        .all(|a| a.status == PickAllocationStatus::Scanned));

    let history = wh
        .services
        .ledger
        .history(stock.goods_id, stock.packing_id)
        .await
        .unwrap();
    assert!(history
        .iter()
        .all(|e| e.source_type != LedgerSourceType::Disposal));
}

#[tokio::test]
async fn cancelling_a_draft_frees_its_allocations() {
    let wh = TestWarehouse::new().await;
    let stock = seed_milk(&wh).await;
    let disposals = &wh.services.disposal_notes;

    let view = disposals
        .create_disposal_note(disposal_input(&wh, &stock, "DN-001", 180), today())
        .await
        .unwrap();
    let cancelled = disposals.cancel(view.note.id).await.unwrap();
    assert_eq!(cancelled.status, DisposalNoteStatus::Cancelled);

    let again = disposals
        .create_disposal_note(disposal_input(&wh, &stock, "DN-002", 180), today())
        .await
        .unwrap();
    assert_eq!(again.lines[0].allocated_quantity(), 180);

    let err = disposals.cancel(view.note.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}
