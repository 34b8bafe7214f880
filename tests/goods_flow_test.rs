mod common;

use assert_matches::assert_matches;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use common::{today, TestWarehouse};
use dairy_wms::entities::{
    batch::BatchStatus, goods_issue_note::GoodsIssueStatus,
    goods_receipt_note::GoodsReceiptStatus, inventory_ledger::LedgerSourceType,
    pick_allocation::PickAllocationStatus,
};
use dairy_wms::errors::ServiceError;
use dairy_wms::services::batches::CreateBatchInput;
use dairy_wms::services::goods_issues::{CreateGoodsIssueInput, IssueLineInput};
use dairy_wms::services::goods_receipts::{CreateGoodsReceiptInput, ReceiptLineInput};
use dairy_wms::services::inventory_ledger::create_inventory_ledger_by_goods_receipt;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn receive(
    wh: &TestWarehouse,
    code: &str,
    goods_id: Uuid,
    packing_id: Uuid,
    batch_id: Uuid,
    quantity: i32,
    pallets: i32,
) -> Uuid {
    let receipts = &wh.services.goods_receipts;
    let draft = receipts
        .create_note(CreateGoodsReceiptInput {
            code: code.to_string(),
            warehouse_id: wh.warehouse_id,
            received_by: Uuid::new_v4(),
            lines: vec![ReceiptLineInput {
                goods_id,
                goods_packing_id: packing_id,
                batch_id,
                package_quantity: quantity,
                pallet_count: pallets,
            }],
        })
        .await
        .expect("draft receipt");
    assert_eq!(draft.note.status, GoodsReceiptStatus::Draft);
    receipts
        .complete_note(draft.note.id)
        .await
        .expect("complete receipt");
    draft.note.id
}

#[tokio::test]
async fn receipt_builds_pallets_and_books_inbound_stock() {
    let wh = TestWarehouse::new().await;
    let (goods_id, packing_id) = wh.add_goods("BUT-250", "Butter 250g").await;
    let batch = wh.add_batch(goods_id, "BT-01", date(2024, 9, 1)).await;

    let draft = wh
        .services
        .goods_receipts
        .create_note(CreateGoodsReceiptInput {
            code: "GR-001".to_string(),
            warehouse_id: wh.warehouse_id,
            received_by: Uuid::new_v4(),
            lines: vec![ReceiptLineInput {
                goods_id,
                goods_packing_id: packing_id,
                batch_id: batch,
                package_quantity: 100,
                pallet_count: 3,
            }],
        })
        .await
        .unwrap();

    let completed = wh
        .services
        .goods_receipts
        .complete_note(draft.note.id)
        .await
        .unwrap();
    assert_eq!(completed.note.status, GoodsReceiptStatus::Completed);
    assert!(completed.note.received_at.is_some());
    assert_eq!(completed.ledger_entries, 1);

    let mut quantities: Vec<i32> = completed
        .pallets
        .iter()
        .map(|p| p.package_quantity)
        .collect();
    quantities.sort_unstable();
    assert_eq!(quantities, vec![33, 33, 34]);
    assert!(completed.pallets.iter().all(|p| p.code.starts_with("GR-001-")));

    assert_eq!(
        wh.services
            .ledger
            .latest_balance(goods_id, packing_id)
            .await
            .unwrap(),
        100
    );

    let err = wh
        .services
        .goods_receipts
        .complete_note(draft.note.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn ledger_is_written_once_per_source() {
    let wh = TestWarehouse::new().await;
    let (goods_id, packing_id) = wh.add_goods("CRM-200", "Cream 200ml").await;
    let batch = wh.add_batch(goods_id, "CR-01", date(2024, 7, 15)).await;
    let note_id = receive(&wh, "GR-010", goods_id, packing_id, batch, 60, 2).await;

    let again = create_inventory_ledger_by_goods_receipt(&*wh.db, note_id, Utc::now())
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].sequence, 1);

    let history = wh
        .services
        .ledger
        .history(goods_id, packing_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source_type, LedgerSourceType::GoodsReceipt);
    assert_eq!(history[0].in_quantity, 60);
}

#[tokio::test]
async fn receipt_rejects_more_pallets_than_packages() {
    let wh = TestWarehouse::new().await;
    let (goods_id, packing_id) = wh.add_goods("KEF-1L", "Kefir 1L").await;
    let batch = wh.add_batch(goods_id, "KF-01", date(2024, 7, 1)).await;

    let err = wh
        .services
        .goods_receipts
        .create_note(CreateGoodsReceiptInput {
            code: "GR-002".to_string(),
            warehouse_id: wh.warehouse_id,
            received_by: Uuid::new_v4(),
            lines: vec![ReceiptLineInput {
                goods_id,
                goods_packing_id: packing_id,
                batch_id: batch,
                package_quantity: 2,
                pallet_count: 3,
            }],
        })
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn issue_picks_fresh_stock_and_keeps_the_chain_intact() {
    let wh = TestWarehouse::new().await;
    let (goods_id, packing_id) = wh.add_goods("MILK-2L", "Skimmed milk 2L").await;
    let fresh = wh.add_batch(goods_id, "SK-0710", date(2024, 7, 10)).await;
    let expired = wh.add_batch(goods_id, "SK-0520", date(2024, 5, 20)).await;
    receive(&wh, "GR-100", goods_id, packing_id, fresh, 100, 3).await;
    let stale = wh.stock_pallet("SK-OLD", expired, packing_id, 40, None).await;

    let err = wh
        .services
        .goods_issues
        .create_note(
            CreateGoodsIssueInput {
                code: "GI-000".to_string(),
                warehouse_id: wh.warehouse_id,
                requested_by: Uuid::new_v4(),
                lines: vec![IssueLineInput {
                    goods_id,
                    goods_packing_id: packing_id,
                    package_quantity: 120,
                }],
            },
            today(),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    let requester = Uuid::new_v4();
    let view = wh
        .services
        .goods_issues
        .create_note(
            CreateGoodsIssueInput {
                code: "GI-001".to_string(),
                warehouse_id: wh.warehouse_id,
                requested_by: requester,
                lines: vec![IssueLineInput {
                    goods_id,
                    goods_packing_id: packing_id,
                    package_quantity: 50,
                }],
            },
            today(),
        )
        .await
        .unwrap();
    assert_eq!(view.note.status, GoodsIssueStatus::Picking);
    let allocations = &view.lines[0].allocations;
    assert_eq!(allocations.iter().map(|a| a.package_quantity).sum::<i32>(), 50);
    assert!(allocations.iter().all(|a| a.pallet_id != stale.id));

    let err = wh
        .services
        .goods_issues
        .complete_note(view.note.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let mut completed_flags = Vec::new();
    for allocation in allocations {
        let code = wh.pallet(allocation.pallet_id).await.code;
        let scanned = wh.services.picking.scan(allocation.id, &code).await.unwrap();
        completed_flags.push(scanned.line_completed);
    }
    assert_eq!(completed_flags.last(), Some(&true));

    let shipped = wh
        .services
        .goods_issues
        .complete_note(view.note.id)
        .await
        .unwrap();
    assert_eq!(shipped.status, GoodsIssueStatus::Completed);

    let reloaded = wh.services.goods_issues.get_note(view.note.id).await.unwrap();
    assert!(reloaded.lines[0]
        .allocations
        .iter()
        .all(|a| a.status == PickAllocationStatus::Fulfilled));

    let ledger = &wh.services.ledger;
    let chain = ledger.verify_chain(goods_id, packing_id).await.unwrap();
    assert!(chain.is_valid());
    // Receipt, manual pallet, issue.
    assert_eq!(chain.entries, 3);
    assert_eq!(chain.balance, 100 + 40 - 50);
    assert_eq!(
        ledger.reconcile(goods_id, packing_id).await.unwrap().difference(),
        0
    );
}

#[tokio::test]
async fn cancelled_issue_releases_its_allocations() {
    let wh = TestWarehouse::new().await;
    let (goods_id, packing_id) = wh.add_goods("CHS-1KG", "Gouda 1kg").await;
    let batch = wh.add_batch(goods_id, "GD-01", date(2024, 8, 1)).await;
    receive(&wh, "GR-200", goods_id, packing_id, batch, 30, 1).await;

    let issue = |code: &str| CreateGoodsIssueInput {
        code: code.to_string(),
        warehouse_id: wh.warehouse_id,
        requested_by: Uuid::new_v4(),
        lines: vec![IssueLineInput {
            goods_id,
            goods_packing_id: packing_id,
            package_quantity: 30,
        }],
    };

    let first = wh
        .services
        .goods_issues
        .create_note(issue("GI-A"), today())
        .await
        .unwrap();
    let err = wh
        .services
        .goods_issues
        .create_note(issue("GI-B"), today())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    let cancelled = wh
        .services
        .goods_issues
        .cancel_note(first.note.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, GoodsIssueStatus::Cancelled);

    wh.services
        .goods_issues
        .create_note(issue("GI-C"), today())
        .await
        .unwrap();
}

#[tokio::test]
async fn expiry_check_flags_batches_past_their_date() {
    let wh = TestWarehouse::new().await;
    let (goods_id, packing_id) = wh.add_goods("MILK-1L", "Whole milk 1L").await;
    let batch = wh.add_batch(goods_id, "B-0610", date(2024, 6, 10)).await;
    wh.stock_pallet("P-100", batch, packing_id, 20, None).await;

    let report = wh
        .services
        .expiry_check
        .run_once(date(2024, 6, 10))
        .await
        .unwrap();
    assert!(report.expired_batches.is_empty());

    let report = wh
        .services
        .expiry_check
        .run_once(date(2024, 6, 11))
        .await
        .unwrap();
    assert_eq!(report.expired_batches, vec![batch]);
    assert_eq!(report.affected_pallets, 1);
    assert_eq!(
        wh.services.batches.get_batch(batch).await.unwrap().status,
        BatchStatus::Expired
    );

    let report = wh
        .services
        .expiry_check
        .run_once(date(2024, 6, 12))
        .await
        .unwrap();
    assert!(report.expired_batches.is_empty());
}

#[tokio::test]
async fn batch_creation_checks_goods_and_duplicates() {
    let wh = TestWarehouse::new().await;
    let (goods_id, _) = wh.add_goods("YOG-150", "Yogurt 150g").await;
    let input = CreateBatchInput {
        goods_id,
        code: "YG-01".to_string(),
        manufacturing_date: date(2024, 5, 25),
        expiry_date: date(2024, 7, 25),
    };

    let created = wh
        .services
        .batches
        .create_batch(input.clone(), today())
        .await
        .unwrap();
    assert_eq!(created.status, BatchStatus::Active);

    let err = wh
        .services
        .batches
        .create_batch(input.clone(), today())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    let err = wh
        .services
        .batches
        .create_batch(
            CreateBatchInput {
                goods_id: Uuid::new_v4(),
                ..input
            },
            today(),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}
