//! Property-based tests for FEFO allocation and ledger arithmetic.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use proptest::prelude::*;
use uuid::Uuid;

use dairy_wms::services::goods_receipts::split_into_pallets;
use dairy_wms::services::inventory_ledger::{aggregate_movements, StockMovement};
use dairy_wms::services::pick_allocation::{plan_fefo_allocation, CandidatePallet};

fn pallets_strategy() -> impl Strategy<Value = Vec<CandidatePallet>> {
    prop::collection::vec((0i64..60, 1i32..200), 1..12).prop_map(|rows| {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        rows.into_iter()
            .enumerate()
            .map(|(i, (days, on_hand))| CandidatePallet {
                pallet_id: Uuid::new_v4(),
                pallet_code: format!("P-{:03}", i),
                expiry_date: base + Duration::days(days),
                on_hand,
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn allocation_covers_exactly_the_request(
        pallets in pallets_strategy(),
        share in 1u32..=100,
    ) {
        let total: i32 = pallets.iter().map(|p| p.on_hand).sum();
        let required = ((total as i64 * share as i64) / 100).max(1) as i32;

        let picks = plan_fefo_allocation(&pallets, &HashMap::new(), required, "Milk").unwrap();
        prop_assert_eq!(picks.iter().map(|p| p.quantity).sum::<i32>(), required);

        let by_id: HashMap<Uuid, &CandidatePallet> =
            pallets.iter().map(|p| (p.pallet_id, p)).collect();
        for pick in &picks {
            prop_assert!(pick.quantity > 0);
            prop_assert!(pick.quantity <= by_id[&pick.pallet_id].on_hand);
        }
    }

    #[test]
    fn earlier_expiry_is_exhausted_first(
        pallets in pallets_strategy(),
        share in 1u32..=100,
    ) {
        let total: i32 = pallets.iter().map(|p| p.on_hand).sum();
        let required = ((total as i64 * share as i64) / 100).max(1) as i32;

        let picks = plan_fefo_allocation(&pallets, &HashMap::new(), required, "Milk").unwrap();
        let by_id: HashMap<Uuid, &CandidatePallet> =
            pallets.iter().map(|p| (p.pallet_id, p)).collect();

        let latest_used = picks
            .iter()
            .map(|p| by_id[&p.pallet_id].expiry_date)
            .max()
            .unwrap();
        let taken: HashMap<Uuid, i32> = picks.iter().map(|p| (p.pallet_id, p.quantity)).collect();

        for pallet in pallets.iter().filter(|p| p.expiry_date < latest_used) {
            prop_assert_eq!(taken.get(&pallet.pallet_id).copied(), Some(pallet.on_hand));
        }

        let expiries: Vec<NaiveDate> = picks.iter().map(|p| by_id[&p.pallet_id].expiry_date).collect();
        prop_assert!(expiries.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn shortage_is_reported(pallets in pallets_strategy(), extra in 1i32..50) {
        let total: i32 = pallets.iter().map(|p| p.on_hand).sum();
        prop_assert!(plan_fefo_allocation(&pallets, &HashMap::new(), total + extra, "Milk").is_err());
    }

    #[test]
    fn committed_quantity_is_never_reallocated(
        pallets in pallets_strategy(),
        hold in 0i32..100,
    ) {
        let first = &pallets[0];
        let held = hold.min(first.on_hand);
        let committed = HashMap::from([(first.pallet_id, held)]);
        let free_total: i32 = pallets.iter().map(|p| p.on_hand).sum::<i32>() - held;
        prop_assume!(free_total > 0);

        let picks = plan_fefo_allocation(&pallets, &committed, free_total, "Milk").unwrap();
        let on_first: i32 = picks
            .iter()
            .filter(|p| p.pallet_id == first.pallet_id)
            .map(|p| p.quantity)
            .sum();
        prop_assert_eq!(on_first, first.on_hand - held);
    }

    #[test]
    fn pallet_split_conserves_quantity(total in 1i32..10_000, count in 1i32..50) {
        prop_assume!(count <= total);
        let split = split_into_pallets(total, count);
        prop_assert_eq!(split.len() as i32, count);
        prop_assert_eq!(split.iter().sum::<i32>(), total);
        let max = *split.iter().max().unwrap();
        let min = *split.iter().min().unwrap();
        prop_assert!(max - min <= 1);
    }

    #[test]
    fn aggregation_preserves_net_change(changes in prop::collection::vec(-50i32..50, 1..20)) {
        let goods = Uuid::new_v4();
        let packing = Uuid::new_v4();
        let movements: Vec<StockMovement> = changes
            .iter()
            .map(|c| StockMovement::adjustment(goods, packing, *c))
            .collect();
        let merged = aggregate_movements(&movements);
        let expected: i32 = changes.iter().sum();
        if expected == 0 {
            prop_assert!(merged.iter().all(|m| m.net() == 0));
        } else {
            prop_assert_eq!(merged.len(), 1);
            prop_assert_eq!(merged[0].net(), expected);
        }
    }
}
