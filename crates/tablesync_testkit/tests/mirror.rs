//! Mirror consistency and per-row ordering.

use proptest::prelude::*;
use std::sync::Arc;
use tablesync_core::{Row, TableSynchronizer};
use tablesync_testkit::prelude::*;

#[test]
fn stops_scenario() {
    let stops = Arc::new(RecordingSynchronizer::new(stops_schema()));
    with_temp_store(registry_with(vec![stops.clone() as Arc<dyn TableSynchronizer>]), |store| {
        store
            .exec_update("INSERT INTO stops (id, name) VALUES (1, 'Central')", [], true)
            .unwrap();
        store.drain().unwrap();
        let added = stops.take_calls();
        let [Callback::Added { rows, first_sync: false }] = added.as_slice() else {
            panic!("expected one rows_added, got {added:?}");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("id"), Some(1));
        assert_eq!(rows[0].get_text("name"), Some("Central"));

        store
            .exec_update("UPDATE stops SET name = 'Central Station' WHERE id = 1", [], true)
            .unwrap();
        store.drain().unwrap();
        let updated = stops.take_calls();
        let [Callback::Updated { rows }] = updated.as_slice() else {
            panic!("expected one rows_updated, got {updated:?}");
        };
        assert_eq!(rows[0].get_text("name"), Some("Central Station"));

        store.exec_update("DELETE FROM stops WHERE id = 1", [], true).unwrap();
        store.drain().unwrap();
        assert_eq!(
            stops.take_calls(),
            vec![Callback::Removed {
                rows: vec![Row::new().with("id", 1)]
            }]
        );
    });
}

#[test]
fn one_drain_for_a_whole_lifecycle_keeps_order() {
    let mut harness = MirrorHarness::new();
    harness.apply(&RowOp::Insert { id: 5, name: "A".into() }, true);
    harness.apply(&RowOp::Update { id: 5, name: "B".into() }, true);
    harness.apply(&RowOp::Delete { id: 5 }, true);
    assert_eq!(harness.drain(), 3);

    assert_eq!(
        harness.stops.deliveries(),
        vec![("added", 5), ("updated", 5), ("removed", 5)]
    );
    harness.verify();
}

#[test]
fn read_only_column_is_guarded() {
    let mut harness = MirrorHarness::new();
    harness.apply(&RowOp::Insert { id: 1, name: "A".into() }, false);

    let err = harness
        .store
        .exec_update("UPDATE stops SET code = 'X' WHERE id = 1", [], false)
        .unwrap_err();
    assert!(err.to_string().contains("not updatable"));
    assert_eq!(harness.stops.deliveries(), vec![("added", 1)]);

    harness
        .store
        .exec_update_bypassing_guards("UPDATE stops SET code = 'X' WHERE id = 1", [], false)
        .unwrap();
    assert_eq!(harness.stops.mirrored(1).unwrap().get_text("code"), Some("X"));
}

/// For every key, the callback kinds a key goes through must follow the
/// order the store saw, regardless of how drains were batched.
fn deliveries_per_key(deliveries: &[(&'static str, i64)], id: i64) -> Vec<&'static str> {
    deliveries.iter().filter(|(_, k)| *k == id).map(|(kind, _)| *kind).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn mirror_matches_store_after_random_ops(
        ops in op_sequence_strategy(40),
        drain_every in 1usize..8,
    ) {
        let mut harness = MirrorHarness::new();
        for (i, op) in ops.iter().enumerate() {
            harness.apply(op, true);
            if i % drain_every == 0 {
                harness.drain();
            }
        }
        harness.drain();
        harness.verify();

        let deliveries = harness.stops.deliveries();
        for id in harness.model().keys() {
            let kinds = deliveries_per_key(&deliveries, *id);
            prop_assert_ne!(kinds.last().copied(), Some("removed"));
        }
    }

    #[test]
    fn transactions_deliver_only_commits(batches in transaction_batches_strategy(6)) {
        let mut harness = MirrorHarness::new();
        for (ops, commit) in &batches {
            harness.apply_batch(ops, *commit);
            harness.drain();
        }
        harness.verify();
    }
}
