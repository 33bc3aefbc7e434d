//! Drift detection properties
//!
//! The diff only looks at column presence, and the guard halts exactly when
//! a column disappears or an unapproved one appears.

use proptest::prelude::*;
use statbucket_common::ValueKind;
use statbucket_ingest::schema::{
    ChangeStatus, ColumnDescriptor, GuardOutcome, GuardPolicy, SchemaCatalog, SchemaDiff,
};
use std::collections::BTreeSet;

const DATASET: &str = "team_season";

fn column_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z]{1,6}", 0..8).prop_map(|s| s.into_iter().collect())
}

fn descriptors(names: &[String]) -> Vec<ColumnDescriptor> {
    names
        .iter()
        .map(|n| ColumnDescriptor::new(n.clone(), "identity", ValueKind::Text))
        .collect()
}

fn as_set(names: &[String]) -> BTreeSet<String> {
    names.iter().cloned().collect()
}

proptest! {
    #[test]
    fn prop_diff_ignores_column_order(
        current in column_names(),
        observed in column_names().prop_shuffle(),
        seed in any::<u64>(),
    ) {
        let mut permuted = observed.clone();
        let len = permuted.len();
        if len > 1 {
            permuted.rotate_left((seed % len as u64) as usize);
        }

        let a = SchemaDiff::compute(&current, &observed);
        let b = SchemaDiff::compute(&current, &permuted);
        prop_assert_eq!(as_set(&a.added), as_set(&b.added));
        prop_assert_eq!(&a.removed, &b.removed);
        prop_assert_eq!(&a.unchanged, &b.unchanged);
    }

    #[test]
    fn prop_diff_partitions_columns(current in column_names(), observed in column_names()) {
        let diff = SchemaDiff::compute(&current, &observed);
        let current_set = as_set(&current);
        let observed_set = as_set(&observed);

        prop_assert_eq!(
            as_set(&diff.added),
            observed_set.difference(&current_set).cloned().collect::<BTreeSet<_>>()
        );
        prop_assert_eq!(
            as_set(&diff.removed),
            current_set.difference(&observed_set).cloned().collect::<BTreeSet<_>>()
        );
        prop_assert_eq!(diff.unchanged.len() + diff.removed.len(), current.len());
    }

    #[test]
    fn prop_guard_halts_exactly_on_unreviewed_drift(
        current in column_names().prop_filter("non-empty snapshot", |c| !c.is_empty()),
        observed in column_names(),
        auto_add in any::<bool>(),
    ) {
        let mut catalog = SchemaCatalog::new();
        catalog.initialize(DATASET, &descriptors(&current)).unwrap();
        let diff = SchemaDiff::compute(&current, &observed);
        let policy = GuardPolicy { auto_add };

        let outcome = catalog.observe(DATASET, &descriptors(&observed), "2024", policy).unwrap();

        let should_halt = !diff.removed.is_empty() || (!diff.added.is_empty() && !auto_add);
        prop_assert_eq!(outcome.is_halt(), should_halt);
        prop_assert_eq!(policy.halts(&diff), should_halt);
        // Observing never publishes a snapshot
        prop_assert_eq!(catalog.current(DATASET).map(|s| s.version), Some(1));

        match outcome {
            GuardOutcome::Halt(halt) => {
                prop_assert_eq!(halt.removed, diff.removed);
                if !auto_add {
                    prop_assert_eq!(as_set(&halt.added), as_set(&diff.added));
                }
                for id in halt.change_ids {
                    let status = catalog.change(id).map(|c| c.status);
                    prop_assert!(matches!(status, Some(ChangeStatus::Pending) | Some(ChangeStatus::Approved)));
                }
            },
            GuardOutcome::Pass { auto_added, .. } => {
                prop_assert_eq!(auto_added.len(), if auto_add { diff.added.len() } else { 0 });
            },
            GuardOutcome::Initialized { .. } => prop_assert!(false, "dataset was already initialized"),
        }
    }
}

#[test]
fn test_repeated_drift_reuses_pending_changes() {
    let mut catalog = SchemaCatalog::new();
    let current = vec!["team".to_string(), "wins".to_string()];
    catalog.initialize(DATASET, &descriptors(&current)).unwrap();
    let observed = vec!["team".to_string(), "wins".to_string(), "pace".to_string()];

    let first = catalog
        .observe(DATASET, &descriptors(&observed), "2024", GuardPolicy::default())
        .unwrap();
    let second = catalog
        .observe(DATASET, &descriptors(&observed), "2025", GuardPolicy::default())
        .unwrap();

    let (GuardOutcome::Halt(first), GuardOutcome::Halt(second)) = (first, second) else {
        panic!("expected two halts");
    };
    assert_eq!(first.change_ids, second.change_ids);
    assert_eq!(catalog.changes(Some(DATASET), true).len(), 1);
}

#[test]
fn test_rejected_removal_is_tolerated() {
    let mut catalog = SchemaCatalog::new();
    let current = vec!["team".to_string(), "wins".to_string(), "srs".to_string()];
    catalog.initialize(DATASET, &descriptors(&current)).unwrap();
    let observed = vec!["team".to_string(), "wins".to_string()];

    let outcome = catalog
        .observe(DATASET, &descriptors(&observed), "2024", GuardPolicy::auto_add())
        .unwrap();
    let GuardOutcome::Halt(halt) = outcome else {
        panic!("removal must halt even with auto-add");
    };
    catalog.reject(halt.change_ids[0]).unwrap();

    match catalog
        .observe(DATASET, &descriptors(&observed), "2024", GuardPolicy::default())
        .unwrap()
    {
        GuardOutcome::Pass {
            tolerated_missing, ..
        } => assert_eq!(tolerated_missing, vec!["srs"]),
        other => panic!("expected pass, got {:?}", other),
    }
}
