//! Properties of merge operations over generated versions.

use itemdb_core::{AttrValue, ItemId, Scalar, Value};
use itemdb_sync::merge::{unite, unite_text, MergeData, MergeOperation, MergeStrategy};
use itemdb_sync::ItemVersion;
use itemdb_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn item() -> ItemId {
    ItemId::new(100).unwrap()
}

fn merge(strategy: &MergeStrategy, base: &ItemVersion, trunk: &ItemVersion, server: &ItemVersion) -> MergeData {
    let mut data = MergeData::new(base.clone(), trunk.clone(), server.clone());
    strategy.apply(&mut data);
    data
}

fn long_set(values: &BTreeSet<i64>) -> Value {
    values.clone().into_value()
}

fn scalars(value: &Value) -> BTreeSet<Scalar> {
    value.scalars().cloned().collect()
}

proptest! {
    #[test]
    fn unite_is_commutative_and_covers_both(a in set_value_strategy(), b in set_value_strategy()) {
        let ab = unite(&a, &b).unwrap();
        let ba = unite(&b, &a).unwrap();
        prop_assert_eq!(&ab, &ba);
        prop_assert!(scalars(&a).is_subset(&scalars(&ab)));
        prop_assert!(scalars(&b).is_subset(&scalars(&ab)));
    }

    #[test]
    fn long_sets_unite_commutatively(
        a in prop::collection::btree_set(-50i64..50, 0..8),
        b in prop::collection::btree_set(-50i64..50, 0..8),
    ) {
        let ab = unite(&long_set(&a), &long_set(&b)).unwrap();
        prop_assert_eq!(&ab, &unite(&long_set(&b), &long_set(&a)).unwrap());
        let expected: BTreeSet<i64> = a.union(&b).copied().collect();
        prop_assert_eq!(ab, long_set(&expected));
    }

    #[test]
    fn list_union_ignores_operand_order(
        a in prop::collection::vec(-20i64..20, 0..8),
        b in prop::collection::vec(-20i64..20, 0..8),
    ) {
        let list = |items: &Vec<i64>| Value::List(items.iter().copied().map(Scalar::Long).collect());
        let ab = unite(&list(&a), &list(&b)).unwrap();
        prop_assert_eq!(&ab, &unite(&list(&b), &list(&a)).unwrap());
        let expected: BTreeSet<i64> = a.iter().chain(&b).copied().collect();
        prop_assert_eq!(ab, Value::List(expected.into_iter().map(Scalar::Long).collect()));
    }

    #[test]
    fn case_insensitive_union_has_one_spelling_per_word(a in set_value_strategy(), b in set_value_strategy()) {
        let ab = unite_text(&a, &b, true).unwrap();
        let ba = unite_text(&b, &a, true).unwrap();
        let folded = |value: &Value| -> BTreeSet<String> {
            value.scalars().filter_map(|s| s.as_text()).map(str::to_lowercase).collect()
        };
        prop_assert_eq!(&ab, &ba);
        prop_assert_eq!(ab.scalars().count(), folded(&ab).len());
        prop_assert!(folded(&a).is_subset(&folded(&ab)));
        prop_assert!(folded(&b).is_subset(&folded(&ab)));
    }

    #[test]
    fn merging_twice_changes_nothing(
        base in issue_values_strategy(),
        trunk in issue_values_strategy(),
        server in issue_values_strategy(),
    ) {
        let strategy = issue_strategy();
        let base = ItemVersion::from_values(item(), base);
        let trunk = ItemVersion::from_values(item(), trunk);
        let server = ItemVersion::from_values(item(), server);

        let mut data = merge(&strategy, &base, &trunk, &server);
        let once = data.resolution();
        let conflicts = data.conflicts();
        strategy.apply(&mut data);
        prop_assert_eq!(data.resolution(), once);
        prop_assert_eq!(data.conflicts(), conflicts);
    }

    #[test]
    fn strategies_are_deterministic(
        base in issue_values_strategy(),
        trunk in issue_values_strategy(),
        server in issue_values_strategy(),
    ) {
        let strategy = issue_strategy();
        let base = ItemVersion::from_values(item(), base);
        let trunk = ItemVersion::from_values(item(), trunk);
        let server = ItemVersion::from_values(item(), server);
        let first = merge(&strategy, &base, &trunk, &server);
        let second = merge(&strategy, &base, &trunk, &server);
        prop_assert_eq!(first.resolution(), second.resolution());
        prop_assert_eq!(first.conflicts(), second.conflicts());
    }
}

#[test]
fn custom_operations_see_earlier_resolutions() {
    let priority_id = PRIORITY.key().id().clone();
    let strategy = MergeStrategy::new()
        .with(MergeOperation::discard_edit(&[PRIORITY.key()]))
        .with(MergeOperation::custom("most urgent", move |data: &mut MergeData| {
            let local = data.trunk().get(&*PRIORITY);
            let resolved = data.resolved(&priority_id).and_then(|v| i64::from_value(&v));
            if let (Some(local), Some(resolved)) = (local, resolved) {
                data.resolve(&priority_id, Some(local.min(resolved).into_value()));
            }
        }));

    let version = |priority: i64| {
        let mut values = itemdb_core::AttrMap::new();
        values.insert(PRIORITY.key().id().clone(), priority.into_value());
        ItemVersion::from_values(item(), values)
    };
    let data = merge(&strategy, &version(3), &version(1), &version(2));
    assert!(data.conflicts().is_empty());
    assert_eq!(data.resolved(PRIORITY.key().id()), Some(1i64.into_value()));

    let data = merge(&strategy, &version(3), &version(4), &version(2));
    assert_eq!(data.resolved(PRIORITY.key().id()), Some(2i64.into_value()));
}
