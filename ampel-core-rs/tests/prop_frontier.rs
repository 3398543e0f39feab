//! Property tests for the frontier
//!
//! Tests the merge invariants that make the frontier a CRDT:
//! - Join: commutativity, associativity, idempotence
//! - Merge: monotonic, never lowers an entry
//! - Store: increments only at rendezvous, catch-up reaches the maximum

use ampel_core::frontier::*;
use ampel_core::types::Phase;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn node_id() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["A", "B", "C", "D", "E"]).prop_map(|s| s.to_string())
}

fn frontier_strategy() -> impl Strategy<Value = Frontier> {
    prop::collection::btree_map(node_id(), 0u64..50, 0..5)
        .prop_map(|entries| entries.into_iter().collect())
}

// ============================================================================
// Join Laws
// ============================================================================

proptest! {
    #[test]
    fn join_commutative(a in frontier_strategy(), b in frontier_strategy()) {
        prop_assert_eq!(a.join(&b), b.join(&a));
    }

    #[test]
    fn join_associative(
        a in frontier_strategy(),
        b in frontier_strategy(),
        c in frontier_strategy()
    ) {
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
    }

    #[test]
    fn join_idempotent(a in frontier_strategy(), b in frontier_strategy()) {
        let once = a.join(&b);
        prop_assert_eq!(once.join(&b), once.clone());
        prop_assert_eq!(a.join(&a), a);
    }

    /// Merge never lowers an entry and covers every remote entry
    #[test]
    fn merge_monotonic(a in frontier_strategy(), b in frontier_strategy()) {
        let mut merged = a.clone();
        let changed = merged.merge(&b);

        for (node, count) in a.iter() {
            prop_assert!(merged.get(node).unwrap_or(0) >= *count);
        }
        for (node, count) in b.iter() {
            prop_assert!(merged.get(node).unwrap_or(0) >= *count);
        }
        prop_assert_eq!(changed, merged != a);
    }

    /// Any delivery order of the same updates converges to the same frontier
    #[test]
    fn delivery_order_irrelevant(
        updates in prop::collection::vec(frontier_strategy(), 1..8),
        seed in any::<u64>()
    ) {
        let mut forward = Frontier::new();
        for u in &updates {
            forward.merge(u);
        }

        let mut shuffled = updates.clone();
        let len = shuffled.len();
        for i in 0..len {
            let j = (seed as usize).wrapping_add(i * 7) % len;
            shuffled.swap(i, j);
        }
        let mut backward = Frontier::new();
        for u in shuffled.iter().chain(updates.iter()) {
            backward.merge(u);
        }

        prop_assert_eq!(forward, backward);
    }
}

// ============================================================================
// Store Property Tests
// ============================================================================

proptest! {
    /// Catch-up lands exactly on the maximum and the phase follows parity
    #[test]
    fn catch_up_reaches_max(own in 0u64..20, remote in frontier_strategy()) {
        let mut store = FrontierStore::from_snapshot("A", [("A".to_string(), own)].into_iter().collect());
        store.merge(&remote);
        store.catch_up();

        let max = store.frontier().max().unwrap_or(0);
        prop_assert_eq!(store.own(), max);
        prop_assert!(!store.is_self_behind());
        prop_assert_eq!(Phase::from_parity(store.own()), Phase::from_parity(max));
    }

    /// Rendezvous holds exactly when all counters are equal
    #[test]
    fn rendezvous_iff_all_equal(remote in frontier_strategy()) {
        let mut store = FrontierStore::new("A");
        store.merge(&remote);

        let first = store.frontier().iter().next().map(|(_, c)| *c);
        let all_equal = store.frontier().iter().all(|(_, c)| Some(*c) == first);
        prop_assert_eq!(store.can_self_switch(), all_equal);
    }

    /// Own counter never decreases under any sequence of operations
    #[test]
    fn own_counter_never_decreases(
        ops in prop::collection::vec(prop_oneof![
            Just(None),
            frontier_strategy().prop_map(Some),
        ], 1..30)
    ) {
        let mut store = FrontierStore::new("A");
        let mut last = store.own();

        for op in ops {
            match op {
                None => {
                    if store.can_self_switch() {
                        store.increment_self();
                    } else {
                        store.catch_up();
                    }
                }
                Some(remote) => {
                    store.merge(&remote);
                }
            }
            prop_assert!(store.own() >= last);
            last = store.own();
        }
    }
}
