//! Property-based tests for channel laws.

use loomgraph_checkpoint::{
    BinaryOperatorChannel, Channel, EphemeralValueChannel, LastValueChannel,
    NamedBarrierValueChannel, TopicChannel, UntrackedValueChannel,
};
use proptest::prelude::*;
use serde_json::json;

fn arb_value() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        any::<i64>().prop_map(|n| json!(n)),
        any::<bool>().prop_map(|b| json!(b)),
        "[a-z]{0,12}".prop_map(|s| json!(s)),
        prop::collection::vec(any::<i64>(), 0..4).prop_map(|v| json!(v)),
    ]
}

proptest! {
    /// restore(checkpoint(c)) reproduces c for the persisting kinds.
    #[test]
    fn last_value_round_trip(value in arb_value()) {
        let mut chan = LastValueChannel::new();
        chan.update(vec![value]).unwrap();
        let snap = chan.checkpoint().unwrap().unwrap();

        let mut restored = LastValueChannel::new();
        restored.restore(snap).unwrap();
        prop_assert_eq!(restored.get().unwrap(), chan.get().unwrap());
    }

    #[test]
    fn topic_round_trip(values in prop::collection::vec(arb_value(), 1..8)) {
        let mut chan = TopicChannel::new();
        chan.update(values).unwrap();
        let snap = chan.checkpoint().unwrap().unwrap();

        let mut restored = TopicChannel::new();
        restored.restore(snap).unwrap();
        prop_assert_eq!(restored.get().unwrap(), chan.get().unwrap());
    }

    #[test]
    fn ephemeral_round_trip(value in arb_value()) {
        let mut chan = EphemeralValueChannel::new();
        chan.update(vec![value]).unwrap();
        let snap = chan.checkpoint().unwrap().unwrap();

        let mut restored = EphemeralValueChannel::new();
        restored.restore(snap).unwrap();
        prop_assert_eq!(restored.get().unwrap(), chan.get().unwrap());
    }

    /// Untracked channels restore to "no value" whatever was written.
    #[test]
    fn untracked_restores_empty(value in arb_value()) {
        let mut chan = UntrackedValueChannel::new();
        chan.update(vec![value]).unwrap();
        prop_assert!(chan.checkpoint().unwrap().is_none());
    }

    /// Sum-reduction over a batch is associative: any split of the same
    /// multiset of updates converges to the same value.
    #[test]
    fn sum_reducer_associative(
        values in prop::collection::vec(-1000i64..1000, 2..10),
        split in 1usize..9,
    ) {
        let split = split.min(values.len() - 1);
        let as_json = |v: &[i64]| v.iter().map(|n| json!(*n as f64)).collect::<Vec<_>>();

        let mut one_batch = BinaryOperatorChannel::sum();
        one_batch.update(as_json(&values)).unwrap();

        let mut two_batches = BinaryOperatorChannel::sum();
        two_batches.update(as_json(&values[..split])).unwrap();
        two_batches.update(as_json(&values[split..])).unwrap();

        prop_assert_eq!(one_batch.get().unwrap(), two_batches.get().unwrap());
    }

    /// Append reduction preserves the concatenation across batch splits.
    #[test]
    fn append_reducer_associative(
        values in prop::collection::vec(any::<i64>(), 2..10),
        split in 1usize..9,
    ) {
        let split = split.min(values.len() - 1);
        let as_json = |v: &[i64]| v.iter().map(|n| json!([n])).collect::<Vec<_>>();

        let mut one_batch = BinaryOperatorChannel::append();
        one_batch.update(as_json(&values)).unwrap();

        let mut two_batches = BinaryOperatorChannel::append();
        two_batches.update(as_json(&values[..split])).unwrap();
        two_batches.update(as_json(&values[split..])).unwrap();

        prop_assert_eq!(one_batch.get().unwrap(), two_batches.get().unwrap());
    }

    /// Barrier availability depends only on the set of received names, not
    /// their arrival order.
    #[test]
    fn barrier_order_insensitive(perm in Just(vec!["a", "b", "c"]).prop_shuffle()) {
        let mut chan = NamedBarrierValueChannel::new(
            ["a".to_string(), "b".to_string(), "c".to_string()],
        );
        for name in &perm {
            chan.update(vec![json!(name)]).unwrap();
        }
        prop_assert!(chan.is_available());
        prop_assert_eq!(chan.get().unwrap(), json!(["a", "b", "c"]));
    }
}
