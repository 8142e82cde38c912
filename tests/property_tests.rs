//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use mirror_engine::sync::{OffsetSync, TopicPartition};
use mirror_engine::task::PartitionState;
use proptest::prelude::*;

// Offsets live well below i64::MAX in practice; bounding them keeps the
// decision-rule arithmetic away from overflow, which is not a property under
// test here.
const MAX_OFFSET: i64 = 1 << 40;

// =============================================================================
// PartitionState Properties
// =============================================================================

proptest! {
    /// With no prior sync, any first update emits and pins both field pairs.
    #[test]
    fn partition_state_first_update_emits(
        upstream in 0i64..MAX_OFFSET,
        downstream in 0i64..MAX_OFFSET,
        lag in 0i64..100_000i64,
    ) {
        let mut state = PartitionState::new(lag);
        prop_assert!(state.update(upstream, downstream));
        prop_assert_eq!(state.last_sync_upstream_offset(), upstream);
        prop_assert_eq!(state.last_sync_downstream_offset(), downstream);
        prop_assert_eq!(state.previous_upstream_offset(), upstream);
        prop_assert_eq!(state.previous_downstream_offset(), downstream);
    }

    /// The previous-offset fields always track the latest inputs, emit or not;
    /// the last-sync fields move exactly when an emit fires.
    #[test]
    fn partition_state_update_postconditions(
        pairs in proptest::collection::vec((0i64..MAX_OFFSET, 0i64..MAX_OFFSET), 1..40),
        lag in 0i64..100_000i64,
    ) {
        let mut state = PartitionState::new(lag);
        for (upstream, downstream) in pairs {
            let before_sync = (
                state.last_sync_upstream_offset(),
                state.last_sync_downstream_offset(),
            );
            let emitted = state.update(upstream, downstream);

            prop_assert_eq!(state.previous_upstream_offset(), upstream);
            prop_assert_eq!(state.previous_downstream_offset(), downstream);
            if emitted {
                prop_assert_eq!(state.last_sync_upstream_offset(), upstream);
                prop_assert_eq!(state.last_sync_downstream_offset(), downstream);
            } else {
                prop_assert_eq!(
                    (state.last_sync_upstream_offset(), state.last_sync_downstream_offset()),
                    before_sync
                );
            }
        }
    }

    /// Perfectly linear commit sequences emit exactly once, on the first call.
    #[test]
    fn partition_state_linear_sequences_emit_once(
        start_upstream in 0i64..MAX_OFFSET,
        start_downstream in 0i64..MAX_OFFSET,
        len in 1usize..200,
        lag in 1i64..100_000i64,
    ) {
        let mut state = PartitionState::new(lag);
        let mut emits = 0;
        for i in 0..len as i64 {
            if state.update(start_upstream + i, start_downstream + i) {
                emits += 1;
            }
        }
        prop_assert_eq!(emits, 1);
    }

    /// Once synced at (u0, d0), any commit drifting >= lag from the linear
    /// prediction emits.
    #[test]
    fn partition_state_drift_always_emits(
        u0 in 0i64..MAX_OFFSET,
        d0 in 0i64..MAX_OFFSET,
        step in 1i64..1_000i64,
        extra_drift in 0i64..1_000_000i64,
        lag in 1i64..100_000i64,
    ) {
        let mut state = PartitionState::new(lag);
        prop_assert!(state.update(u0, d0));

        let upstream = u0 + step;
        let downstream = d0 + step + lag + extra_drift;
        prop_assert!(state.update(upstream, downstream));
        prop_assert_eq!(state.last_sync_upstream_offset(), upstream);
        prop_assert_eq!(state.last_sync_downstream_offset(), downstream);
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    /// Every encoded sync decodes back to itself.
    #[test]
    fn codec_roundtrip(
        topic in "[a-zA-Z0-9._-]{1,100}",
        partition in 0i32..100_000,
        upstream in any::<i64>(),
        downstream in any::<i64>(),
    ) {
        let sync = OffsetSync::new(TopicPartition::new(topic, partition), upstream, downstream);
        let decoded = OffsetSync::decode_record(&sync.encode_key(), &sync.encode_value()).unwrap();
        prop_assert_eq!(decoded, sync);
    }

    /// Trailing bytes never change what decodes.
    #[test]
    fn codec_ignores_trailing_bytes(
        topic in "[a-zA-Z0-9._-]{1,50}",
        partition in 0i32..10_000,
        upstream in any::<i64>(),
        downstream in any::<i64>(),
        trailing in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let sync = OffsetSync::new(TopicPartition::new(topic, partition), upstream, downstream);
        let mut value = sync.encode_value();
        value.extend_from_slice(&trailing);
        let decoded = OffsetSync::decode_record(&sync.encode_key(), &value).unwrap();
        prop_assert_eq!(decoded, sync);
    }

    /// The compaction key depends only on the topic-partition.
    #[test]
    fn codec_key_independent_of_offsets(
        topic in "[a-zA-Z0-9._-]{1,50}",
        partition in 0i32..10_000,
        offsets_a in (any::<i64>(), any::<i64>()),
        offsets_b in (any::<i64>(), any::<i64>()),
    ) {
        let tp = TopicPartition::new(topic, partition);
        let a = OffsetSync::new(tp.clone(), offsets_a.0, offsets_a.1);
        let b = OffsetSync::new(tp, offsets_b.0, offsets_b.1);
        prop_assert_eq!(a.encode_key(), b.encode_key());
    }

    /// Decoding arbitrary bytes never panics.
    #[test]
    fn codec_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
        let _ = OffsetSync::decode_record(&[], &bytes);
    }
}
