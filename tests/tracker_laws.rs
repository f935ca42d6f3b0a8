//! Property tests for the invariants the tracker's checkpoint/resume and
//! loop-reset operations are supposed to hold regardless of history.

#[macro_use]
extern crate proptest;

use proptest::prelude::*;

use dipeo_core::diagram::NodeId;
use dipeo_core::envelope::{Envelope, EnvelopeWire};
use dipeo_core::tracker::{Status, Tracker};

fn node_id_strategy() -> impl Strategy<Value = NodeId> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,8}")
        .unwrap()
        .prop_map(NodeId::new)
}

fn json_value_strategy() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        ".*".prop_map(serde_json::Value::from),
    ]
}

proptest! {
    /// `deserialize(serialize(env)) == env` holds for every envelope,
    /// across every body shape the wire format carries.
    #[test]
    fn envelope_wire_round_trip(
        produced_by in node_id_strategy(),
        text in ".*",
        body_is_text in any::<bool>(),
    ) {
        let trace = uuid::Uuid::new_v4();
        let env = if body_is_text {
            Envelope::text(text, produced_by, trace)
        } else {
            Envelope::object(serde_json::json!({ "text": text }), produced_by, trace)
        };
        let wire = env.to_wire();
        let json_str = serde_json::to_string(&wire).unwrap();
        let decoded: EnvelopeWire = serde_json::from_str(&json_str).unwrap();
        prop_assert_eq!(Envelope::from_wire(decoded), env);
    }

    /// `resetNode` rewinds status to PENDING but never touches the
    /// execution count built up by prior `RUNNING` transitions.
    #[test]
    fn reset_node_preserves_execution_count(
        id in node_id_strategy(),
        runs in 1..10_u64,
    ) {
        let tracker = Tracker::new(1_000);
        for epoch in 0..runs {
            tracker.transition_to_running(&id, epoch).unwrap();
            tracker.transition_to_completed(&id, None, None).unwrap();
        }
        let count_before = tracker.get_execution_count(&id);
        tracker.reset_node(&id);

        prop_assert_eq!(tracker.get_execution_count(&id), count_before);
        prop_assert_eq!(tracker.get_node_state(&id).unwrap().status, Status::Pending);
    }

    /// `initializeNode` only seeds a fresh PENDING entry; it never
    /// clobbers a node that has already moved past PENDING.
    #[test]
    fn initialize_node_does_not_clobber_existing_state(id in node_id_strategy()) {
        let tracker = Tracker::new(1_000);
        tracker.initialize_node(&id);
        tracker.initialize_node(&id);
        prop_assert_eq!(tracker.get_node_state(&id).unwrap().status, Status::Pending);

        tracker.transition_to_running(&id, 0).unwrap();
        tracker.transition_to_completed(&id, None, None).unwrap();
        tracker.initialize_node(&id);
        prop_assert_eq!(tracker.get_node_state(&id).unwrap().status, Status::Completed);
    }

    /// `loadStates(dump(tracker))` reproduces the same per-node status,
    /// execution count, and last output the dump was taken from.
    #[test]
    fn dump_and_load_round_trips_node_state(
        ids in prop::collection::vec(node_id_strategy(), 1..5),
        body in json_value_strategy(),
    ) {
        let source = Tracker::new(1_000);
        for (epoch, id) in ids.iter().enumerate() {
            source.transition_to_running(id, epoch as u64).unwrap();
            let output = Envelope::object(body.clone(), id.clone(), uuid::Uuid::new_v4());
            source.transition_to_completed(id, Some(output), Some(7)).unwrap();
        }

        let dump = source.dump();
        let restored = Tracker::new(1_000);
        restored.load_states(dump);

        for id in &ids {
            let before = source.get_node_state(id).unwrap();
            let after = restored.get_node_state(id).unwrap();
            prop_assert_eq!(before.status, after.status);
            prop_assert_eq!(source.get_execution_count(id), restored.get_execution_count(id));
            prop_assert_eq!(source.get_last_output(id), restored.get_last_output(id));
        }
    }
}
