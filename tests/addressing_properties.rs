//! Property tests for queue naming.
//!
//! Queue names must be deterministic and must never collide for distinct
//! inputs, otherwise two conversations would silently share a queue.

use std::collections::HashMap;

use proptest::prelude::*;

use aide::addressing::{queue_name, QueueKind};
use aide::{ActionId, AgentId, Role};

// ─── Arbitrary Strategies ───────────────────────────────────────────────────

fn arb_kind() -> impl Strategy<Value = QueueKind> {
    prop::sample::select(QueueKind::ALL.to_vec())
}

fn arb_role() -> impl Strategy<Value = Role> {
    prop::sample::select(Role::ALL.to_vec())
}

fn arb_identifier() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,12}"
}

type Tuple = (QueueKind, String, Role, Role, String);

fn arb_tuple() -> impl Strategy<Value = Tuple> {
    (arb_kind(), arb_identifier(), arb_role(), arb_role(), arb_identifier())
}

fn name_of((kind, action, pusher, catcher, agent): &Tuple) -> String {
    let action = ActionId::new(action.as_str()).unwrap();
    let agent = AgentId::new(agent.as_str()).unwrap();
    queue_name(*kind, Some(&action), *pusher, *catcher, &agent)
}

/// The inputs that actually take part in the name.
fn significant(tuple: &Tuple) -> Tuple {
    let (kind, action, pusher, catcher, agent) = tuple.clone();
    let action = if kind.is_action_level() {
        action
    } else {
        String::new()
    };
    (kind, action, pusher, catcher, agent)
}

// ─── Properties ─────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn queue_name_is_deterministic(tuple in arb_tuple()) {
        prop_assert_eq!(name_of(&tuple), name_of(&tuple));
    }

    #[test]
    fn queue_name_segments_are_lowercase_and_non_empty(tuple in arb_tuple()) {
        let name = name_of(&tuple);
        prop_assert!(name.split('.').all(|segment| !segment.is_empty()));
        prop_assert_eq!(name.to_lowercase(), name.clone());
        let expected = if tuple.0.is_action_level() { 5 } else { 4 };
        prop_assert_eq!(name.split('.').count(), expected);
    }

    #[test]
    fn queue_name_is_injective(tuples in prop::collection::vec(arb_tuple(), 1..64)) {
        let mut seen: HashMap<String, Tuple> = HashMap::new();
        for tuple in &tuples {
            let name = name_of(tuple);
            if let Some(previous) = seen.insert(name.clone(), significant(tuple)) {
                prop_assert_eq!(previous, significant(tuple), "collision on {}", name);
            }
        }
    }

    #[test]
    fn uppercase_identifiers_are_rejected(id in "[a-z0-9]{0,5}[A-Z][a-zA-Z0-9]{0,5}") {
        prop_assert!(ActionId::new(id.as_str()).is_err());
        prop_assert!(AgentId::new(id.as_str()).is_err());
    }

    #[test]
    fn separator_in_identifier_is_rejected(left in arb_identifier(), right in arb_identifier()) {
        let id = format!("{left}.{right}");
        prop_assert!(ActionId::new(id.as_str()).is_err());
    }
}
