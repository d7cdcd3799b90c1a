use journey_core::audit::EventType;
use journey_core::transitions::{allowed_targets, check_transition, validate_transition};
use journey_core::{Actor, NodeState, PatchState, Role, TargetState, UserId};
use journey_playbook::NodeId;
use journey_test_utils::{Harness, LINEAR};
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = NodeState> {
    prop::sample::select(NodeState::ALL.to_vec())
}

fn any_role() -> impl Strategy<Value = Role> {
    prop::sample::select(Role::ALL.to_vec())
}

fn any_target() -> impl Strategy<Value = TargetState> {
    prop_oneof![
        any_state().prop_map(TargetState::Node),
        Just(TargetState::ApprovedWithComments),
    ]
}

#[test]
fn reviewers_reopen_done_work() {
    let check = |from, to: NodeState, role| validate_transition(from, to.into(), role);
    assert!(check(NodeState::Done, NodeState::NeedsFixes, Role::Advisor).is_ok());
    assert!(check(NodeState::Done, NodeState::Submitted, Role::Advisor).is_err());
    assert!(check(NodeState::Skipped, NodeState::Active, Role::Admin).is_ok());
}

proptest! {
    #[test]
    fn validate_agrees_with_allowed_targets(
        from in any_state(),
        to in any_target(),
        role in any_role(),
    ) {
        let res = validate_transition(from, to, role);
        let allowed = allowed_targets(from, role);

        if res.is_ok() {
            prop_assert!(allowed.contains(&to));
        } else {
            prop_assert!(!allowed.contains(&to));
        }
    }

    #[test]
    fn recorded_state_changes_are_all_allowed(
        steps in prop::collection::vec((any_role(), any_target()), 1..12),
    ) {
        let h = Harness::new(LINEAR);
        let s = h.student("Prop");
        let advisor = h.advisor_for(s);
        let actor_for = |role| match role {
            Role::Student => Actor::student(s),
            Role::Advisor => advisor,
            other => Actor::new(UserId::new(), other),
        };

        for (role, target) in steps {
            let _ = h.engine.patch_state(PatchState {
                tenant: h.tenant,
                student: s,
                actor: actor_for(role),
                node: NodeId::new("A"),
                target,
                expected_version: None,
            });
        }

        let instance = h
            .engine
            .get_by_student_node(h.tenant, s, &NodeId::new("A"))
            .unwrap()
            .unwrap();
        let mut state = NodeState::Active;
        for event in h.engine.events(instance.instance_id) {
            if event.event_type != EventType::StateChanged {
                continue;
            }
            let field = |key: &str| event.payload[key].as_str().unwrap_or_default().to_string();
            let from: NodeState = field("from").parse().unwrap();
            let to: NodeState = field("to").parse().unwrap();
            let target: TargetState = field("target").parse().unwrap();
            let role: Role = field("role").parse().unwrap();

            prop_assert_eq!(from, state);
            prop_assert_eq!(target.resolved(), to);
            prop_assert!(check_transition(from, target, role));
            state = to;
        }
        prop_assert_eq!(state, instance.state);
        prop_assert!(h.engine.verify_event_chain(instance.instance_id).is_ok());
    }
}
