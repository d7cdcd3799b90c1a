//! Engine operations: submissions, attachments, reviews, resets and
//! failure handling

use chrono::Duration;
use journey_core::audit::EventType;
use journey_core::cancel::Cancellation;
use journey_core::collab::StudentDirectory;
use journey_core::config::EngineConfig;
use journey_core::notify::Recipient;
use journey_core::review::derive_state;
use journey_core::{
    Actor, AttachRequest, DocumentVersionId, JourneyError, NodeState, PatchState, PutSubmission,
    ReviewDecision, ReviewRequest, TargetState, UserId,
};
use journey_playbook::{NodeId, Playbook};
use journey_test_utils::{Harness, LINEAR, SINGLE_SLOT, TEN_NODES};
use pretty_assertions::assert_eq;
use serde_json::json;

fn put(
    h: &Harness,
    student: UserId,
    actor: Actor,
    node: &str,
    rev: Option<u32>,
) -> journey_core::Result<u32> {
    h.engine
        .put_submission(PutSubmission {
            tenant: h.tenant,
            student,
            actor,
            node: NodeId::new(node),
            locale: None,
            expected_rev: rev,
            payload: json!({ "topic": format!("draft {rev:?}") }),
            state: None,
        })
        .map(|saved| saved.new_rev)
}

#[test]
fn ensure_calls_are_idempotent() {
    let h = Harness::new(SINGLE_SLOT);
    let s = h.student("Aida");
    let node = NodeId::new("N");

    let first = h.engine.ensure_instance(h.tenant, s, &node, Some("ru")).unwrap();
    let second = h.engine.ensure_instance(h.tenant, s, &node, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(h.engine.events(first.instance_id).len(), 1);

    let slots = h.engine.ensure_slots(first.instance_id).unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(h.engine.ensure_slots(first.instance_id).unwrap(), slots);
}

#[test]
fn activate_next_is_repeatable() {
    let h = Harness::new(SINGLE_SLOT);
    let s = h.student("Aida");
    let admin = h.admin();
    h.patch(s, admin, "N", NodeState::Skipped).unwrap();
    let n = h
        .engine
        .get_by_student_node(h.tenant, s, &NodeId::new("N"))
        .unwrap()
        .unwrap();

    // skipped does not satisfy prerequisites by default
    assert!(h.engine.activate_next(n.instance_id, admin).unwrap().is_empty());

    let lenient = Harness::with_config(
        SINGLE_SLOT,
        EngineConfig::default().with_skipped_satisfies_prerequisites(true),
    );
    let s = lenient.student("Bolat");
    let patched = lenient.patch(s, admin, "N", NodeState::Skipped).unwrap();
    assert_eq!(patched.activated, vec![NodeId::new("M")]);
    let n = lenient
        .engine
        .get_by_student_node(lenient.tenant, s, &NodeId::new("N"))
        .unwrap()
        .unwrap();
    assert!(lenient.engine.activate_next(n.instance_id, admin).unwrap().is_empty());
    assert!(lenient.engine.activate_next(n.instance_id, admin).unwrap().is_empty());
}

#[test]
fn revisions_are_contiguous_from_one() {
    let h = Harness::new(SINGLE_SLOT);
    let s = h.student("Aida");
    let me = Actor::student(s);

    assert_eq!(put(&h, s, me, "N", None).unwrap(), 1);
    assert_eq!(put(&h, s, me, "N", Some(1)).unwrap(), 2);
    assert_eq!(put(&h, s, me, "N", None).unwrap(), 3);

    let err = put(&h, s, me, "N", Some(1)).unwrap_err();
    assert!(matches!(err, JourneyError::Conflict(_)));

    let view = h.engine.get_submission(h.tenant, s, &NodeId::new("N"), None).unwrap();
    assert_eq!(view.form.rev, 3);
    let revs: Vec<u32> = h
        .engine
        .store()
        .snapshot()
        .revisions(view.instance_id)
        .map(|r| r.rev)
        .collect();
    assert_eq!(revs, vec![1, 2, 3]);
    assert_eq!(h.engine.get_by_id(view.instance_id).unwrap().current_rev, 3);
}

#[test]
fn submission_rules() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    let advisor = h.advisor_for(s);

    let err = put(&h, s, advisor, "A", None).unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));

    let err = h
        .engine
        .put_submission(PutSubmission {
            tenant: h.tenant,
            student: s,
            actor: Actor::student(s),
            node: NodeId::new("A"),
            locale: None,
            expected_rev: None,
            payload: json!("not an object"),
            state: None,
        })
        .unwrap_err();
    assert!(matches!(err, JourneyError::Invalid(_)));

    h.patch(s, Actor::student(s), "A", NodeState::Submitted).unwrap();
    let err = put(&h, s, Actor::student(s), "A", None).unwrap_err();
    assert!(matches!(err, JourneyError::Conflict(_)));

    let err = put(&h, s, Actor::student(s), "missing", None).unwrap_err();
    assert!(matches!(err, JourneyError::NotFound(_)));
}

#[test]
fn profile_form_is_mirrored_after_commit() {
    let h = Harness::new(TEN_NODES);
    let s = h.student("Aida");
    let save = |payload| {
        h.engine.put_submission(PutSubmission {
            tenant: h.tenant,
            student: s,
            actor: Actor::student(s),
            node: NodeId::new("S1_profile"),
            locale: None,
            expected_rev: None,
            payload,
            state: None,
        })
    };

    save(json!({"program": "PhD CS", "cohort": 2024, "bio": "..."})).unwrap();
    let record = h.directory.student(h.tenant, s).unwrap();
    assert_eq!(record.program.as_deref(), Some("PhD CS"));
    assert_eq!(record.cohort.as_deref(), Some("2024"));

    h.directory.fail_next_mirrors(1);
    let saved = save(json!({"program": "PhD Math"})).unwrap();
    assert_eq!(saved.new_rev, 2);
    let record = h.directory.student(h.tenant, s).unwrap();
    assert_eq!(record.program.as_deref(), Some("PhD CS"));
}

#[test]
fn attach_validations() {
    let h = Harness::with_config(SINGLE_SLOT, EngineConfig::default().with_max_upload_bytes(1_000));
    let s = h.student("Aida");
    let instance = h.engine.ensure_instance(h.tenant, s, &NodeId::new("N"), None).unwrap();
    let slot = h.engine.get_slot(instance.instance_id, "k").unwrap();
    let request = |filename: &str, size_bytes, mime: &str, document, actor| AttachRequest {
        slot_id: slot.slot_id,
        document_version_id: document,
        filename: filename.to_string(),
        size_bytes,
        mime: Some(mime.to_string()),
        actor,
    };
    let me = Actor::student(s);
    let pdf = "application/pdf";

    let err = h.engine.attach(request(" ", 10, pdf, h.document(), me)).unwrap_err();
    assert!(matches!(err, JourneyError::Invalid(_)));
    let err = h.engine.attach(request("f.pdf", 1_001, pdf, h.document(), me)).unwrap_err();
    assert!(matches!(err, JourneyError::Invalid(_)));
    let err = h
        .engine
        .attach(request("f.doc", 10, "application/msword", h.document(), me))
        .unwrap_err();
    assert!(matches!(err, JourneyError::Invalid(_)));
    let err = h
        .engine
        .attach(request("f.pdf", 10, pdf, DocumentVersionId::new(), me))
        .unwrap_err();
    assert!(matches!(err, JourneyError::NotFound(_)));
    let err = h
        .engine
        .attach(request("f.pdf", 10, pdf, h.document(), h.advisor_for(s)))
        .unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));
    let other = Actor::student(UserId::new());
    let err = h.engine.attach(request("f.pdf", 10, pdf, h.document(), other)).unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));

    let first = h.engine.attach(request("v1.pdf", 10, pdf, h.document(), me)).unwrap();
    let second = h.engine.attach(request("v2.pdf", 1_000, pdf, h.document(), me)).unwrap();
    let view = h.engine.get_slot(instance.instance_id, "k").unwrap();
    assert_eq!(view.attachments.len(), 1);
    assert_eq!(view.attachments[0].attachment_id, second.attachment_id);

    let err = h
        .engine
        .review_attachment(ReviewRequest {
            attachment_id: first.attachment_id,
            decision: ReviewDecision::Approved,
            note: None,
            actor: h.admin(),
        })
        .unwrap_err();
    assert!(matches!(err, JourneyError::PreconditionFailed(_)));

    h.patch(s, h.admin(), "N", NodeState::Skipped).unwrap();
    let err = h.engine.attach(request("v3.pdf", 10, pdf, h.document(), me)).unwrap_err();
    assert!(matches!(err, JourneyError::Conflict(_)));
}

#[test]
fn role_checks() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    let stranger = Actor::advisor(UserId::new());

    let err = h.patch(s, Actor::student(UserId::new()), "A", NodeState::Submitted).unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));
    let err = h.patch(s, stranger, "A", NodeState::UnderReview).unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));
    let err = h.patch(s, Actor::student(s), "A", NodeState::Done).unwrap_err();
    assert_eq!(
        err,
        JourneyError::Forbidden(
            "role 'student' may not move a node from 'active' to 'done'".to_string()
        )
    );
    let err = h.patch(s, h.advisor_for(s), "A", NodeState::Skipped).unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));

    assert_eq!(
        h.patch(s, h.admin(), "A", NodeState::Skipped).unwrap().new_state,
        NodeState::Skipped
    );
    let err = h.patch(s, h.admin(), "A", NodeState::Skipped).unwrap_err();
    assert!(matches!(err, JourneyError::Conflict(_)));
    assert_eq!(
        h.patch(s, h.admin(), "A", NodeState::Active).unwrap().new_state,
        NodeState::Active
    );
}

#[test]
fn stale_version_is_a_conflict() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    let a = h.engine.ensure_instance(h.tenant, s, &NodeId::new("A"), None).unwrap();
    let request = |expected_version| PatchState {
        tenant: h.tenant,
        student: s,
        actor: Actor::student(s),
        node: NodeId::new("A"),
        target: TargetState::Node(NodeState::Submitted),
        expected_version,
    };
    let err = h.engine.patch_state(request(Some(a.version + 7))).unwrap_err();
    assert!(matches!(err, JourneyError::Conflict(_)));
    let patched = h.engine.patch_state(request(Some(a.version))).unwrap();
    assert_eq!(patched.version, a.version + 1);
}

#[test]
fn approved_with_comments_lands_in_done_with_outcome() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    let advisor = h.advisor_for(s);
    h.patch(s, Actor::student(s), "A", NodeState::Submitted).unwrap();
    h.patch(s, advisor, "A", NodeState::UnderReview).unwrap();

    let patched = h
        .engine
        .patch_state(PatchState {
            tenant: h.tenant,
            student: s,
            actor: advisor,
            node: NodeId::new("A"),
            target: TargetState::ApprovedWithComments,
            expected_version: None,
        })
        .unwrap();
    assert_eq!(patched.new_state, NodeState::Done);

    let view = h.engine.get_submission(h.tenant, s, &NodeId::new("A"), None).unwrap();
    assert_eq!(view.outcomes.len(), 1);
    assert_eq!(view.outcomes[0].value, "approved_with_comments");

    let outcome = h
        .engine
        .record_outcome(view.instance_id, "accepted", Some("minor edits"), advisor)
        .unwrap();
    assert_eq!(outcome.note.as_deref(), Some("minor edits"));
    let err = h
        .engine
        .record_outcome(view.instance_id, "accepted", None, Actor::student(s))
        .unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));
}

#[test]
fn submission_notifies_advisors_and_admin_channel() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    let advisor = h.advisor_for(s);
    h.patch(s, Actor::student(s), "A", NodeState::Submitted).unwrap();

    let to_advisor = h.notifier.delivered_to(Recipient::User(advisor.id));
    assert_eq!(to_advisor.len(), 1);
    assert_eq!(to_advisor[0].title, "New submission: Step A");
    assert_eq!(h.notifier.delivered_to(Recipient::AdminChannel).len(), 1);

    h.notifier.fail_next(10);
    let patched = h.patch(s, advisor, "A", NodeState::Done).unwrap();
    assert_eq!(patched.new_state, NodeState::Done);
    assert!(h.notifier.delivered_to(Recipient::User(s)).is_empty());
}

#[test]
fn review_state_matches_latest_attachment() {
    let h = Harness::new(SINGLE_SLOT);
    let s = h.student("Aida");
    let advisor = h.advisor_for(s);
    let first = h.upload(s, "N", "k", "f.pdf").unwrap();
    h.patch(s, Actor::student(s), "N", NodeState::Submitted).unwrap();

    let review = |attachment_id, decision| {
        h.engine.review_attachment(ReviewRequest {
            attachment_id,
            decision,
            note: None,
            actor: advisor,
        })
    };
    let rejected = review(first.attachment_id, ReviewDecision::Rejected).unwrap();
    assert_eq!(rejected.node_state, NodeState::NeedsFixes);
    let approved = review(first.attachment_id, ReviewDecision::Approved).unwrap();
    assert_eq!(approved.node_state, NodeState::Done);
    let err = h
        .engine
        .review_attachment(ReviewRequest {
            attachment_id: first.attachment_id,
            decision: ReviewDecision::Approved,
            note: None,
            actor: Actor::student(s),
        })
        .unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));

    let snapshot = h.engine.store().snapshot();
    let instance = snapshot.instance(first.instance_id).unwrap();
    assert_eq!(
        derive_state(snapshot.attachments_of_instance(first.instance_id)),
        Some(instance.state)
    );
}

#[test]
fn reviewed_copy_is_bound_without_status_change() {
    let h = Harness::new(SINGLE_SLOT);
    let s = h.student("Aida");
    let advisor = h.advisor_for(s);
    let attachment = h.upload(s, "N", "k", "f.pdf").unwrap();

    let err = h
        .engine
        .upload_reviewed_document(attachment.attachment_id, DocumentVersionId::new(), advisor)
        .unwrap_err();
    assert!(matches!(err, JourneyError::NotFound(_)));
    let err = h
        .engine
        .upload_reviewed_document(attachment.attachment_id, h.document(), Actor::student(s))
        .unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));

    let marked = h.document();
    h.engine
        .upload_reviewed_document(attachment.attachment_id, marked, advisor)
        .unwrap();
    let slot = h.engine.get_slot(attachment.instance_id, "k").unwrap();
    assert_eq!(slot.attachments[0].reviewed_version_id, Some(marked));
    assert_eq!(slot.attachments[0].status, journey_core::AttachmentStatus::Submitted);
    assert_eq!(
        h.engine.events(attachment.instance_id).last().unwrap().event_type,
        EventType::ReviewedDocumentUploaded
    );
}

#[test]
fn event_log_is_chained_and_monotonic() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    let advisor = h.advisor_for(s);
    let a = h.engine.ensure_instance(h.tenant, s, &NodeId::new("A"), None).unwrap();
    h.patch(s, Actor::student(s), "A", NodeState::Submitted).unwrap();
    h.clock.advance(Duration::days(-2));
    h.patch(s, advisor, "A", NodeState::Done).unwrap();

    let events = h.engine.events(a.instance_id);
    assert_eq!(h.engine.verify_event_chain(a.instance_id).unwrap(), events.len());
    assert!(events.windows(2).all(|pair| pair[0].at <= pair[1].at));
}

#[test]
fn transient_commit_failure_is_retried_once() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    let a = h.engine.ensure_instance(h.tenant, s, &NodeId::new("A"), None).unwrap();

    h.engine.store().fail_next_commits(1);
    h.patch(s, Actor::student(s), "A", NodeState::Submitted).unwrap();

    h.engine.store().fail_next_commits(2);
    let err = h.patch(s, h.advisor_for(s), "A", NodeState::UnderReview).unwrap_err();
    assert!(matches!(err, JourneyError::Transient(_)));
    assert_eq!(h.engine.get_by_id(a.instance_id).unwrap().state, NodeState::Submitted);
    let changes = h
        .engine
        .events(a.instance_id)
        .iter()
        .filter(|e| e.event_type == EventType::StateChanged)
        .count();
    assert_eq!(changes, 1);
}

#[test]
fn cancelled_calls_leave_no_trace() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    h.engine.ensure_instance(h.tenant, s, &NodeId::new("A"), None).unwrap();

    let token = Cancellation::new();
    let scoped = h.engine.with_cancellation(token.clone());
    token.cancel();
    let err = scoped
        .patch_state(PatchState {
            tenant: h.tenant,
            student: s,
            actor: Actor::student(s),
            node: NodeId::new("A"),
            target: TargetState::Node(NodeState::Submitted),
            expected_version: None,
        })
        .unwrap_err();
    assert_eq!(err, JourneyError::Cancelled);
    assert_eq!(
        h.engine.journey_state(h.tenant, s)[&NodeId::new("A")],
        NodeState::Active
    );
    assert!(matches!(scoped.list_progress(h.tenant), Err(JourneyError::Cancelled)));
}

#[test]
fn reset_returns_everything_but_profile_to_active() {
    let h = Harness::new(TEN_NODES);
    let s = h.student("Aida");
    let advisor = h.advisor_for(s);
    h.complete(s, advisor, "S1_profile").unwrap();
    h.complete(s, advisor, "S1_antiplag").unwrap();
    h.patch(s, Actor::student(s), "W1_plan", NodeState::Submitted).unwrap();

    let err = h.engine.reset_journey(h.tenant, s, advisor).unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));

    let reset = h.engine.reset_journey(h.tenant, s, h.admin()).unwrap();
    assert_eq!(reset, 2);

    let journey = h.engine.journey_state(h.tenant, s);
    assert_eq!(journey.len(), 1);
    assert_eq!(journey[&NodeId::new("S1_profile")], NodeState::Done);

    let snapshot = h.engine.store().snapshot();
    for instance in snapshot.instances_of(h.tenant, s) {
        let expected = if instance.node_id.as_str() == "S1_profile" {
            NodeState::Done
        } else {
            NodeState::Active
        };
        assert_eq!(instance.state, expected);
    }
    let report = h.engine.verify_projection(h.tenant).unwrap();
    assert!(report.is_consistent(), "{report:?}");
    assert_eq!(report.checked, 3);
}

#[test]
fn new_playbook_version_syncs_peer_instances() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    let old = h.engine.ensure_instance(h.tenant, s, &NodeId::new("A"), None).unwrap();

    let v2 = LINEAR.replace("\"1.0.0\"", "\"1.1.0\"");
    let active = h
        .catalog
        .publish_active(Playbook::from_json_str(h.tenant, &v2).unwrap());
    assert_ne!(active.version_id(), old.playbook_version_id);

    let patched = h.patch(s, Actor::student(s), "A", NodeState::Submitted).unwrap();
    assert_eq!(patched.version, 2);

    let peer = h.engine.get_by_id(old.instance_id).unwrap();
    assert_eq!(peer.state, NodeState::Submitted);
    let last = h.engine.events(old.instance_id).pop().unwrap();
    assert_eq!(last.event_type, EventType::StateSynced);
    assert!(h.engine.verify_projection(h.tenant).unwrap().is_consistent());
}

#[test]
fn form_save_can_move_the_node_in_the_same_commit() {
    let h = Harness::new(LINEAR);
    let s = h.student("Aida");
    let advisor = h.advisor_for(s);
    let save = |actor, node: &str, state: Option<NodeState>| {
        h.engine.put_submission(PutSubmission {
            tenant: h.tenant,
            student: s,
            actor,
            node: NodeId::new(node),
            locale: None,
            expected_rev: None,
            payload: json!({ "topic": "Sorption kinetics" }),
            state: state.map(TargetState::Node),
        })
    };

    let saved = save(Actor::student(s), "A", Some(NodeState::Submitted)).unwrap();
    assert_eq!((saved.new_rev, saved.state), (1, NodeState::Submitted));
    assert!(saved.activated.is_empty());
    assert_eq!(h.notifier.delivered_to(Recipient::User(advisor.id)).len(), 1);
    let a = h.engine.get_by_student_node(h.tenant, s, &NodeId::new("A")).unwrap().unwrap();
    let kinds: Vec<_> = h.engine.events(a.instance_id).iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds[kinds.len() - 2..].to_vec(),
        vec![EventType::SubmissionSaved, EventType::StateChanged]
    );

    // the current state is a no-op
    let kept = save(Actor::student(s), "B", Some(NodeState::Active)).unwrap();
    assert_eq!((kept.new_rev, kept.state), (1, NodeState::Active));

    // a refused transition discards the revision too
    let err = save(Actor::student(s), "B", Some(NodeState::Done)).unwrap_err();
    assert!(matches!(err, JourneyError::Forbidden(_)));
    let b = h.engine.get_submission(h.tenant, s, &NodeId::new("B"), None).unwrap();
    assert_eq!(b.form.rev, 1);

    h.complete(s, advisor, "B").unwrap();
    h.patch(s, advisor, "A", NodeState::NeedsFixes).unwrap();
    let done = save(h.admin(), "A", Some(NodeState::Done)).unwrap();
    assert_eq!((done.new_rev, done.state), (2, NodeState::Done));
    assert_eq!(done.activated, vec![NodeId::new("C")]);
}
