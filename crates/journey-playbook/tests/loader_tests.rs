//! Playbook loading and integrity checks against on-disk definitions

use journey_playbook::{NodeId, Playbook, PlaybookError, TenantId, WorldId};
use pretty_assertions::assert_eq;
use std::io::Write;

fn write_definition(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

const THREE_WORLDS: &str = r#"{
    "playbook_id": "phd-cs",
    "version": "2.1.0",
    "locale_default": "en",
    "analytics": {"optional_world": "W3", "median_world": "W2"},
    "worlds": [
        {"id": "W1", "title": {"en": "Onboarding"}, "nodes": [
            {"id": "S1_profile", "type": "form", "next": ["S1_antiplag"]},
            {"id": "S1_antiplag", "type": "upload", "prerequisites": ["S1_profile"],
             "requirements": {"uploads": [
                {"key": "report", "required": true, "mime": ["application/pdf"]},
                {"key": "appendix", "multiplicity": "many"}
             ]}}
        ]},
        {"id": "W2", "nodes": [
            {"id": "W2_proposal", "prerequisites": ["S1_antiplag"]}
        ]},
        {"id": "W3", "nodes": [
            {"id": "W3_rp", "prerequisites": ["W2_proposal"]}
        ]}
    ]
}"#;

#[test]
fn loads_from_disk() {
    let file = write_definition(THREE_WORLDS);
    let tenant = TenantId::new();
    let pb = Playbook::from_path(tenant, file.path()).unwrap();

    assert_eq!(pb.playbook_id(), "phd-cs");
    assert_eq!(pb.version(), "2.1.0");
    assert_eq!(pb.tenant_id(), tenant);
    assert_eq!(
        pb.worlds().cloned().collect::<Vec<_>>(),
        vec![WorldId::new("W1"), WorldId::new("W2"), WorldId::new("W3")]
    );
    assert_eq!(pb.optional_world(), Some(&WorldId::new("W3")));
    assert_eq!(pb.median_world(), Some(&WorldId::new("W2")));
    assert_eq!(pb.nodes_in_world(&WorldId::new("W1")).len(), 2);
    assert_eq!(pb.upload_slots(&NodeId::new("S1_antiplag")).len(), 2);
    assert_eq!(pb.required_slots(&NodeId::new("S1_antiplag")).count(), 1);
}

#[test]
fn same_bytes_same_version_id() {
    let tenant = TenantId::new();
    let a = Playbook::from_json_str(tenant, THREE_WORLDS).unwrap();
    let b = Playbook::from_path(tenant, write_definition(THREE_WORLDS).path()).unwrap();
    assert_eq!(a.version_id(), b.version_id());
    assert_eq!(a.checksum(), b.checksum());
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Playbook::from_path(TenantId::new(), dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, PlaybookError::Io(_)));
    assert!(!err.is_integrity_failure());
}

#[test]
fn malformed_json_is_parse_error() {
    let err = Playbook::from_json_str(TenantId::new(), "{ not json").unwrap_err();
    assert!(matches!(err, PlaybookError::Parse(_)));
}

#[test]
fn duplicate_node_across_worlds() {
    let json = r#"{"playbook_id":"p","version":"1","worlds":[
        {"id":"W1","nodes":[{"id":"A"}]},
        {"id":"W2","nodes":[{"id":"A"}]}]}"#;
    let err = Playbook::from_json_str(TenantId::new(), json).unwrap_err();
    assert!(matches!(err, PlaybookError::DuplicateNode(id) if id.as_str() == "A"));
}

#[test]
fn duplicate_world() {
    let json = r#"{"playbook_id":"p","version":"1","worlds":[
        {"id":"W1","nodes":[{"id":"A"}]},
        {"id":"W1","nodes":[{"id":"B"}]}]}"#;
    let err = Playbook::from_json_str(TenantId::new(), json).unwrap_err();
    assert!(matches!(err, PlaybookError::DuplicateWorld(_)));
}

#[test]
fn empty_world() {
    let json = r#"{"playbook_id":"p","version":"1","worlds":[{"id":"W1","nodes":[]}]}"#;
    let err = Playbook::from_json_str(TenantId::new(), json).unwrap_err();
    assert!(matches!(err, PlaybookError::EmptyWorld(_)));
}

#[test]
fn colliding_slot_keys() {
    let json = r#"{"playbook_id":"p","version":"1","worlds":[{"id":"W1","nodes":[
        {"id":"A","requirements":{"uploads":[{"key":"k"},{"key":"k"}]}}]}]}"#;
    let err = Playbook::from_json_str(TenantId::new(), json).unwrap_err();
    assert!(matches!(err, PlaybookError::DuplicateSlot { slot_key, .. } if slot_key == "k"));
}

#[test]
fn prerequisite_cycle() {
    let json = r#"{"playbook_id":"p","version":"1","worlds":[{"id":"W1","nodes":[
        {"id":"A","prerequisites":["C"]},
        {"id":"B","prerequisites":["A"]},
        {"id":"C","prerequisites":["B"]}]}]}"#;
    let err = Playbook::from_json_str(TenantId::new(), json).unwrap_err();
    assert!(matches!(err, PlaybookError::Cycle(_)));
}

#[test]
fn analytics_world_must_exist() {
    let json = r#"{"playbook_id":"p","version":"1","analytics":{"median_world":"W9"},
        "worlds":[{"id":"W1","nodes":[{"id":"A"}]}]}"#;
    let err = Playbook::from_json_str(TenantId::new(), json).unwrap_err();
    assert!(matches!(err, PlaybookError::UnknownWorld(_)));
}
