//! Saving and loading protocols and button panels on disk.

mod common;

use common::connected_session;
use katara_control::error::KataraError;
use katara_control::protocol::codec::PROTOCOL_MARKER;
use katara_control::protocol::{Action, Loop, Protocol, ProtocolPanel, Step, StepKind};
use std::fs;
use tempfile::tempdir;

fn deep_tree() -> Vec<Action> {
    vec![
        Step::set_valves("5, 6", "1").into(),
        Loop::new("2")
            .with_children(vec![
                Step::pause("0.5").into(),
                Loop::new("3")
                    .with_step_kinds(vec![StepKind::SetValves, StepKind::RunPump])
                    .with_children(vec![Loop::new("2")
                        .with_step_kinds(vec![StepKind::RunPump])
                        .with_children(vec![Step::run_pump(
                            "i[1] * 10",
                            "i[2] + 4",
                            ["i[0] + 10", "20", "21"],
                        )
                        .into()])
                        .into()])
                    .into(),
            ])
            .into(),
        Step::pause("inf").into(),
    ]
}

#[tokio::test]
async fn test_round_trip_of_nested_protocol() {
    let (session, _, _) = connected_session().await;
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested rinse.json");

    let mut protocol = Protocol::with_actions("nested rinse", deep_tree());
    protocol.save_to_path(&session, &path).unwrap();

    let loaded = Protocol::load_from_path(&path).unwrap();
    assert_eq!(loaded.name(), "nested rinse");
    assert_eq!(loaded.actions(), deep_tree().as_slice());
    assert!(loaded.is_writable());

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains(PROTOCOL_MARKER));
    assert!(text.contains("i[2] + 4"));
}

#[tokio::test]
async fn test_invalid_protocol_is_not_saved() {
    let (session, _, observer) = connected_session().await;
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");

    let mut protocol = Protocol::with_actions(
        "bad",
        vec![Loop::new("2")
            .with_children(vec![Step::set_valves("i[0] + 68", "1").into()])
            .into()],
    );
    let err = protocol.save_to_path(&session, &path).unwrap_err();
    assert!(matches!(err, KataraError::Validation { .. }));
    assert!(err.to_string().contains("i[0] = 2"), "{err}");
    assert!(!path.exists());
    assert_eq!(observer.validation_errors().len(), 1);

    let mut empty = Protocol::new("empty");
    assert!(empty.save(&session).is_err());
}

#[test]
fn test_load_rejects_unknown_kind_tags() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("evil.json");
    fs::write(
        &path,
        format!(r#"["{PROTOCOL_MARKER}", ["__import__('os').system", "rm"]]"#),
    )
    .unwrap();
    assert!(matches!(
        Protocol::load_from_path(&path),
        Err(KataraError::Persistence(_))
    ));

    fs::write(&path, "not json").unwrap();
    assert!(matches!(
        Protocol::load_from_path(&path),
        Err(KataraError::Json(_))
    ));
}

#[tokio::test]
async fn test_panel_round_trip_and_single_protocol_import() {
    let (session, _, _) = connected_session().await;
    let dir = tempdir().unwrap();

    let mut panel = ProtocolPanel::new();
    panel
        .add(Protocol::with_actions("deep", deep_tree()))
        .unwrap();
    panel
        .add(Protocol::with_actions("flush", vec![Step::set_valves("8", "0").into()]))
        .unwrap();
    let panel_path = dir.path().join("panel.json");
    panel.save_to_path(&session, &panel_path).unwrap();

    let loaded = ProtocolPanel::load_from_path(&panel_path, &session).unwrap();
    assert_eq!(loaded.names(), ["deep", "flush"]);
    assert_eq!(loaded.get("deep").unwrap().actions(), deep_tree().as_slice());

    let protocol_path = dir.path().join("warmup.json");
    let mut warmup = Protocol::with_actions("ignored", vec![Step::pause("1").into()]);
    warmup.save_to_path(&session, &protocol_path).unwrap();
    let imported = ProtocolPanel::load_from_path(&protocol_path, &session).unwrap();
    assert_eq!(imported.names(), ["warmup"]);
}

#[tokio::test]
async fn test_panel_with_invalid_protocol_is_not_saved() {
    let (session, _, observer) = connected_session().await;
    let dir = tempdir().unwrap();
    let path = dir.path().join("panel.json");

    let mut panel = ProtocolPanel::new();
    panel
        .add(Protocol::with_actions("flush", vec![Step::set_valves("8", "1").into()]))
        .unwrap();
    panel
        .add(Protocol::with_actions(
            "broken",
            vec![Step::run_pump("10", "5", ["4", "4", "7"]).into()],
        ))
        .unwrap();
    let err = panel.save_to_path(&session, &path).unwrap_err();
    assert!(matches!(err, KataraError::Validation { .. }), "{err}");
    assert!(!path.exists());
    assert_eq!(observer.validation_errors().len(), 1);

    let mut empty = ProtocolPanel::new();
    empty.add(Protocol::new("nothing")).unwrap();
    assert!(empty.save_to_path(&session, &path).is_err());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_panel_protocols_run_but_cannot_be_edited() {
    let (session, link, _) = connected_session().await;
    let mut panel = ProtocolPanel::new();
    panel
        .add(Protocol::with_actions("flush", vec![Step::set_valves("8", "1").into()]))
        .unwrap();

    let protocol = panel.get_mut("flush").unwrap();
    assert!(protocol.push(Step::pause("1")).is_err());
    protocol.run(&session).await.unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("panel.json");
    panel.save_to_path(&session, &path).unwrap();
    assert!(matches!(
        ProtocolPanel::load_from_path(&path, &session),
        Err(KataraError::Concurrency(_))
    ));

    let protocol = panel.get_mut("flush").unwrap();
    protocol.wait().await;
    assert_eq!(link.frames(), vec!["2081c".to_string()]);
    assert!(ProtocolPanel::load_from_path(&path, &session).is_ok());
}
