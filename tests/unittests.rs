use std::time::{Duration, Instant};

use tangent_loom::commands::{CommandRow, execute_command};
use tangent_loom::config::{BranchConfig, CanvasConfig};
use tangent_loom::error::CanvasError;
use tangent_loom::graph_utils::branch::resolve_overlap;
use tangent_loom::graph_utils::graph::{MAIN_NODE_ID, Message, NodeId, NodeKind};
use tangent_loom::navigation::{Cursor, Direction};
use tangent_loom::persistence::persist::{self, AppStateFile};
use tangent_loom::persistence::settings::AppSettings;
use tangent_loom::services::BackendConfig;
use tangent_loom::services::analytics::{AnalyticsService, HttpAnalytics};
use tangent_loom::services::generation::{GenerateRequest, GenerationService, HttpGeneration};
use tangent_loom::services::persistence::{ChatRecord, ChatStore, HttpChatStore, LocalChatStore};
use tangent_loom::services::retry::RetryPolicy;
use tangent_loom::services::worker::{ServiceEvent, ServiceWorker, Services};
use tangent_loom::session::{CanvasSession, Debouncer, RetryAction};
use tangent_loom::stream::extract_code_blocks;
use tangent_loom::viewport::ViewState;
use tangent_loom::layout::LayoutMode;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Main node holding user / assistant / user
fn seeded_session() -> CanvasSession {
    let mut s = CanvasSession::new(CanvasConfig::default(), "Main");
    s.ingest_message(MAIN_NODE_ID, Message::user("What is a borrow checker?")).unwrap();
    s.ingest_message(MAIN_NODE_ID, Message::assistant("It enforces aliasing rules.")).unwrap();
    s.ingest_message(MAIN_NODE_ID, Message::user("Show me an example")).unwrap();
    s
}

fn contents(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.content.clone()).collect()
}

fn backend(uri: String) -> BackendConfig {
    BackendConfig {
        base_url: uri,
        model: "test-model".into(),
        temperature: 0.2,
        chat_type: "claude".into(),
        retry: RetryPolicy { max_retries: 2, delay: Duration::from_millis(5), timeout: Duration::from_secs(5) },
    }
}

fn pump_until(session: &mut CanvasSession, done: impl Fn(&CanvasSession) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        session.pump();
        if done(session) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn fork_at_middle_message_carries_prefix_context() {
    let mut s = seeded_session();
    let b = s.create_branch(MAIN_NODE_ID, 1, None).expect("branch should be created");
    let main = s.graph().get(MAIN_NODE_ID).unwrap();
    let node = s.graph().get(b).unwrap();

    assert_eq!(node.kind, NodeKind::Branch);
    assert_eq!(node.parent_id, Some(MAIN_NODE_ID));
    assert_eq!(node.parent_message_index, Some(1));
    assert_eq!(node.messages.len(), 1);
    assert_eq!(
        contents(&node.context_messages),
        vec![main.messages[0].content.clone(), main.messages[1].content.clone(), node.messages[0].content.clone()]
    );
}

#[test]
fn context_walk_matches_stored_context() {
    let mut s = seeded_session();
    let b = s.create_branch(MAIN_NODE_ID, 2, Some("Examples".into())).unwrap();
    s.ingest_message(b, Message::assistant("let r = &x;")).unwrap();
    let c = s.create_branch(b, 1, None).unwrap();
    s.ingest_message(c, Message::user("and mutable?")).unwrap();

    for id in [b, c] {
        let node = s.graph().get(id).unwrap();
        let walked = s.graph().context_for(id).unwrap();
        assert_eq!(contents(&walked), contents(&node.context_messages));
        assert!(s.graph().verify_context(id));
    }
    // Pinned title survives ingestion
    assert_eq!(s.graph().get(b).unwrap().title, "Examples");
}

#[test]
fn fork_index_out_of_range_is_rejected() {
    let mut s = seeded_session();
    let err = s.create_branch(MAIN_NODE_ID, 3, None).unwrap_err();
    assert!(matches!(err, CanvasError::GraphIntegrity { .. }));
    assert!(matches!(s.create_branch(99, 0, None), Err(CanvasError::MissingNode(99))));
    assert_eq!(s.graph().len(), 1);
}

#[test]
fn delete_cascades_to_exact_subtree() {
    let mut s = seeded_session();
    let b1 = s.create_branch(MAIN_NODE_ID, 0, None).unwrap();
    let b2 = s.create_branch(MAIN_NODE_ID, 2, None).unwrap();
    let c1 = s.create_branch(b1, 0, None).unwrap();
    let d1 = s.create_branch(c1, 0, None).unwrap();
    s.select_node(d1).unwrap();

    let mut removed = s.delete_node(b1).expect("delete should succeed");
    removed.sort();
    let mut expected = vec![b1, c1, d1];
    expected.sort();
    assert_eq!(removed, expected);
    assert!(s.graph().contains(b2));
    assert!(s.graph().contains(MAIN_NODE_ID));
    assert_eq!(s.graph().len(), 2);
    // Cursor on a deleted node falls back to the surviving parent
    assert_eq!(s.cursor().map(|c| c.node), Some(MAIN_NODE_ID));

    assert!(matches!(s.delete_node(MAIN_NODE_ID), Err(CanvasError::GraphIntegrity { .. })));
}

#[test]
fn repeated_branches_never_overlap() {
    let mut s = seeded_session();
    let threshold = s.config().branch.overlap_threshold();
    let ids: Vec<NodeId> = (0..6).map(|_| s.create_branch(MAIN_NODE_ID, 1, None).unwrap()).collect();
    let positions: Vec<_> = s.graph().nodes().map(|n| n.pos()).collect();
    for (i, a) in positions.iter().enumerate() {
        for b in positions.iter().skip(i + 1) {
            assert!(a.distance(*b) >= threshold, "{:?} and {:?} overlap", a, b);
        }
    }
    assert_eq!(s.graph().sibling_group(MAIN_NODE_ID, 1), ids);
}

#[test]
fn deleted_ids_are_never_reissued() {
    let mut s = seeded_session();
    let first = s.create_branch(MAIN_NODE_ID, 0, None).unwrap();
    s.delete_node(first).unwrap();
    let second = s.create_branch(MAIN_NODE_ID, 0, None).unwrap();
    assert_ne!(first, second);
    assert!(second > first);

    // Reloading seeds the counter past the highest surviving id
    let nodes = s.serialize_graph();
    let mut other = CanvasSession::new(CanvasConfig::default(), "Other");
    other.load_graph(nodes).unwrap();
    assert_eq!(other.graph().next_id(), second + 1);
}

#[test]
fn crowded_fork_falls_back_below_lowest_card() {
    let mut cfg = CanvasConfig::default();
    cfg.branch = BranchConfig { max_attempts: 1, ..BranchConfig::default() };
    let mut s = CanvasSession::new(cfg, "Main");
    s.ingest_message(MAIN_NODE_ID, Message::user("fan out")).unwrap();
    let threshold = s.config().branch.overlap_threshold();
    for _ in 0..8 {
        s.create_branch(MAIN_NODE_ID, 0, None).unwrap();
    }
    let positions: Vec<_> = s.graph().nodes().map(|n| n.pos()).collect();
    let mut closest = f32::MAX;
    for (i, a) in positions.iter().enumerate() {
        for b in positions.iter().skip(i + 1) {
            closest = closest.min(a.distance(*b));
        }
    }
    assert!(closest >= threshold, "closest pair {} under threshold {}", closest, threshold);

    // Every stepped candidate is taken, so the point lands one spacing under the lowest
    let cfg = BranchConfig { max_attempts: 2, ..BranchConfig::default() };
    let start = egui::Pos2::new(400.0, 0.0);
    let occupied: Vec<_> = (0..4).map(|i| egui::Pos2::new(400.0, i as f32 * cfg.overlap_threshold())).collect();
    let placed = resolve_overlap(start, &occupied, &cfg);
    assert_eq!(placed, egui::Pos2::new(400.0, 3.0 * cfg.overlap_threshold() + cfg.spacing));
}

#[test]
fn tree_layout_pads_siblings_at_same_fork() {
    let mut s = seeded_session();
    let b1 = s.create_branch(MAIN_NODE_ID, 1, None).unwrap();
    let b2 = s.create_branch(MAIN_NODE_ID, 1, None).unwrap();
    s.relayout_tree();

    let padding = s.config().layout.branch_padding;
    let (p1, p2) = (s.graph().get(b1).unwrap().pos(), s.graph().get(b2).unwrap().pos());
    assert_eq!(p1.x, p2.x);
    assert!(((p2.y - p1.y) - padding).abs() < 1e-3, "expected {} apart, got {}", padding, p2.y - p1.y);
}

#[test]
fn up_at_first_message_jumps_to_sibling_above() {
    let mut s = seeded_session();
    let upper = s.create_branch(MAIN_NODE_ID, 1, None).unwrap();
    let lower = s.create_branch(MAIN_NODE_ID, 1, None).unwrap();
    s.ingest_message(upper, Message::assistant("one more")).unwrap();
    assert!(s.graph().get(upper).unwrap().y < s.graph().get(lower).unwrap().y);

    s.select_message(lower, 0).unwrap();
    let cur = s.navigate(Direction::Up).expect("a sibling is above");
    assert_eq!(cur, Cursor { node: upper, message_index: 1 });

    // Down from the last message goes back to the top of the lower sibling
    let cur = s.navigate(Direction::Down).unwrap();
    assert_eq!(cur, Cursor { node: lower, message_index: 0 });
}

#[test]
fn right_cycles_through_children_round_robin() {
    let mut s = seeded_session();
    let b1 = s.create_branch(MAIN_NODE_ID, 0, None).unwrap();
    let b2 = s.create_branch(MAIN_NODE_ID, 2, None).unwrap();
    s.select_node(MAIN_NODE_ID).unwrap();

    assert_eq!(s.navigate(Direction::Right).map(|c| c.node), Some(b1));
    let back = s.navigate(Direction::Left).unwrap();
    assert_eq!(back, Cursor { node: MAIN_NODE_ID, message_index: 0 });
    assert_eq!(s.navigate(Direction::Right).map(|c| c.node), Some(b2));
    s.navigate(Direction::Left);
    assert_eq!(s.navigate(Direction::Right).map(|c| c.node), Some(b1));
    // Nothing further right of a leaf
    assert_eq!(s.navigate(Direction::Right), None);
}

#[test]
fn one_fenced_block_yields_one_preview() {
    let mut s = seeded_session();
    let ticket = s.ingest_begin(MAIN_NODE_ID).unwrap();
    assert!(s.ingest_delta(ticket, "Sure:\n```rust\n"));
    assert!(s.ingest_delta(ticket, "fn main() {\n    println!(\"hi\");\n}\n"));
    assert!(s.ingest_delta(ticket, "```\nThat prints hi."));
    let report = s.ingest_finish(ticket).unwrap();

    assert_eq!(report.previews.len(), 1);
    let preview = s.graph().get(report.previews[0]).unwrap();
    assert_eq!(preview.kind, NodeKind::Preview);
    assert_eq!(preview.parent_id, Some(MAIN_NODE_ID));
    assert_eq!(preview.messages.len(), 1);
    assert_eq!(preview.messages[0].content, "fn main() {\n    println!(\"hi\");\n}");
    assert_eq!(s.graph().nodes().filter(|n| n.kind == NodeKind::Preview).count(), 1);
}

#[test]
fn preview_content_is_trimmed() {
    let blocks = extract_code_blocks("```rust\n\n    let x = 1;   \n\n```");
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].code, "let x = 1;");
    assert!(extract_code_blocks("```\n   \n```").is_empty());
}

#[test]
fn previews_are_read_only() {
    let mut s = seeded_session();
    let report = s.ingest_message(MAIN_NODE_ID, Message::assistant("```py\nprint(1)\n```")).unwrap();
    let preview = report.previews[0];

    let err = s.ingest_message(preview, Message::user("edit")).unwrap_err();
    assert!(matches!(err, CanvasError::GraphIntegrity { .. }));
    assert!(matches!(s.send_message(preview, "hi"), Err(CanvasError::GraphIntegrity { .. })));
    assert!(matches!(s.regenerate(preview), Err(CanvasError::GraphIntegrity { .. })));
    assert!(execute_command(&mut s, &format!("SAY {} hello", preview)).is_err());

    let node = s.graph().get(preview).unwrap();
    assert_eq!(node.messages.len(), 1);
    assert!(!node.is_streaming());
    assert!(!s.is_generating(preview));
    // Branching off a preview is still allowed
    assert!(s.create_branch(preview, 0, None).is_ok());
}

#[test]
fn superseded_stream_drops_stale_deltas() {
    let mut s = seeded_session();
    let first = s.ingest_begin(MAIN_NODE_ID).unwrap();
    assert!(matches!(s.ingest_begin(MAIN_NODE_ID), Err(CanvasError::GenerationInFlight(_))));
    s.ingest_delta(first, "old");
    let second = s.ingest_restart(MAIN_NODE_ID).unwrap();
    assert!(!s.ingest_delta(first, "stale"));
    assert!(s.ingest_delta(second, "new"));
    assert!(matches!(s.ingest_finish(first), Err(CanvasError::UserAbort)));
    s.ingest_finish(second).unwrap();
    let main = s.graph().get(MAIN_NODE_ID).unwrap();
    assert_eq!(main.messages.last().map(|m| m.content.as_str()), Some("new"));
    assert!(!main.is_streaming());
}

#[test]
fn serialized_graph_loads_back_identically() {
    let mut s = seeded_session();
    let b = s.create_branch(MAIN_NODE_ID, 1, Some("Alt".into())).unwrap();
    s.create_branch(b, 0, None).unwrap();
    let nodes = s.serialize_graph();

    let mut other = CanvasSession::new(CanvasConfig::default(), "Other");
    other.load_graph(nodes.clone()).expect("valid node set");
    assert_eq!(other.serialize_graph(), nodes);

    // An orphan makes the whole set invalid and leaves the graph untouched
    let mut broken = nodes.clone();
    broken.retain(|n| n.id != b);
    assert!(other.load_graph(broken).is_err());
    assert_eq!(other.graph().len(), nodes.len());
}

#[test]
fn truncated_parent_clamps_fork_index_on_load() {
    let mut s = seeded_session();
    let b = s.create_branch(MAIN_NODE_ID, 2, None).unwrap();
    let mut nodes = s.serialize_graph();
    for n in nodes.iter_mut().filter(|n| n.id == MAIN_NODE_ID) {
        n.messages.truncate(1);
    }

    let mut other = CanvasSession::new(CanvasConfig::default(), "Other");
    other.load_graph(nodes).expect("fork index is repaired, not rejected");
    let node = other.graph().get(b).unwrap();
    assert_eq!(node.parent_message_index, Some(0));
    assert!(other.graph().verify_context(b));
    assert_eq!(node.context_messages[0].content, "What is a borrow checker?");
    assert_eq!(node.context_messages.len(), 1 + node.messages.len());
}

#[test]
fn debouncer_emits_last_value_after_quiet_period() {
    let t0 = Instant::now();
    let mut d = Debouncer::new(Duration::from_millis(300));
    d.push("bor", t0);
    d.push("borrow", t0 + Duration::from_millis(100));
    assert_eq!(d.poll(t0 + Duration::from_millis(350)), None);
    assert!(d.is_pending());
    assert_eq!(d.poll(t0 + Duration::from_millis(400)), Some("borrow".to_string()));
    assert!(!d.is_pending());
    assert_eq!(d.poll(t0 + Duration::from_secs(5)), None);
}

#[test]
fn failed_generation_offers_regenerate() {
    let mut s = seeded_session();
    let ticket = s.ingest_begin(MAIN_NODE_ID).unwrap();
    s.ingest_delta(ticket, "partial");
    s.apply_event(ServiceEvent::GenerationFailed {
        job: 1,
        ticket,
        error: CanvasError::TransientNetwork { message: "connection reset".into(), attempts: 4 },
    });

    let main = s.graph().get(MAIN_NODE_ID).unwrap();
    assert_eq!(main.messages.len(), 3);
    assert!(!main.is_streaming());
    let banner = s.banner().cloned().expect("banner shown");
    assert!(matches!(banner.retry, Some(RetryAction::Regenerate(MAIN_NODE_ID))));

    // No worker attached: the retry surfaces a transient error and leaves nothing streaming
    let err = s.retry_banner().unwrap_err();
    assert!(err.is_transient());
    assert!(!s.is_generating(MAIN_NODE_ID));
    assert!(s.banner().is_none());
}

#[test]
fn unsent_message_is_rolled_back() {
    let mut s = seeded_session();
    s.select_node(MAIN_NODE_ID).unwrap();
    let title = s.graph().get(MAIN_NODE_ID).unwrap().title.clone();

    let err = s.send_message(MAIN_NODE_ID, "anyone there?").unwrap_err();
    assert!(err.is_transient());
    let main = s.graph().get(MAIN_NODE_ID).unwrap();
    assert_eq!(main.messages.len(), 3);
    assert_eq!(main.context_messages.len(), 3);
    assert_eq!(main.title, title);
    assert!(!main.is_streaming());
    assert!(!s.is_generating(MAIN_NODE_ID));
    assert_eq!(s.cursor(), Some(Cursor { node: MAIN_NODE_ID, message_index: 2 }));
}

#[test]
fn service_events_update_session_state() {
    let mut s = seeded_session();
    s.apply_event(ServiceEvent::Failed { job: 9, label: "load topics", error: CanvasError::UserAbort });
    assert!(s.banner().is_none());

    s.apply_event(ServiceEvent::Failed { job: 9, label: "load topics", error: CanvasError::invalid_payload("no data available") });
    let banner = s.banner().cloned().unwrap();
    assert!(banner.message.contains("no data available"));
    assert!(banner.retry.is_none());
    s.dismiss_banner();

    s.apply_event(ServiceEvent::ChatSaved { job: 10, id: "chat-1".into() });
    assert_eq!(s.chat_id(), Some("chat-1"));
    s.apply_event(ServiceEvent::ChatDeleted { job: 11, id: "chat-1".into() });
    assert_eq!(s.chat_id(), None);

    // Topic modes need data first
    assert!(s.set_layout_mode(LayoutMode::Star).is_err());
    assert_eq!(s.layout_mode(), LayoutMode::Tree);
}

#[test]
fn commands_drive_the_session() {
    let mut s = seeded_session();
    let out = execute_command(&mut s, "BRANCH 1 1 Alternative; select 2; LIST").expect("commands succeed");
    assert!(out.mutated);
    assert_eq!(out.affected_nodes, 1);
    let titles: Vec<String> = out
        .rows
        .iter()
        .filter_map(|r| match r {
            CommandRow::Node { title, .. } => Some(title.clone()),
            _ => None,
        })
        .collect();
    assert!(titles.contains(&"Alternative".to_string()));
    assert_eq!(s.cursor().map(|c| c.node), Some(2));
    assert!(execute_command(&mut s, "FROBNICATE 1").is_err());
}

#[test]
fn state_file_round_trips_and_versions_list_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    assert!(persist::load_active_in(dir.path()).unwrap().is_none());

    let mut s = seeded_session();
    s.create_branch(MAIN_NODE_ID, 0, None).unwrap();
    let state = s.snapshot();
    persist::save_active_in(dir.path(), &state).unwrap();
    let loaded = persist::load_active_in(dir.path()).unwrap().expect("state present");
    assert_eq!(loaded.nodes, state.nodes);
    assert_eq!(loaded.title, state.title);

    let v = persist::save_versioned_in(dir.path(), &state).unwrap();
    let versions = persist::list_versions_in(dir.path()).unwrap();
    assert_eq!(versions.first(), Some(&v));
    assert!(versions.iter().all(|p| !p.ends_with("state.ron")));

    let mut restored = CanvasSession::new(CanvasConfig::default(), "Fresh");
    restored.restore(persist::load_from_path(&v).unwrap()).unwrap();
    assert_eq!(restored.serialize_graph(), state.nodes);
}

#[test]
fn topic_snapshot_without_data_restores_as_tree() {
    let s = seeded_session();
    let state = AppStateFile::from_runtime(None, "t", s.graph(), ViewState::default(), LayoutMode::Island);
    let mut restored = CanvasSession::new(CanvasConfig::default(), "Fresh");
    restored.restore(state).unwrap();
    assert_eq!(restored.layout_mode(), LayoutMode::Tree);
}

#[tokio::test]
async fn local_chat_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalChatStore::new(dir.path());
    let cancel = CancellationToken::new();
    let s = seeded_session();
    let mut record = s.chat_record();
    record.chat_id.clear();

    let id = store.save(&record, &cancel).await.unwrap();
    assert!(!id.is_empty());
    let list = store.list(&cancel).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, id);
    let loaded = store.load(&id, &cancel).await.unwrap();
    assert_eq!(loaded.nodes, record.nodes);
    assert!(loaded.last_modified.is_some());

    store.delete(&id, &cancel).await.unwrap();
    assert!(matches!(store.load(&id, &cancel).await, Err(CanvasError::InvalidPayload { .. })));
    assert!(store.load("../escape", &cancel).await.is_err());
}

#[tokio::test]
async fn unavailable_backend_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"response": "recovered"})))
        .expect(1)
        .mount(&server)
        .await;

    let svc = HttpGeneration::new(backend(server.uri())).unwrap();
    let req = GenerateRequest::from_context(&[Message::user("hi")], None, "test-model", 0.2, false);
    let out = svc.generate(req, &CancellationToken::new()).await.unwrap();
    assert_eq!(out, "recovered");
}

#[tokio::test]
async fn bad_request_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
        .expect(1)
        .mount(&server)
        .await;

    let svc = HttpGeneration::new(backend(server.uri())).unwrap();
    let req = GenerateRequest::from_context(&[Message::user("hi")], None, "nope", 0.2, false);
    let err = svc.generate(req, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CanvasError::InvalidPayload { .. }));
}

#[tokio::test]
async fn malformed_visualization_is_invalid_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/visualization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "points": [[0.0, 0.0]],
            "clusters": [0],
            "titles": ["a"],
            "topics": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let svc = HttpAnalytics::new(backend(server.uri())).unwrap();
    let err = svc.visualization("claude", &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CanvasError::InvalidPayload { .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn remote_chat_store_save_and_load() {
    let server = MockServer::start().await;
    let s = seeded_session();
    let record: ChatRecord = s.chat_record();
    Mock::given(method("POST"))
        .and(path("/api/chats/save"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true, "chatId": "abc"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/chats/load/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "data": {"chatId": "abc", "title": "Main", "nodes": record.nodes.clone()}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/chats/load/missing"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": false, "error": "not found"})))
        .mount(&server)
        .await;

    let store = HttpChatStore::new(backend(server.uri())).unwrap();
    let cancel = CancellationToken::new();
    assert_eq!(store.save(&record, &cancel).await.unwrap(), "abc");
    let loaded = store.load("abc", &cancel).await.unwrap();
    assert_eq!(loaded.chat_id, "abc");
    assert_eq!(loaded.nodes, record.nodes);
    assert!(matches!(store.load("missing", &cancel).await, Err(CanvasError::InvalidPayload { .. })));
}

// The worker owns its own runtime; these drive it from a plain thread like the UI does.
fn worker_session(uri: String, stream: bool, dir: &std::path::Path) -> CanvasSession {
    let settings = AppSettings {
        backend_url: uri,
        stream_responses: stream,
        max_retries: 1,
        retry_delay_ms: 5,
        request_timeout_ms: 5_000,
        autosave_override: Some(dir.to_path_buf()),
        ..AppSettings::default()
    };
    let mut s = CanvasSession::from_settings(&settings, "Main");
    let worker = ServiceWorker::spawn(Services::from_settings(&settings).unwrap()).unwrap();
    s.attach_worker(worker);
    s
}

#[test]
fn batch_generation_through_worker() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"response": "Try this:\n```python\nprint(1)\n```"})),
            )
            .mount(&server),
    );
    let dir = tempfile::tempdir().unwrap();
    let mut s = worker_session(server.uri(), false, dir.path());

    s.send_message(MAIN_NODE_ID, "print one").unwrap();
    assert!(s.is_generating(MAIN_NODE_ID));
    assert!(pump_until(&mut s, |s| !s.is_generating(MAIN_NODE_ID)), "generation did not finish");

    let main = s.graph().get(MAIN_NODE_ID).unwrap();
    assert_eq!(contents(&main.messages), vec!["print one".to_string(), "Try this:\n```python\nprint(1)\n```".to_string()]);
    let preview = s.graph().nodes().find(|n| n.kind == NodeKind::Preview).expect("preview node");
    assert_eq!(preview.messages[0].content, "print(1)");
    assert!(s.banner().is_none());
}

#[test]
fn streamed_generation_through_worker() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    let body = "data: {\"delta\":\"Hel\"}\n\ndata: {\"delta\":\"lo\"}\n\ndata: [DONE]\n\n";
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/event-stream").set_body_string(body))
            .mount(&server),
    );
    let dir = tempfile::tempdir().unwrap();
    let mut s = worker_session(server.uri(), true, dir.path());

    s.send_message(MAIN_NODE_ID, "greet me").unwrap();
    assert!(pump_until(&mut s, |s| !s.is_generating(MAIN_NODE_ID)), "stream did not finish");
    let main = s.graph().get(MAIN_NODE_ID).unwrap();
    assert_eq!(main.messages.last().map(|m| m.content.as_str()), Some("Hello"));
    assert!(!main.is_streaming());
}

#[test]
fn local_chats_through_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = worker_session("http://127.0.0.1:9".into(), false, dir.path());
    s.ingest_message(MAIN_NODE_ID, Message::user("keep me")).unwrap();

    s.save_chat().unwrap();
    assert!(pump_until(&mut s, |s| s.chat_id().is_some()), "save did not finish");
    s.list_chats().unwrap();
    assert!(pump_until(&mut s, |s| !s.chat_list().is_empty()), "list did not finish");
    assert_eq!(s.chat_list()[0].id, s.chat_id().unwrap());
}
