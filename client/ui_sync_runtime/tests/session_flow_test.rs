//! End-to-end flows through a whole [`Session`]: frames in, socket writes
//! and renderer notifications out.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use projection_ui_sync_runtime::serde_json::{Map, Value, json};
use projection_ui_sync_runtime::transport::SocketLog;
use projection_ui_sync_runtime::{
    BackoffPolicy, Change, ConnectionEvent, MemorySocket, MemoryStorage, Outcome, PageEvent,
    PatchOperation, Renderer, Session, StateManager, StorageType, StoreState, SyncConfig,
};

#[derive(Default)]
struct RecordingRenderer {
    changes: RefCell<Vec<Change>>,
    page_events: RefCell<Vec<PageEvent>>,
}

impl Renderer for RecordingRenderer {
    fn on_change(&self, change: &Change, _state: &StateManager) {
        self.changes.borrow_mut().push(change.clone());
    }

    fn on_page_event(&self, event: &PageEvent) {
        self.page_events.borrow_mut().push(event.clone());
    }
}

struct Harness {
    session: Rc<Session>,
    log: Rc<SocketLog>,
    renderer: Rc<RecordingRenderer>,
    start: Instant,
}

impl Harness {
    fn new(config: SyncConfig) -> Self {
        let (socket, log) = MemorySocket::new();
        let session = Session::new(
            config,
            Box::new(socket),
            Box::new(MemoryStorage::new()),
            Box::new(MemoryStorage::new()),
        );
        let renderer = Rc::new(RecordingRenderer::default());
        let _subscription = session.attach_renderer(renderer.clone());

        Self {
            session,
            log,
            renderer,
            start: Instant::now(),
        }
    }

    fn connected() -> Self {
        let harness = Self::new(SyncConfig::default());
        harness.session.connect(harness.start);
        harness.session.handle_open(harness.start);
        harness
    }

    fn at(&self, millis: u64) -> Instant {
        self.start + Duration::from_millis(millis)
    }

    fn frame(&self, frame: Value) {
        assert!(self.session.handle_frame(&frame.to_string()), "frame rejected: {frame}");
    }

    fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.log
            .sent_json()
            .into_iter()
            .filter(|message| message["type"] == kind)
            .collect()
    }
}

fn form_page() -> Value {
    json!({
        "type": "page_render",
        "component": {
            "type": "Page",
            "id": "root",
            "children": [
                {"type": "Text", "id": "txt", "props": {"value": "hi"}},
                {
                    "type": "Input",
                    "id": "search",
                    "props": {
                        "value": "",
                        "onInput": {
                            "kind": "callback",
                            "callbackId": "cb-search",
                            "debounce": 300,
                            "storeAs": "query"
                        }
                    }
                },
                {
                    "type": "Button",
                    "id": "go",
                    "props": {
                        "onClick": {"kind": "callback", "callbackId": "cb-go", "props": ["query"]}
                    }
                }
            ]
        }
    })
}

fn input(value: &str) -> Map<String, Value> {
    let mut event = Map::new();
    event.insert("value".to_string(), json!(value));
    event
}

#[test]
fn text_update_reaches_the_renderer() {
    let harness = Harness::connected();
    harness.frame(form_page());
    harness.renderer.changes.borrow_mut().clear();

    harness.frame(json!({
        "type": "update",
        "operation": "update_props",
        "targetId": "txt",
        "props": {"value": "bye"}
    }));

    let node = harness.session.state().node("txt").expect("txt mounted");
    assert_eq!(node.props["value"], "bye");
    assert_eq!(
        *harness.renderer.changes.borrow(),
        vec![Change::Tree {
            target_id: "txt".to_string(),
            operation: PatchOperation::UpdateProps,
            retired: Vec::new(),
        }]
    );
}

#[test]
fn typing_is_debounced_into_one_callback() {
    let harness = Harness::connected();
    harness.frame(form_page());

    for (offset, text) in [(0, "r"), (80, "ru"), (160, "rus"), (240, "rust")] {
        let outcome = harness
            .session
            .trigger("search", "onInput", &input(text), harness.at(offset));
        assert_eq!(outcome, Some(Outcome::Deferred));
        assert_eq!(harness.session.actions().store_value("query"), Some(json!(text)));
    }

    harness.session.poll(harness.at(539));
    assert!(harness.sent_of_type("callback").is_empty());

    harness.session.poll(harness.at(540));
    let callbacks = harness.sent_of_type("callback");
    assert_eq!(callbacks.len(), 1);
    assert_eq!(callbacks[0]["callbackId"], "cb-search");
    assert_eq!(callbacks[0]["data"]["value"], "rust");
}

#[test]
fn store_whitelist_travels_with_the_click() {
    let harness = Harness::connected();
    harness.frame(form_page());

    harness
        .session
        .trigger("search", "onInput", &input("crab"), harness.at(0));
    harness
        .session
        .trigger("go", "onClick", &Map::new(), harness.at(10));

    let callbacks = harness.sent_of_type("callback");
    assert_eq!(callbacks.len(), 1);
    assert_eq!(callbacks[0]["callbackId"], "cb-go");
    assert_eq!(callbacks[0]["propStore"], json!({"query": "crab"}));
}

#[test]
fn server_value_wins_over_pending_edit() {
    let harness = Harness::connected();
    harness.frame(form_page());

    harness
        .session
        .trigger("search", "onInput", &input("draft"), harness.at(0));
    harness.frame(json!({
        "type": "update",
        "operation": "update_props",
        "targetId": "search",
        "props": {"value": "canonical"}
    }));

    harness.session.poll(harness.at(10_000));
    assert!(harness.sent_of_type("callback").is_empty());
    assert_eq!(
        harness.session.actions().store_value("query"),
        Some(json!("canonical"))
    );
    assert!(harness
        .renderer
        .page_events
        .borrow()
        .contains(&PageEvent::ForceValueSync {
            target_id: "search".to_string(),
            value: json!("canonical"),
        }));
}

#[test]
fn store_updates_before_ready_apply_once_in_order() {
    let harness = Harness::connected();
    let persistent = harness.session.persistent();
    assert_eq!(persistent.state(), StoreState::AwaitingReady);
    assert_eq!(harness.sent_of_type("store_init").len(), 1);

    for value in ["one", "two", "three"] {
        harness.frame(json!({
            "type": "store_update",
            "updates": [
                {"storageType": "local", "operation": "set", "key": "k", "value": value},
                {"storageType": "session", "operation": "set", "key": value, "value": true}
            ]
        }));
    }
    assert_eq!(persistent.get(StorageType::Local, "k"), None);

    harness.frame(json!({"type": "store_ready"}));
    assert_eq!(persistent.get(StorageType::Local, "k").as_deref(), Some("three"));
    assert_eq!(persistent.get_all(StorageType::Session).len(), 3);

    harness.frame(json!({"type": "store_ready"}));
    assert_eq!(persistent.queued(), 0);
    assert_eq!(persistent.get(StorageType::Local, "k").as_deref(), Some("three"));
}

#[test]
fn reconnect_backs_off_then_gives_up() {
    let mut config = SyncConfig::default();
    config.reconnect.max_attempts = 3;
    config.reconnect.policy = BackoffPolicy::Exponential {
        base_ms: 100,
        factor: 2,
        max_ms: 10_000,
    };
    let harness = Harness::new(config);

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    let _subscription = harness
        .session
        .transport()
        .on_connection_change(move |event| sink.borrow_mut().push(event.clone()));

    harness.session.connect(harness.at(0));
    harness.session.handle_open(harness.at(0));

    let mut now = 0;
    harness.session.handle_close(harness.at(now));
    while let Some(deadline) = harness.session.next_deadline() {
        now = (deadline - harness.start).as_millis() as u64;
        harness.session.poll(deadline);
        harness.session.handle_error(harness.at(now), "refused");
        harness.session.handle_close(harness.at(now));
    }

    let delays: Vec<u64> = events
        .borrow()
        .iter()
        .filter_map(|event| match event {
            ConnectionEvent::Reconnecting { delay, .. } => Some(delay.as_millis() as u64),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![100, 200, 400]);
    assert_eq!(
        events.borrow().last(),
        Some(&ConnectionEvent::GaveUp { attempts: 3 })
    );
    assert_eq!(harness.log.opens(), 4);
    assert!(!harness.session.transport().is_connected());
}

#[test]
fn reconnect_restarts_the_store_handshake() {
    let harness = Harness::connected();
    harness.session.events().subscribe("presence");
    harness.frame(json!({"type": "store_ready"}));
    assert!(harness.session.persistent().is_ready());

    harness.session.handle_close(harness.at(5));
    let deadline = harness.session.next_deadline().expect("reconnect scheduled");
    harness.session.poll(deadline);
    harness.session.handle_open(deadline);

    assert_eq!(harness.session.persistent().state(), StoreState::AwaitingReady);
    assert_eq!(harness.sent_of_type("store_init").len(), 2);
    assert_eq!(harness.sent_of_type("subscribe").len(), 2);
}

#[test]
fn malformed_frames_do_not_block_later_ones() {
    let harness = Harness::connected();
    harness.frame(form_page());

    assert!(!harness.session.handle_frame("{"));
    assert!(!harness.session.handle_frame(r#"{"type":"teleport"}"#));
    harness.frame(json!({"type": "toast", "message": "still here"}));

    let events = harness.renderer.page_events.borrow();
    assert!(matches!(events.last(), Some(PageEvent::Toast(toast)) if toast.message == "still here"));
}

#[test]
fn renderer_may_trigger_from_inside_a_change() {
    struct Echo {
        session: RefCell<Option<std::rc::Weak<Session>>>,
        triggered: RefCell<u32>,
    }

    impl Renderer for Echo {
        fn on_change(&self, change: &Change, _state: &StateManager) {
            let Change::Tree { target_id, .. } = change else { return };
            if target_id != "txt" {
                return;
            }
            let session = self.session.borrow().as_ref().and_then(std::rc::Weak::upgrade);
            if let Some(session) = session {
                *self.triggered.borrow_mut() += 1;
                session.trigger("go", "onClick", &Map::new(), Instant::now());
            }
        }
    }

    let harness = Harness::connected();
    let echo = Rc::new(Echo {
        session: RefCell::new(Some(Rc::downgrade(&harness.session))),
        triggered: RefCell::new(0),
    });
    let _subscription = harness.session.attach_renderer(echo.clone());
    harness.frame(form_page());

    harness.frame(json!({
        "type": "update",
        "operation": "update_props",
        "targetId": "txt",
        "props": {"value": "again"}
    }));

    assert_eq!(*echo.triggered.borrow(), 1);
    assert_eq!(harness.sent_of_type("callback").len(), 1);
}

#[test]
fn removed_subtree_drops_pending_actions() {
    let harness = Harness::connected();
    harness.frame(form_page());
    harness
        .session
        .trigger("search", "onInput", &input("abc"), harness.at(0));

    harness.frame(json!({
        "type": "update",
        "operation": "update_children",
        "targetId": "root",
        "children": [{"type": "Text", "id": "txt", "props": {"value": "hi"}}]
    }));

    assert_eq!(harness.session.next_deadline(), None);
    let retired = harness.renderer.changes.borrow().iter().find_map(|change| match change {
        Change::Tree { retired, operation: PatchOperation::UpdateChildren, .. } => {
            Some(retired.clone())
        }
        _ => None,
    });
    let mut retired = retired.expect("update_children change");
    retired.sort();
    assert_eq!(retired, vec!["go", "search"]);
}
