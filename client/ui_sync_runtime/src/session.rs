use crate::actions::{ActionEngine, Outcome};
use crate::bus::{EventBus, PageEvent};
use crate::config::SyncConfig;
use crate::events::EventManager;
use crate::listeners::Subscription;
use crate::persistent::PersistentStateManager;
use crate::protocol::Handle;
use crate::state::{Change, StateManager};
use crate::storage::Storage;
use crate::transport::{ConnectionEvent, Socket, Transport};
use serde_json::{Map, Value};
use std::rc::Rc;
use std::time::Instant;
use tracing::warn;

/// The external renderer. It only observes; every mutation goes through the
/// session.
pub trait Renderer {
    fn on_change(&self, change: &Change, state: &StateManager);

    fn on_page_event(&self, _event: &PageEvent) {}
}

/// One connected page: builds every manager, wires them together, and is
/// the single entry point the host drives.
pub struct Session {
    config: SyncConfig,
    transport: Rc<Transport>,
    events: Rc<EventManager>,
    state: Rc<StateManager>,
    bus: Rc<EventBus>,
    actions: Rc<ActionEngine>,
    persistent: Rc<PersistentStateManager>,
}

impl Session {
    pub fn new(
        config: SyncConfig,
        socket: Box<dyn Socket>,
        local: Box<dyn Storage>,
        session: Box<dyn Storage>,
    ) -> Rc<Self> {
        let transport = Rc::new(Transport::new(&config, socket));
        let events = Rc::new(EventManager::new(transport.clone(), &config));
        let state = Rc::new(StateManager::new());
        let bus = Rc::new(EventBus::new());
        let actions = Rc::new(ActionEngine::new(events.clone(), bus.clone()));
        let persistent = Rc::new(PersistentStateManager::new(events.clone(), local, session));

        // Registration order is dispatch order: local edits are reconciled
        // before the tree changes and the renderer hears about it.
        actions.attach(&events).detach();
        state.attach(&events).detach();
        persistent.attach(&events).detach();
        bus.attach(&events).detach();

        let session = Rc::new(Self {
            config,
            transport,
            events,
            state,
            bus,
            actions,
            persistent,
        });
        session.wire();
        session
    }

    fn wire(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        self.transport
            .on_connection_change(move |event| {
                let Some(session) = weak.upgrade() else { return };
                if *event == ConnectionEvent::Opened {
                    session.persistent.reset();
                    session.persistent.send_initial_state();
                    session.events.resubscribe();
                }
            })
            .detach();

        let actions = Rc::downgrade(&self.actions);
        self.state
            .on_change(move |change| {
                let Some(actions) = actions.upgrade() else { return };
                let retired = match change {
                    Change::Tree { retired, .. } | Change::Render { retired, .. } => retired,
                    Change::State { .. } => return,
                };
                for id in retired {
                    actions.teardown(id);
                }
            })
            .detach();
    }

    /// Hooks a renderer up to tree changes and page events.
    pub fn attach_renderer(self: &Rc<Self>, renderer: Rc<dyn Renderer>) -> Subscription {
        let state = Rc::downgrade(&self.state);
        let on_change = renderer.clone();
        let changes = self.state.on_change(move |change| {
            if let Some(state) = state.upgrade() {
                on_change.on_change(change, &state);
            }
        });
        let page_events = self.bus.subscribe(move |event| renderer.on_page_event(event));

        Subscription::new(move || {
            changes.unsubscribe();
            page_events.unsubscribe();
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn transport(&self) -> &Rc<Transport> {
        &self.transport
    }

    pub fn events(&self) -> &Rc<EventManager> {
        &self.events
    }

    pub fn state(&self) -> &Rc<StateManager> {
        &self.state
    }

    pub fn bus(&self) -> &Rc<EventBus> {
        &self.bus
    }

    pub fn actions(&self) -> &Rc<ActionEngine> {
        &self.actions
    }

    pub fn persistent(&self) -> &Rc<PersistentStateManager> {
        &self.persistent
    }

    pub fn connect(&self, now: Instant) {
        self.transport.connect(now);
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn handle_open(&self, now: Instant) {
        self.transport.handle_open(now);
    }

    pub fn handle_frame(&self, frame: &str) -> bool {
        self.events.handle_frame(frame)
    }

    pub fn handle_close(&self, now: Instant) {
        self.transport.handle_close(now);
    }

    pub fn handle_error(&self, now: Instant, reason: &str) {
        self.transport.handle_error(now, reason);
    }

    /// Runs whatever is due: reconnects and deferred dispatches.
    pub fn poll(&self, now: Instant) {
        self.transport.poll(now);
        self.actions.poll(now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.transport.next_deadline(), self.actions.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fires the handle stored in `prop` on component `target_id`.
    pub fn trigger(
        &self,
        target_id: &str,
        prop: &str,
        event: &Map<String, Value>,
        now: Instant,
    ) -> Option<Outcome> {
        let handle = self
            .state
            .with_tree(|tree| tree.find(target_id)?.props.get(prop).and_then(Handle::from_prop));

        match handle {
            Some(handle) => Some(self.actions.trigger(target_id, &handle, event, now)),
            None => {
                warn!(target_id, prop, "no handle to trigger");
                None
            }
        }
    }

    /// Unmounts the page: drops the tree and app state and every pending
    /// action on the controls that were mounted.
    pub fn clear(&self) {
        for id in self.state.clear() {
            self.actions.teardown(&id);
        }
    }
}
