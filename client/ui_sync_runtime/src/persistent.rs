//! Mirrors the `local` and `session` storage namespaces with the server.
//!
//! The handshake is `store_init` (client snapshot) then `store_ready`
//! (server). Mutation batches that arrive before `store_ready` are queued and
//! applied, in arrival order, the moment the handshake completes.

use crate::error::StorageError;
use crate::events::EventManager;
use crate::listeners::{Listeners, Subscription};
use crate::protocol::{OutboundMessage, StorageType, StoreOperation, StoreUpdate, UpdateMessage};
use crate::storage::Storage;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    AwaitingReady,
    Ready,
}

pub struct PersistentStateManager {
    events: Rc<EventManager>,
    local: RefCell<Box<dyn Storage>>,
    session: RefCell<Box<dyn Storage>>,
    state: Cell<StoreState>,
    queue: RefCell<VecDeque<StoreUpdate>>,
    ready: Listeners<()>,
}

impl PersistentStateManager {
    pub fn new(
        events: Rc<EventManager>,
        local: Box<dyn Storage>,
        session: Box<dyn Storage>,
    ) -> Self {
        Self {
            events,
            local: RefCell::new(local),
            session: RefCell::new(session),
            state: Cell::new(StoreState::Uninitialized),
            queue: RefCell::new(VecDeque::new()),
            ready: Listeners::default(),
        }
    }

    pub fn attach(self: &Rc<Self>, events: &EventManager) -> Subscription {
        let manager = Rc::downgrade(self);
        events.on_update(move |message| {
            let Some(manager) = manager.upgrade() else { return };
            match message {
                UpdateMessage::StoreUpdate { updates } => manager.handle_updates(updates),
                UpdateMessage::StoreReady => manager.handle_ready(),
                UpdateMessage::ResyncStore => {
                    manager.resync();
                }
                _ => {}
            }
        })
    }

    pub fn state(&self) -> StoreState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.get() == StoreState::Ready
    }

    pub fn queued(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Runs `handler` on every transition to ready, and right away if the
    /// handshake has already completed.
    pub fn on_ready<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + 'static,
    {
        if self.is_ready() {
            handler();
        }
        self.ready.add(move |_| handler())
    }

    /// Sends both namespaces as `store_init`. Returns whether it was sent.
    pub fn send_initial_state(&self) -> bool {
        let message = OutboundMessage::StoreInit {
            local: self.local.borrow().entries(),
            session: self.session.borrow().entries(),
        };

        let sent = self.events.send(&message);
        if sent && self.state.get() == StoreState::Uninitialized {
            self.state.set(StoreState::AwaitingReady);
        }
        debug!(sent, state = ?self.state.get(), "store_init");
        sent
    }

    pub fn handle_ready(&self) {
        if self.is_ready() {
            debug!("duplicate store_ready ignored");
            return;
        }

        self.state.set(StoreState::Ready);
        let queued: Vec<StoreUpdate> = self.queue.borrow_mut().drain(..).collect();
        info!(flushed = queued.len(), "persistent store ready");
        for update in &queued {
            self.apply(update);
        }

        self.ready.emit(&());
    }

    pub fn handle_updates(&self, updates: &[StoreUpdate]) {
        if !self.is_ready() {
            self.queue.borrow_mut().extend(updates.iter().cloned());
            debug!(queued = self.queued(), "store updates held until ready");
            return;
        }

        for update in updates {
            self.apply(update);
        }
    }

    /// Back to `Uninitialized` for a new handshake. Updates still queued are
    /// kept and applied once the next `store_ready` arrives.
    pub fn reset(&self) {
        self.state.set(StoreState::Uninitialized);
        debug!(queued = self.queued(), "persistent store reset");
    }

    pub fn resync(&self) -> bool {
        self.reset();
        self.send_initial_state()
    }

    pub fn get(&self, storage_type: StorageType, key: &str) -> Option<String> {
        self.namespace(storage_type).borrow().get(key)
    }

    pub fn get_all(&self, storage_type: StorageType) -> BTreeMap<String, String> {
        self.namespace(storage_type).borrow().entries()
    }

    fn namespace(&self, storage_type: StorageType) -> &RefCell<Box<dyn Storage>> {
        match storage_type {
            StorageType::Local => &self.local,
            StorageType::Session => &self.session,
        }
    }

    fn apply(&self, update: &StoreUpdate) {
        if let Err(err) = self.try_apply(update) {
            warn!(
                storage = ?update.storage_type,
                key = %update.key,
                error = %err,
                "store update failed"
            );
        }
    }

    fn try_apply(&self, update: &StoreUpdate) -> Result<(), StorageError> {
        let mut storage = self.namespace(update.storage_type).borrow_mut();
        match update.operation {
            StoreOperation::Set => match &update.value {
                Some(value) => storage.set(&update.key, &stored_text(value)),
                None => {
                    warn!(key = %update.key, "store set without value ignored");
                    Ok(())
                }
            },
            StoreOperation::Delete => storage.remove(&update.key),
            StoreOperation::Clear => storage.clear(),
        }
    }
}

/// Strings are stored as-is, anything else as its JSON text.
fn stored_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::storage::MemoryStorage;
    use crate::transport::{MemorySocket, SocketLog, Transport};
    use serde_json::json;
    use std::time::Instant;

    fn manager(local: MemoryStorage) -> (Rc<PersistentStateManager>, Rc<SocketLog>) {
        let (socket, log) = MemorySocket::new();
        let config = SyncConfig::default();
        let transport = Rc::new(Transport::new(&config, Box::new(socket)));
        transport.connect(Instant::now());
        transport.handle_open(Instant::now());

        let events = Rc::new(EventManager::new(transport, &config));
        let manager = Rc::new(PersistentStateManager::new(
            events,
            Box::new(local),
            Box::new(MemoryStorage::new()),
        ));
        (manager, log)
    }

    fn set(storage_type: StorageType, key: &str, value: Value) -> StoreUpdate {
        StoreUpdate {
            storage_type,
            operation: StoreOperation::Set,
            key: key.to_string(),
            value: Some(value),
            encrypt: false,
        }
    }

    #[test]
    fn initial_state_carries_both_namespaces() {
        let local = MemoryStorage::from_entries(BTreeMap::from([(
            "theme".to_string(),
            "dark".to_string(),
        )]));
        let (manager, log) = manager(local);

        assert!(manager.send_initial_state());

        assert_eq!(manager.state(), StoreState::AwaitingReady);
        assert_eq!(
            log.sent_json()[0],
            json!({"type": "store_init", "local": {"theme": "dark"}, "session": {}})
        );
    }

    #[test]
    fn updates_wait_for_ready_then_apply_in_order() {
        let (manager, _log) = manager(MemoryStorage::new());
        manager.send_initial_state();

        manager.handle_updates(&[set(StorageType::Local, "k", json!("first"))]);
        manager.handle_updates(&[set(StorageType::Local, "k", json!("second"))]);
        assert_eq!(manager.get(StorageType::Local, "k"), None);
        assert_eq!(manager.queued(), 2);

        manager.handle_ready();
        assert_eq!(manager.get(StorageType::Local, "k").as_deref(), Some("second"));
        assert_eq!(manager.queued(), 0);

        manager.handle_ready();
        assert_eq!(manager.get(StorageType::Local, "k").as_deref(), Some("second"));
    }

    #[test]
    fn ready_callbacks_fire_on_ready_and_when_late() {
        let (manager, _log) = manager(MemoryStorage::new());
        let count = Rc::new(Cell::new(0));

        let early = count.clone();
        let _first = manager.on_ready(move || early.set(early.get() + 1));
        manager.send_initial_state();
        manager.handle_ready();
        assert_eq!(count.get(), 1);

        let late = count.clone();
        let _second = manager.on_ready(move || late.set(late.get() + 10));
        assert_eq!(count.get(), 11);
    }

    #[test]
    fn ready_before_init_still_completes() {
        let (manager, log) = manager(MemoryStorage::new());
        manager.handle_ready();
        assert!(manager.is_ready());

        assert!(manager.send_initial_state());
        assert!(manager.is_ready());
        assert_eq!(log.sent_json()[0]["type"], "store_init");
    }

    #[test]
    fn delete_and_clear_target_one_namespace() {
        let (manager, _log) = manager(MemoryStorage::new());
        manager.handle_ready();
        manager.handle_updates(&[
            set(StorageType::Local, "a", json!("1")),
            set(StorageType::Session, "b", json!("2")),
            set(StorageType::Session, "c", json!("3")),
            StoreUpdate {
                storage_type: StorageType::Local,
                operation: StoreOperation::Delete,
                key: "a".to_string(),
                value: None,
                encrypt: false,
            },
            StoreUpdate {
                storage_type: StorageType::Session,
                operation: StoreOperation::Clear,
                key: String::new(),
                value: None,
                encrypt: false,
            },
        ]);

        assert!(manager.get_all(StorageType::Local).is_empty());
        assert!(manager.get_all(StorageType::Session).is_empty());
    }

    #[test]
    fn non_string_values_are_stored_as_json() {
        let (manager, _log) = manager(MemoryStorage::new());
        manager.handle_ready();
        manager.handle_updates(&[set(StorageType::Local, "prefs", json!({"size": 2}))]);

        assert_eq!(
            manager.get(StorageType::Local, "prefs").as_deref(),
            Some(r#"{"size":2}"#)
        );
    }

    #[test]
    fn encrypted_values_pass_through_untouched() {
        let (manager, _log) = manager(MemoryStorage::new());
        manager.handle_ready();
        let mut update = set(StorageType::Local, "token", json!("b64:Zm9v"));
        update.encrypt = true;
        manager.handle_updates(&[update]);

        assert_eq!(manager.get(StorageType::Local, "token").as_deref(), Some("b64:Zm9v"));
    }

    #[test]
    fn quota_failure_is_local_and_later_updates_still_apply() {
        let (manager, log) = manager(MemoryStorage::with_quota(8));
        manager.handle_ready();
        manager.handle_updates(&[
            set(StorageType::Local, "big", json!("0123456789")),
            set(StorageType::Local, "ok", json!("1")),
        ]);

        assert_eq!(manager.get(StorageType::Local, "big"), None);
        assert_eq!(manager.get(StorageType::Local, "ok").as_deref(), Some("1"));
        assert!(log.sent().is_empty());
    }

    #[test]
    fn resync_resets_and_resends() {
        let (manager, log) = manager(MemoryStorage::new());
        manager.send_initial_state();
        manager.handle_ready();

        assert!(manager.resync());
        assert_eq!(manager.state(), StoreState::AwaitingReady);
        assert_eq!(log.sent().len(), 2);
    }

    #[test]
    fn queued_updates_survive_a_reset() {
        let (manager, _log) = manager(MemoryStorage::new());
        manager.send_initial_state();
        manager.handle_updates(&[set(StorageType::Local, "k", json!("v"))]);

        manager.reset();
        manager.send_initial_state();
        manager.handle_ready();

        assert_eq!(manager.get(StorageType::Local, "k").as_deref(), Some("v"));
    }

    #[test]
    fn init_on_closed_transport_stays_uninitialized() {
        let (manager, _log) = manager(MemoryStorage::new());
        manager.events.transport().disconnect();

        assert!(!manager.send_initial_state());
        assert_eq!(manager.state(), StoreState::Uninitialized);
    }
}
