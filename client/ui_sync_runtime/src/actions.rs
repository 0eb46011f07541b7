//! Action execution: turns a user event on a control into PropStore writes
//! and, possibly later, a callback to the server.
//!
//! Every deferred dispatch lives in one slot keyed by `(target, callback)`.
//! A debounce slot holds the latest payload and fires after `delay` of quiet.
//! A throttle slot is the open window: the first event in an idle window
//! goes out immediately, later ones overwrite a single pending payload that
//! goes out when the window closes and opens the next window.
//! A callback that sets both `debounce` and `throttle` is debounced only;
//! the throttle window is ignored.

use crate::bus::{EventBus, PageEvent};
use crate::events::EventManager;
use crate::listeners::Subscription;
use crate::prop_store::PropStore;
use crate::protocol::{CallbackRef, Handle, StoreAs, TreePatch, UpdateMessage};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Callback handed to the transport; `sent` is false when the socket was
    /// closed.
    Dispatched { sent: bool },
    /// Held by a debounce or throttle timer.
    Deferred,
    /// `storeOnly`: PropStore updated, nothing dispatched.
    StoredOnly,
    /// Published on the page bus instead of going to the server.
    Forwarded,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct TimerKey {
    target_id: String,
    callback_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Debounce,
    Throttle(Duration),
}

#[derive(Debug)]
struct Slot {
    gate: Gate,
    callback: CallbackRef,
    deadline: Instant,
    payload: Option<Value>,
}

pub struct ActionEngine {
    events: Rc<EventManager>,
    bus: Rc<EventBus>,
    store: RefCell<PropStore>,
    bindings: RefCell<HashMap<String, Vec<StoreAs>>>,
    timers: RefCell<BTreeMap<TimerKey, Slot>>,
}

impl ActionEngine {
    pub fn new(events: Rc<EventManager>, bus: Rc<EventBus>) -> Self {
        Self {
            events,
            bus,
            store: RefCell::new(PropStore::new()),
            bindings: RefCell::new(HashMap::new()),
            timers: RefCell::new(BTreeMap::new()),
        }
    }

    /// Reconciles authoritative `update_props` against local edits.
    pub fn attach(self: &Rc<Self>, events: &EventManager) -> Subscription {
        let engine = Rc::downgrade(self);
        events.on_update(move |message| {
            let Some(engine) = engine.upgrade() else { return };
            if let UpdateMessage::Update(TreePatch::UpdateProps { target_id, props }) = message {
                engine.reconcile(target_id, props);
            }
        })
    }

    pub fn trigger(
        &self,
        target_id: &str,
        handle: &Handle,
        event: &Map<String, Value>,
        now: Instant,
    ) -> Outcome {
        match handle {
            Handle::Callback(callback) => self.trigger_callback(target_id, callback, event, now),
            Handle::Js(script) => {
                self.bus.publish(&PageEvent::Script {
                    code: script.code.clone(),
                });
                Outcome::Forwarded
            }
            Handle::BoundMethod(method) => {
                self.bus.publish(&PageEvent::BoundMethod(method.clone()));
                Outcome::Forwarded
            }
        }
    }

    pub fn trigger_callback(
        &self,
        target_id: &str,
        callback: &CallbackRef,
        event: &Map<String, Value>,
        now: Instant,
    ) -> Outcome {
        if let Some(store_as) = &callback.store_as {
            self.bind(target_id, store_as);
            let written = self.store.borrow_mut().capture(store_as, event);
            trace!(target_id, keys = ?written, "captured edit");
        }

        if callback.store_only {
            return Outcome::StoredOnly;
        }

        let payload = Value::Object(event.clone());
        let key = TimerKey {
            target_id: target_id.to_string(),
            callback_id: callback.callback_id.clone(),
        };

        if let Some(delay) = callback.debounce.filter(|ms| *ms > 0) {
            self.timers.borrow_mut().insert(
                key,
                Slot {
                    gate: Gate::Debounce,
                    callback: callback.clone(),
                    deadline: now + Duration::from_millis(delay),
                    payload: Some(payload),
                },
            );
            return Outcome::Deferred;
        }

        if let Some(window) = callback.throttle.filter(|ms| *ms > 0) {
            let window = Duration::from_millis(window);
            {
                let mut timers = self.timers.borrow_mut();
                if let Some(slot) = timers.get_mut(&key).filter(|slot| slot.deadline > now) {
                    slot.callback = callback.clone();
                    slot.payload = Some(payload);
                    return Outcome::Deferred;
                }
                timers.insert(
                    key,
                    Slot {
                        gate: Gate::Throttle(window),
                        callback: callback.clone(),
                        deadline: now + window,
                        payload: None,
                    },
                );
            }
            return self.dispatch(callback, payload);
        }

        self.dispatch(callback, payload)
    }

    /// Fires every timer due at `now`, earliest first. Returns how many
    /// callbacks were dispatched.
    pub fn poll(&self, now: Instant) -> usize {
        let mut due: Vec<(Instant, CallbackRef, Value)> = Vec::new();

        {
            let mut timers = self.timers.borrow_mut();
            let keys: Vec<TimerKey> = timers
                .iter()
                .filter(|(_, slot)| slot.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();

            for key in keys {
                let Some(slot) = timers.get_mut(&key) else { continue };
                let deadline = slot.deadline;
                match (slot.gate, slot.payload.take()) {
                    (Gate::Throttle(window), Some(payload)) => {
                        slot.deadline = now + window;
                        due.push((deadline, slot.callback.clone(), payload));
                    }
                    (Gate::Debounce, Some(payload)) => {
                        due.push((deadline, slot.callback.clone(), payload));
                        timers.remove(&key);
                    }
                    (_, None) => {
                        timers.remove(&key);
                    }
                }
            }
        }

        due.sort_by_key(|(deadline, _, _)| *deadline);
        let fired = due.len();
        for (_, callback, payload) in due {
            self.dispatch(&callback, payload);
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().values().map(|slot| slot.deadline).min()
    }

    pub fn has_pending(&self, target_id: &str) -> bool {
        self.timers
            .borrow()
            .iter()
            .any(|(key, slot)| key.target_id == target_id && slot.payload.is_some())
    }

    /// Drops the timer for one `(target, callback)` pair.
    pub fn cancel(&self, target_id: &str, callback_id: &str) -> bool {
        self.timers
            .borrow_mut()
            .remove(&TimerKey {
                target_id: target_id.to_string(),
                callback_id: callback_id.to_string(),
            })
            .is_some()
    }

    /// Forgets a control that left the tree: its timers and store bindings.
    pub fn teardown(&self, target_id: &str) {
        let cancelled = self.cancel_target(target_id);
        self.bindings.borrow_mut().remove(target_id);
        if cancelled > 0 {
            debug!(target_id, cancelled, "tore down pending actions");
        }
    }

    pub fn store_value(&self, key: &str) -> Option<Value> {
        self.store.borrow().get(key).cloned()
    }

    pub fn with_store<R>(&self, read: impl FnOnce(&PropStore) -> R) -> R {
        read(&self.store.borrow())
    }

    /// Applies an authoritative prop update to a target's local edits.
    ///
    /// Only an update that carries the value the control owns counts: the
    /// `value` prop, or a field named by one of the target's `Fields`
    /// bindings. Such an update cancels pending dispatches for the target
    /// and, if any were pending, publishes `ForceValueSync` so the control
    /// can replace what the user typed. Other updates leave timers alone.
    pub fn reconcile(&self, target_id: &str, props: &Map<String, Value>) {
        let bindings = self.bindings.borrow().get(target_id).cloned().unwrap_or_default();
        let Some(value) = owned_value(&bindings, props) else {
            return;
        };

        let had_pending = self.has_pending(target_id);
        self.cancel_target(target_id);
        {
            let mut store = self.store.borrow_mut();
            for store_as in &bindings {
                store.capture(store_as, props);
            }
        }

        if had_pending {
            debug!(target_id, "server value overrides pending edit");
            self.bus.publish(&PageEvent::ForceValueSync {
                target_id: target_id.to_string(),
                value,
            });
        }
    }

    fn bind(&self, target_id: &str, store_as: &StoreAs) {
        let mut bindings = self.bindings.borrow_mut();
        let entry = bindings.entry(target_id.to_string()).or_default();
        if !entry.contains(store_as) {
            entry.push(store_as.clone());
        }
    }

    fn cancel_target(&self, target_id: &str) -> usize {
        let mut timers = self.timers.borrow_mut();
        let before = timers.len();
        timers.retain(|key, _| key.target_id != target_id);
        before - timers.len()
    }

    fn dispatch(&self, callback: &CallbackRef, payload: Value) -> Outcome {
        let prop_store = callback
            .props
            .as_ref()
            .map(|keys| self.store.borrow().select(keys));

        self.bus.publish(&PageEvent::Callback {
            callback_id: callback.callback_id.clone(),
            data: payload.clone(),
        });

        let sent = self.events.invoke_callback(callback, payload, prop_store);
        Outcome::Dispatched { sent }
    }
}

/// The part of `props` a control owns: `value` itself, otherwise the bound
/// `Fields` entries present in the update.
fn owned_value(bindings: &[StoreAs], props: &Map<String, Value>) -> Option<Value> {
    if let Some(value) = props.get("value") {
        return Some(value.clone());
    }

    let fields: Map<String, Value> = bindings
        .iter()
        .filter_map(|store_as| match store_as {
            StoreAs::Fields(fields) => Some(fields.keys()),
            StoreAs::Key(_) => None,
        })
        .flatten()
        .filter_map(|field| Some((field.clone(), props.get(field)?.clone())))
        .collect();
    (!fields.is_empty()).then_some(Value::Object(fields))
}
