use crate::events::EventManager;
use crate::listeners::{Listeners, Subscription};
use crate::protocol::{BoundMethodRef, Toast, UpdateMessage};
use serde_json::Value;
use std::rc::Rc;

/// Intra-page notifications. The runtime publishes these; presenting them is
/// up to whoever subscribes.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    Callback { callback_id: String, data: Value },
    ForceValueSync { target_id: String, value: Value },
    Toast(Toast),
    Navigate { path: String, replace: bool },
    ServerEvent { name: String, data: Value },
    Refresh,
    Script { code: String },
    BoundMethod(BoundMethodRef),
}

impl PageEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Callback { .. } => "callback",
            Self::ForceValueSync { .. } => "force-value-sync",
            Self::Toast(_) => "toast",
            Self::Navigate { .. } => "navigate",
            Self::ServerEvent { .. } => "server-event",
            Self::Refresh => "refresh",
            Self::Script { .. } => "script",
            Self::BoundMethod(_) => "bound-method",
        }
    }

    /// The page-level event for a presentation directive, if it is one.
    pub fn from_update(message: &UpdateMessage) -> Option<Self> {
        let event = match message {
            UpdateMessage::Toast(toast) => Self::Toast(toast.clone()),
            UpdateMessage::Navigate { path, replace } => Self::Navigate {
                path: path.clone(),
                replace: *replace,
            },
            UpdateMessage::Event { name, data } => Self::ServerEvent {
                name: name.clone(),
                data: data.clone(),
            },
            UpdateMessage::Refresh => Self::Refresh,
            UpdateMessage::JsExec { code } => Self::Script { code: code.clone() },
            UpdateMessage::BoundMethodCall(method) => Self::BoundMethod(method.clone()),
            UpdateMessage::Update(_)
            | UpdateMessage::StateUpdate { .. }
            | UpdateMessage::StoreUpdate { .. }
            | UpdateMessage::StoreReady
            | UpdateMessage::PageRender { .. }
            | UpdateMessage::ResyncStore => return None,
        };
        Some(event)
    }
}

#[derive(Default)]
pub struct EventBus {
    listeners: Listeners<PageEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PageEvent) + 'static,
    {
        self.listeners.add(handler)
    }

    pub fn publish(&self, event: &PageEvent) {
        tracing::trace!(event = event.name(), "page event");
        self.listeners.emit(event);
    }

    /// Forwards inbound presentation directives onto the bus.
    pub fn attach(self: &Rc<Self>, events: &EventManager) -> Subscription {
        let bus = Rc::downgrade(self);
        events.on_update(move |message| {
            let Some(bus) = bus.upgrade() else { return };
            if let Some(event) = PageEvent::from_update(message) {
                bus.publish(&event);
            }
        })
    }
}
