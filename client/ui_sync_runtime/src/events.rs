use crate::config::SyncConfig;
use crate::listeners::{Listeners, Subscription};
use crate::protocol::{
    CallbackRef, OutboundMessage, UpdateMessage, callback_message, decode_update_message,
};
use crate::transport::Transport;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Turns local actions into outbound messages and fans inbound directives out
/// to every registered handler, in registration order, one message at a time.
pub struct EventManager {
    transport: Rc<Transport>,
    max_inbound_frame: usize,
    handlers: Listeners<UpdateMessage>,
    channels: RefCell<BTreeSet<String>>,
}

impl EventManager {
    pub fn new(transport: Rc<Transport>, config: &SyncConfig) -> Self {
        Self {
            transport,
            max_inbound_frame: config.max_inbound_frame,
            handlers: Listeners::default(),
            channels: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn transport(&self) -> &Rc<Transport> {
        &self.transport
    }

    pub fn on_update<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&UpdateMessage) + 'static,
    {
        self.handlers.add(handler)
    }

    pub fn send(&self, message: &OutboundMessage) -> bool {
        self.transport.send(message)
    }

    pub fn invoke_callback(
        &self,
        callback: &CallbackRef,
        data: Value,
        prop_store: Option<Map<String, Value>>,
    ) -> bool {
        let sent = self.send(&callback_message(callback, data, prop_store));
        if !sent {
            debug!(callback_id = %callback.callback_id, "callback not sent; transport closed");
        }
        sent
    }

    pub fn emit_event(&self, event_type: &str, data: Value) -> bool {
        self.send(&OutboundMessage::Event {
            event_type: event_type.to_string(),
            data,
        })
    }

    /// Joins a channel. Returns `false` when already a member; membership is
    /// kept even if the directive could not be sent and is replayed by
    /// [`EventManager::resubscribe`].
    pub fn subscribe(&self, channel: &str) -> bool {
        if !self.channels.borrow_mut().insert(channel.to_string()) {
            return false;
        }

        self.send(&OutboundMessage::Subscribe {
            channel: channel.to_string(),
        });
        true
    }

    pub fn unsubscribe(&self, channel: &str) -> bool {
        if !self.channels.borrow_mut().remove(channel) {
            return false;
        }

        self.send(&OutboundMessage::Unsubscribe {
            channel: channel.to_string(),
        });
        true
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.borrow().iter().cloned().collect()
    }

    /// Re-sends every channel membership; called after a reconnect.
    pub fn resubscribe(&self) -> usize {
        let channels = self.channels();
        channels
            .into_iter()
            .filter(|channel| {
                self.send(&OutboundMessage::Subscribe {
                    channel: channel.clone(),
                })
            })
            .count()
    }

    /// Message-received hook. Bad frames are logged and dropped so one
    /// malformed directive never stops the ones behind it.
    pub fn handle_frame(&self, frame: &str) -> bool {
        match decode_update_message(frame, self.max_inbound_frame) {
            Ok(message) => {
                self.dispatch(&message);
                true
            }
            Err(err) => {
                warn!(error = %err, "dropping inbound message");
                false
            }
        }
    }

    pub fn dispatch(&self, message: &UpdateMessage) {
        trace!(kind = message.kind(), handlers = self.handlers.len(), "dispatching");
        self.handlers.emit(message);
    }
}
