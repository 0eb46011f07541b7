//! Connection lifecycle for the single socket a session talks through.
//!
//! ```text
//!                 connect()              open
//! Disconnected ─────────────> Connecting ─────> Connected
//!      ^                        │    ^              │
//!      │ disconnect() /         │    │ backoff      │ close / error
//!      │ attempts exhausted     v    │ elapsed      v
//!      └───────────────────── Reconnecting <────────┘
//! ```
//!
//! The transport performs no I/O of its own. The host owns the real socket
//! behind the [`Socket`] trait and reports what happened through
//! [`Transport::handle_open`], [`Transport::handle_close`] and
//! [`Transport::handle_error`]. Time is passed in, so the reconnect schedule
//! is driven by [`Transport::poll`] and is deterministic under test.

use crate::config::{ReconnectConfig, SyncConfig};
use crate::error::TransportError;
use crate::listeners::{Listeners, Subscription};
use crate::protocol::{OutboundMessage, encode_outbound};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The host's physical connection.
pub trait Socket {
    /// Starts connecting. Completion is reported through
    /// [`Transport::handle_open`] or a failure callback.
    fn open(&mut self, url: &str) -> Result<(), TransportError>;

    fn send(&mut self, frame: &str) -> Result<(), TransportError>;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed,
    Error { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
    Disconnected,
}

pub struct Transport {
    url: String,
    reconnect: ReconnectConfig,
    max_outbound_frame: usize,
    socket: RefCell<Box<dyn Socket>>,
    state: Cell<ConnectionState>,
    attempts: Cell<u32>,
    reconnect_at: Cell<Option<Instant>>,
    listeners: Listeners<ConnectionEvent>,
}

impl Transport {
    pub fn new(config: &SyncConfig, socket: Box<dyn Socket>) -> Self {
        Self {
            url: config.url.clone(),
            reconnect: config.reconnect.clone(),
            max_outbound_frame: config.max_outbound_frame,
            socket: RefCell::new(socket),
            state: Cell::new(ConnectionState::Disconnected),
            attempts: Cell::new(0),
            reconnect_at: Cell::new(None),
            listeners: Listeners::default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state.get(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.get()
    }

    /// Instant at which [`Transport::poll`] will start the next reconnect.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.reconnect_at.get()
    }

    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + 'static,
    {
        self.listeners.add(handler)
    }

    /// Opens the socket. A no-op while already connected or connecting.
    /// Starting from `Disconnected` begins a fresh attempt count.
    pub fn connect(&self, now: Instant) {
        match self.state.get() {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            ConnectionState::Disconnected => {
                self.attempts.set(0);
                self.open_socket(now);
            }
            ConnectionState::Reconnecting => {
                self.reconnect_at.set(None);
                self.open_socket(now);
            }
        }
    }

    /// Closes the socket and cancels any scheduled reconnect.
    pub fn disconnect(&self) {
        let previous = self.state.replace(ConnectionState::Disconnected);
        self.reconnect_at.set(None);
        self.socket.borrow_mut().close();

        if previous != ConnectionState::Disconnected {
            info!(url = %self.url, "transport disconnected");
            self.listeners.emit(&ConnectionEvent::Disconnected);
        }
    }

    pub fn handle_open(&self, _now: Instant) {
        if self.state.get() != ConnectionState::Connecting {
            debug!(state = ?self.state.get(), "ignoring open for a connection we no longer want");
            return;
        }

        self.state.set(ConnectionState::Connected);
        self.attempts.set(0);
        info!(url = %self.url, "transport connected");
        self.listeners.emit(&ConnectionEvent::Opened);
    }

    pub fn handle_close(&self, now: Instant) {
        if !self.is_live() {
            debug!(state = ?self.state.get(), "ignoring close");
            return;
        }

        info!(url = %self.url, "transport closed");
        self.listeners.emit(&ConnectionEvent::Closed);
        self.schedule_reconnect(now);
    }

    /// Browsers report a failed socket as error followed by close; only the
    /// first of the pair counts as a failure.
    pub fn handle_error(&self, now: Instant, reason: &str) {
        warn!(url = %self.url, reason, "transport error");
        self.listeners.emit(&ConnectionEvent::Error {
            reason: reason.to_string(),
        });

        if self.is_live() {
            self.schedule_reconnect(now);
        }
    }

    /// Starts the scheduled reconnect once its deadline has passed.
    pub fn poll(&self, now: Instant) {
        if self.state.get() != ConnectionState::Reconnecting {
            return;
        }

        match self.reconnect_at.get() {
            Some(deadline) if deadline <= now => {
                self.reconnect_at.set(None);
                info!(attempt = self.attempts.get(), url = %self.url, "reconnecting");
                self.open_socket(now);
            }
            _ => {}
        }
    }

    /// Writes one message if the socket is open. Never queues; the caller
    /// decides what a `false` means.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        match self.try_send(message) {
            Ok(()) => true,
            Err(err) => {
                debug!(kind = message.kind(), error = %err, "outbound message not sent");
                false
            }
        }
    }

    fn try_send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotOpen);
        }

        let frame = encode_outbound(message)?;
        if frame.len() > self.max_outbound_frame {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_outbound_frame,
            });
        }

        self.socket.borrow_mut().send(&frame)
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state.get(),
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    fn open_socket(&self, now: Instant) {
        self.state.set(ConnectionState::Connecting);
        let result = self.socket.borrow_mut().open(&self.url);

        if let Err(err) = result {
            warn!(url = %self.url, error = %err, "socket open failed");
            self.listeners.emit(&ConnectionEvent::Error {
                reason: err.to_string(),
            });
            self.schedule_reconnect(now);
        }
    }

    fn schedule_reconnect(&self, now: Instant) {
        self.socket.borrow_mut().close();

        if !self.reconnect.enabled {
            self.state.set(ConnectionState::Disconnected);
            self.listeners.emit(&ConnectionEvent::Disconnected);
            return;
        }

        let attempts = self.attempts.get();
        if attempts >= self.reconnect.max_attempts {
            self.state.set(ConnectionState::Disconnected);
            self.reconnect_at.set(None);
            warn!(attempts, url = %self.url, "giving up on reconnect");
            self.listeners.emit(&ConnectionEvent::GaveUp { attempts });
            return;
        }

        let attempt = attempts + 1;
        let delay = self.reconnect.policy.delay(attempt);
        self.attempts.set(attempt);
        self.state.set(ConnectionState::Reconnecting);
        self.reconnect_at.set(Some(now + delay));
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.listeners
            .emit(&ConnectionEvent::Reconnecting { attempt, delay });
    }
}

/// In-memory [`Socket`] for headless embedding and tests. Every call is
/// recorded in the shared [`SocketLog`].
pub struct MemorySocket {
    log: Rc<SocketLog>,
}

#[derive(Debug, Default)]
pub struct SocketLog {
    opens: Cell<u32>,
    closes: Cell<u32>,
    fail_open: Cell<bool>,
    fail_send: Cell<bool>,
    sent: RefCell<Vec<String>>,
}

impl MemorySocket {
    pub fn new() -> (Self, Rc<SocketLog>) {
        let log = Rc::new(SocketLog::default());
        (Self { log: log.clone() }, log)
    }
}

impl SocketLog {
    pub fn opens(&self) -> u32 {
        self.opens.get()
    }

    pub fn closes(&self) -> u32 {
        self.closes.get()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.set(fail);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.set(fail);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.borrow().clone()
    }

    /// Sent frames parsed back into JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .borrow()
            .iter()
            .filter_map(|frame| serde_json::from_str(frame).ok())
            .collect()
    }

    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }
}

impl Socket for MemorySocket {
    fn open(&mut self, _url: &str) -> Result<(), TransportError> {
        self.log.opens.set(self.log.opens.get() + 1);
        if self.log.fail_open.get() {
            return Err(TransportError::Socket("connection refused".to_string()));
        }
        Ok(())
    }

    fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        if self.log.fail_send.get() {
            return Err(TransportError::Socket("write failed".to_string()));
        }
        self.log.sent.borrow_mut().push(frame.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.log.closes.set(self.log.closes.get() + 1);
    }
}
