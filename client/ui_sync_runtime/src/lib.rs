//! Client-side sync runtime for server-owned UI trees.
//!
//! A [`Session`] keeps a local [`ComponentTree`] consistent with the tree the
//! server computes, streamed as patches over one long-lived socket. It owns:
//!
//! - [`Transport`]: connection lifecycle and reconnect backoff,
//! - [`EventManager`]: outbound callbacks/events and inbound fan-out,
//! - [`StateManager`]: the tree and the flat app-state map,
//! - [`ActionEngine`]: PropStore capture, debounce/throttle, force-value-sync,
//! - [`PersistentStateManager`]: the `store_init`/`store_ready` handshake.
//!
//! The crate does no I/O. The host supplies a [`Socket`] and two [`Storage`]
//! namespaces, feeds socket events in, and calls [`Session::poll`] at
//! [`Session::next_deadline`].

pub mod actions;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod listeners;
pub mod persistent;
pub mod prop_store;
pub mod protocol;
pub mod session;
pub mod state;
pub mod storage;
pub mod transport;
pub mod tree;

pub use crate::actions::{ActionEngine, Outcome};
pub use crate::bus::{EventBus, PageEvent};
pub use crate::config::{BackoffPolicy, ReconnectConfig, SyncConfig};
pub use crate::error::{ConfigError, PatchError, ProtocolError, StorageError, TransportError};
pub use crate::events::EventManager;
pub use crate::listeners::Subscription;
pub use crate::persistent::{PersistentStateManager, StoreState};
pub use crate::prop_store::PropStore;
pub use crate::protocol::{
    CLIENT_TO_SERVER_CAP, CallbackRef, Handle, OutboundMessage, PatchOperation,
    SERVER_TO_CLIENT_CAP, StorageType, StoreAs, StoreUpdate, TreePatch, UpdateMessage,
};
pub use crate::session::{Renderer, Session};
pub use crate::state::{Change, StateManager};
pub use crate::storage::{MemoryStorage, Storage};
pub use crate::transport::{ConnectionEvent, ConnectionState, MemorySocket, Socket, Transport};
pub use crate::tree::{Child, Component, ComponentTree};
pub use serde_json;
