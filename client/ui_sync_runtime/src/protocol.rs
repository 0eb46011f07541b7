use crate::error::ProtocolError;
use crate::tree::{Child, Component};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const CLIENT_TO_SERVER_CAP: usize = 65_536;
pub const SERVER_TO_CLIENT_CAP: usize = 1_048_576;

const MESSAGE_TYPES: &[&str] = &[
    "update",
    "state_update",
    "navigate",
    "toast",
    "event",
    "refresh",
    "store_update",
    "store_ready",
    "page_render",
    "js_exec",
    "resync_store",
    "bound_method_call",
];

const UPDATE_OPERATIONS: &[&str] = &[
    "replace",
    "append",
    "prepend",
    "remove",
    "update_props",
    "update_children",
    "append_prop",
];

/// One inbound directive from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum UpdateMessage {
    Update(TreePatch),
    StateUpdate {
        state: Map<String, Value>,
    },
    Navigate {
        path: String,
        #[serde(default)]
        replace: bool,
    },
    Toast(Toast),
    Event {
        name: String,
        #[serde(default)]
        data: Value,
    },
    Refresh,
    StoreUpdate {
        updates: Vec<StoreUpdate>,
    },
    StoreReady,
    PageRender {
        component: Component,
    },
    JsExec {
        code: String,
    },
    ResyncStore,
    BoundMethodCall(BoundMethodRef),
}

impl UpdateMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::StateUpdate { .. } => "state_update",
            Self::Navigate { .. } => "navigate",
            Self::Toast(_) => "toast",
            Self::Event { .. } => "event",
            Self::Refresh => "refresh",
            Self::StoreUpdate { .. } => "store_update",
            Self::StoreReady => "store_ready",
            Self::PageRender { .. } => "page_render",
            Self::JsExec { .. } => "js_exec",
            Self::ResyncStore => "resync_store",
            Self::BoundMethodCall(_) => "bound_method_call",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "operation",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum TreePatch {
    Replace {
        target_id: String,
        component: Component,
    },
    Append {
        target_id: String,
        #[serde(alias = "components")]
        component: Nodes,
    },
    Prepend {
        target_id: String,
        #[serde(alias = "components")]
        component: Nodes,
    },
    Remove {
        target_id: String,
    },
    UpdateProps {
        target_id: String,
        props: Map<String, Value>,
    },
    UpdateChildren {
        target_id: String,
        children: Vec<Child>,
    },
    AppendProp {
        target_id: String,
        prop: String,
        value: Value,
    },
}

impl TreePatch {
    pub fn target_id(&self) -> &str {
        match self {
            Self::Replace { target_id, .. }
            | Self::Append { target_id, .. }
            | Self::Prepend { target_id, .. }
            | Self::Remove { target_id }
            | Self::UpdateProps { target_id, .. }
            | Self::UpdateChildren { target_id, .. }
            | Self::AppendProp { target_id, .. } => target_id,
        }
    }

    pub fn operation(&self) -> PatchOperation {
        match self {
            Self::Replace { .. } => PatchOperation::Replace,
            Self::Append { .. } => PatchOperation::Append,
            Self::Prepend { .. } => PatchOperation::Prepend,
            Self::Remove { .. } => PatchOperation::Remove,
            Self::UpdateProps { .. } => PatchOperation::UpdateProps,
            Self::UpdateChildren { .. } => PatchOperation::UpdateChildren,
            Self::AppendProp { .. } => PatchOperation::AppendProp,
        }
    }
}

/// The `operation` discriminant of a [`TreePatch`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOperation {
    Replace,
    Append,
    Prepend,
    Remove,
    UpdateProps,
    UpdateChildren,
    AppendProp,
}

impl PatchOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Remove => "remove",
            Self::UpdateProps => "update_props",
            Self::UpdateChildren => "update_children",
            Self::AppendProp => "append_prop",
        }
    }
}

/// `append`/`prepend` accept a single child or a list of them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Nodes {
    Many(Vec<Child>),
    One(Child),
}

impl Nodes {
    pub fn into_vec(self) -> Vec<Child> {
        match self {
            Self::Many(children) => children,
            Self::One(child) => vec![child],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toast {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreOperation {
    Set,
    Delete,
    Clear,
}

/// One mutation of a persisted storage namespace. `encrypt` only marks `value`
/// as ciphertext produced by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreUpdate {
    pub storage_type: StorageType,
    pub operation: StoreOperation,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub encrypt: bool,
}

/// Where captured event data lands in the PropStore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreAs {
    /// Store the event's `value` field under this key.
    Key(String),
    /// Store each named event field under its own key.
    Fields(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRef {
    pub callback_id: String,
    #[serde(default)]
    pub bound_args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_as: Option<StoreAs>,
    #[serde(default)]
    pub store_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Vec<String>>,
}

impl CallbackRef {
    pub fn new(callback_id: impl Into<String>) -> Self {
        Self {
            callback_id: callback_id.into(),
            bound_args: Map::new(),
            debounce: None,
            throttle: None,
            store_as: None,
            store_only: false,
            props: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsCallbackRef {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundMethodRef {
    pub target_id: String,
    pub method_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Every handle the server can place in a prop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Handle {
    Callback(CallbackRef),
    Js(JsCallbackRef),
    BoundMethod(BoundMethodRef),
}

impl Handle {
    /// Reads a handle out of a prop value; anything else yields `None`.
    pub fn from_prop(value: &Value) -> Option<Self> {
        let kind = value.get("kind").and_then(Value::as_str)?;
        match serde_json::from_value(value.clone()) {
            Ok(handle) => Some(handle),
            Err(err) if matches!(kind, "callback" | "js" | "bound_method") => {
                warn!(kind, error = %err, "malformed handle prop");
                None
            }
            Err(err) => {
                debug!(kind, error = %err, "prop is not a handle");
                None
            }
        }
    }
}

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundMessage {
    Callback {
        callback_id: String,
        data: Value,
        bound_args: Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prop_store: Option<Map<String, Value>>,
    },
    Event {
        event_type: String,
        data: Value,
    },
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    StoreInit {
        local: BTreeMap<String, String>,
        session: BTreeMap<String, String>,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Callback { .. } => "callback",
            Self::Event { .. } => "event",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::StoreInit { .. } => "store_init",
        }
    }
}

pub fn callback_message(
    callback: &CallbackRef,
    data: Value,
    prop_store: Option<Map<String, Value>>,
) -> OutboundMessage {
    OutboundMessage::Callback {
        callback_id: callback.callback_id.clone(),
        data,
        bound_args: callback.bound_args.clone(),
        prop_store,
    }
}

pub fn encode_outbound(message: &OutboundMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Parses one inbound text frame.
///
/// The `type` and, for `update`, the `operation` discriminants are checked
/// before the payload so unknown directives are reported as such rather than
/// as generic decode failures.
pub fn decode_update_message(frame: &str, max_len: usize) -> Result<UpdateMessage, ProtocolError> {
    if frame.len() > max_len {
        return Err(ProtocolError::FrameTooLarge {
            len: frame.len(),
            max: max_len,
        });
    }

    let value: Value = serde_json::from_str(frame).map_err(ProtocolError::Decode)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    if kind == "update" {
        let operation = value
            .get("operation")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingOperation)?;

        if !UPDATE_OPERATIONS.contains(&operation) {
            return Err(ProtocolError::UnknownOperation(operation.to_string()));
        }
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
}
