use thiserror::Error;

/// Faults raised by the socket layer. They never escape [`crate::Transport`];
/// they drive the reconnect state machine and end up in the log.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket is not open")]
    NotOpen,

    #[error("socket failure: {0}")]
    Socket(String),

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Inbound frames that cannot be turned into an [`crate::UpdateMessage`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame is not valid json: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("message has no string `type` field")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("update message has no string `operation` field")]
    MissingOperation,

    #[error("unknown update operation '{0}'")]
    UnknownOperation(String),

    #[error("malformed '{kind}' message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Reasons a tree patch is rejected. A rejected patch leaves the tree as it was.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("no component tree has been rendered yet")]
    NoTree,

    #[error("target '{0}' not found")]
    TargetNotFound(String),

    #[error("duplicate component id '{0}'")]
    DuplicateId(String),

    #[error("prop '{prop}' on '{target_id}' is not a list")]
    NotAList { target_id: String, prop: String },
}

/// Browser-storage faults. Logged locally, never reported to the server.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage quota exceeded while writing '{key}' ({needed} > {quota} bytes)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        quota: usize,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    InvalidVar { var: &'static str, value: String },

    #[error("invalid config document: {0}")]
    Document(#[from] serde_json::Error),
}
