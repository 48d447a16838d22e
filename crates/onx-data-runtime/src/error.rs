use crate::Guid;

/// Error taxonomy of the asset runtime.
#[derive(thiserror::Error, Debug)]
pub enum AssetError {
    /// Handle is empty or points at a freed slot.
    #[error("invalid handle")]
    Invalid,

    /// Handle version no longer matches the slot (asset was removed).
    #[error("stale handle (asset was removed)")]
    Stale,

    /// Handle or value type differs from the pool's type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Guid or type is unknown to storage, index or registry.
    #[error("'{0}' not found")]
    NotFound(Guid),

    /// A value for this guid is already stored.
    #[error("asset '{0}' is already present")]
    AlreadyPresent(Guid),

    #[error("asset type '{0}' is not registered")]
    TypeNotRegistered(String),

    /// I/O failure while reading or writing asset files.
    #[error("asset '{guid}' io error: {source}")]
    IOError {
        guid: Guid,
        #[source]
        source: std::io::Error,
    },

    /// Malformed payload or meta file.
    #[error("asset '{guid}' parse error: {message}")]
    ParseError { guid: Guid, message: String },

    /// Informational: a batch closure was extended beyond its header.
    #[error("closure augmented with {added} asset(s)")]
    ClosureAugmented { added: usize },

    /// Re-entrant access to the value currently being modified.
    #[error("cyclic reference through asset '{0}'")]
    CyclicReference(Guid),

    /// A referenced child asset was not loaded when binding.
    #[error("bind failed for '{guid}': {message}")]
    BindFailed { guid: Guid, message: String },

    /// A scan is already in progress.
    #[error("asset scan already in progress")]
    ScanBusy,

    /// Operation not permitted in the batch's current state.
    #[error("operation forbidden in state {state}")]
    StateTransitionForbidden { state: &'static str },

    /// The task's promise was dropped before completion.
    #[error("operation aborted")]
    Aborted,
}

impl AssetError {
    pub fn io(guid: Guid, source: std::io::Error) -> Self {
        Self::IOError { guid, source }
    }

    pub fn parse(guid: Guid, err: impl std::fmt::Display) -> Self {
        Self::ParseError {
            guid,
            message: err.to_string(),
        }
    }
}
