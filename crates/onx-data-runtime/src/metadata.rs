use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Guid;

/// Sidecar description of an on-disk asset, stored as `<stem>.meta.json` next
/// to the `<stem>.json` payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AssetMetaData {
    pub guid: Guid,
    #[serde(default)]
    pub guid_parent: Guid,
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub contained_assets: Vec<Guid>,
}

impl AssetMetaData {
    pub fn new(guid: Guid, guid_parent: Guid, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            guid,
            guid_parent,
            name: name.into(),
            type_name: type_name.into(),
            contained_assets: Vec::new(),
        }
    }
}

/// One catalogued asset, produced by an index scan.
#[derive(Clone, Debug)]
pub struct AssetEntry {
    pub meta: AssetMetaData,
    /// Payload path relative to the scan root, for display.
    pub relative_path: PathBuf,
    /// Full payload path on disk.
    pub absolute_path: PathBuf,
}
