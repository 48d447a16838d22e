use serde::{Deserialize, Serialize};

use onx_data_runtime::{BatchId, Guid};
use onx_ecs::EntityRef;

/// One row of `<batches_root>/index.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchIndexEntry {
    pub id: BatchId,
    pub name: String,
    pub filename: String,
}

/// The batch index file: the durable list of known batches.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchIndexFile {
    pub batches: Vec<BatchIndexEntry>,
}

/// Serialized form of one entity inside a batch file. `data` maps component
/// type names to component values; the entity's name and parent travel in its
/// header component.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityDesc {
    pub guid: Guid,
    #[serde(default)]
    pub archetype: String,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Per-batch file: entity descriptions plus the header asset closure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchFile {
    pub id: BatchId,
    pub name: String,
    #[serde(default)]
    pub entities: Vec<EntityDesc>,
    #[serde(default)]
    pub assets: Vec<Guid>,
}

/// Description used to spawn a new entity into a loaded batch at runtime.
#[derive(Clone, Debug, Default)]
pub struct EntitySpawnDesc {
    pub name: String,
    pub archetype: String,
    pub parent: EntityRef,
    /// Component overrides, keyed by component type name.
    pub data: serde_json::Map<String, serde_json::Value>,
}
