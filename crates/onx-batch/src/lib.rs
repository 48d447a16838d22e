//! Batch orchestration: named groups of entities plus the transitive set of
//! assets they reference, driven through a per-registry strand.
//!
//! A batch's lifecycle is
//! `Unloaded → Queued → Loading → Loaded → Unloading → Unloaded`, with
//! `Error` as a sink. Loading acquires the batch's asset closure through the
//! resource manager, spawns its entities on the main thread, then resolves
//! entity-to-entity and entity-to-asset references once every peer exists.

// crate-specific lint exceptions:
//#![allow()]

mod batch_file;
pub use batch_file::{BatchFile, BatchIndexEntry, BatchIndexFile, EntityDesc, EntitySpawnDesc};

mod context;
pub use context::EngineContext;

mod events;
pub use events::{BatchTaskCompletedEvent, BatchTaskKind};

mod registry;
pub use registry::{BatchInfo, BatchRegistry, BatchState, BatchSummary};
