//! Runtime asset management core.
//!
//! Loaded asset values live in a type-erased, reference-counted [`Storage`]
//! keyed by [`Guid`]. On-disk assets are catalogued by the [`AssetIndex`]
//! (immutable snapshots built from `*.meta.json` scans), per-type behaviour is
//! registered in the [`AssetTypeRegistry`], and the [`ResourceManager`]
//! serializes load/bind/unload/reload work on a strand while tracking
//! per-batch leases that gate eviction.

// crate-specific lint exceptions:
//#![allow()]

mod asset_index;
pub use asset_index::{AssetIndex, AssetIndexData, ScanStats};

mod asset_ref;
pub use asset_ref::{AssetRef, ErasedAssetRef, RefState};

mod error;
pub use error::AssetError;

mod guid;
pub use guid::{BatchId, Guid};

mod handle;
pub use handle::{AssetTypeId, Handle, MetaHandle};

mod meta_registry;
pub use meta_registry::{
    AssetTypeEntry, AssetTypeRegistry, AssetTypeRegistryOptions, AssetValue,
};

mod metadata;
pub use metadata::{AssetEntry, AssetMetaData};

mod resource_manager;
pub use resource_manager::{AssetStatus, ResourceManager};

mod storage;
pub use storage::Storage;

mod task_result;
pub use task_result::{OpResult, ResourceTaskCompletedEvent, TaskKind, TaskResult};

pub mod test_asset;
