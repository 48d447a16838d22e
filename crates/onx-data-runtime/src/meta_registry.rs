use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{AssetError, AssetIndex, AssetTypeId, ErasedAssetRef, Guid, MetaHandle, Storage};

/// Behaviour every storable asset type provides.
///
/// The registry erases this trait into a per-type vtable so the resource
/// manager and batch registry can operate on `type_name` strings drawn from
/// asset metadata.
pub trait AssetValue: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name used in meta files and registry lookups.
    const TYPE_NAME: &'static str;

    /// Visits every outgoing asset reference. Types without references keep
    /// the default.
    fn visit_asset_refs(&mut self, _visitor: &mut dyn FnMut(&mut dyn ErasedAssetRef)) {}
}

type LoadFn =
    Box<dyn Fn(&Storage, &AssetIndex, Guid) -> Result<MetaHandle, AssetError> + Send + Sync>;
type GuidFn = Box<dyn Fn(&Storage, Guid) -> Result<(), AssetError> + Send + Sync>;
type CollectFn = Box<dyn Fn(&Storage, Guid) -> Result<Vec<Guid>, AssetError> + Send + Sync>;
type SerializeFn =
    Box<dyn Fn(&Storage, Guid) -> Result<serde_json::Value, AssetError> + Send + Sync>;
type DeserializeFn =
    Box<dyn Fn(serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, AssetError> + Send + Sync>;

/// Erased per-type function table.
pub struct AssetTypeEntry {
    type_name: &'static str,
    display_name: String,
    type_id: AssetTypeId,
    load: LoadFn,
    unload: GuidFn,
    bind: GuidFn,
    unbind: GuidFn,
    collect_refs: CollectFn,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

impl AssetTypeEntry {
    fn new<T: AssetValue>(display_name: String) -> Self {
        Self {
            type_name: T::TYPE_NAME,
            display_name,
            type_id: AssetTypeId::of::<T>(),
            load: Box::new(|storage, index, guid| {
                let value: T = index.read_payload(guid)?;
                Ok(storage.add(value, guid)?.into_meta())
            }),
            unload: Box::new(|storage, guid| storage.remove_now_guid(guid)),
            bind: Box::new(|storage, guid| {
                let handle = storage.typed_handle_for_guid::<T>(guid)?;
                storage.modify(handle, |asset| {
                    let mut failure = None;
                    asset.visit_asset_refs(&mut |reference| {
                        // Already-wired references are left alone (idempotent).
                        if failure.is_none() {
                            if let Err(err) = reference.rebind(storage) {
                                failure = Some(err);
                            }
                        }
                    });
                    failure.map_or(Ok(()), Err)
                })?
            }),
            unbind: Box::new(|storage, guid| {
                let handle = storage.typed_handle_for_guid::<T>(guid)?;
                storage.modify(handle, |asset| {
                    asset.visit_asset_refs(&mut |reference| reference.clear());
                })
            }),
            collect_refs: Box::new(|storage, guid| {
                let handle = storage.typed_handle_for_guid::<T>(guid)?;
                storage.modify(handle, |asset| {
                    let mut guids = Vec::new();
                    asset.visit_asset_refs(&mut |reference| guids.push(reference.guid()));
                    guids
                })
            }),
            serialize: Box::new(|storage, guid| {
                let handle = storage.typed_handle_for_guid::<T>(guid)?;
                storage.read(handle, |asset| {
                    serde_json::to_value(asset).map_err(|err| AssetError::parse(guid, err))
                })?
            }),
            deserialize: Box::new(|value| {
                let parsed: T = serde_json::from_value(value)
                    .map_err(|err| AssetError::parse(Guid::INVALID, err))?;
                Ok(Box::new(parsed))
            }),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn type_id(&self) -> AssetTypeId {
        self.type_id
    }

    /// Deserializes the payload from the index and adds it to storage.
    pub fn load(
        &self,
        storage: &Storage,
        index: &AssetIndex,
        guid: Guid,
    ) -> Result<MetaHandle, AssetError> {
        (self.load)(storage, index, guid)
    }

    /// Force-removes the value from storage.
    pub fn unload(&self, storage: &Storage, guid: Guid) -> Result<(), AssetError> {
        (self.unload)(storage, guid)
    }

    /// Wires every outgoing reference of the stored value.
    pub fn bind(&self, storage: &Storage, guid: Guid) -> Result<(), AssetError> {
        (self.bind)(storage, guid)
    }

    /// Clears every outgoing reference of the stored value.
    pub fn unbind(&self, storage: &Storage, guid: Guid) -> Result<(), AssetError> {
        (self.unbind)(storage, guid)
    }

    /// Guids of every outgoing reference of the stored value.
    pub fn collect_refs(&self, storage: &Storage, guid: Guid) -> Result<Vec<Guid>, AssetError> {
        (self.collect_refs)(storage, guid)
    }

    pub fn serialize_value(
        &self,
        storage: &Storage,
        guid: Guid,
    ) -> Result<serde_json::Value, AssetError> {
        (self.serialize)(storage, guid)
    }

    pub fn deserialize_value(
        &self,
        value: serde_json::Value,
    ) -> Result<Box<dyn Any + Send + Sync>, AssetError> {
        (self.deserialize)(value)
    }
}

/// Process-wide mapping `type_name -> vtable`, populated once during
/// bootstrap through [`AssetTypeRegistryOptions`] and lock-free afterwards.
pub struct AssetTypeRegistry {
    by_name: HashMap<&'static str, Arc<AssetTypeEntry>>,
    by_type_id: HashMap<AssetTypeId, Arc<AssetTypeEntry>>,
    load_observer: Option<Arc<dyn Fn(Guid) + Send + Sync>>,
}

impl AssetTypeRegistry {
    pub fn entry_by_name(&self, type_name: &str) -> Result<&Arc<AssetTypeEntry>, AssetError> {
        self.by_name
            .get(type_name)
            .ok_or_else(|| AssetError::TypeNotRegistered(type_name.to_owned()))
    }

    pub fn entry_by_type_id(
        &self,
        type_id: AssetTypeId,
    ) -> Result<&Arc<AssetTypeEntry>, AssetError> {
        self.by_type_id
            .get(&type_id)
            .ok_or_else(|| AssetError::TypeNotRegistered(format!("{:?}", type_id)))
    }

    /// Loads through the type's vtable, notifying the load observer on
    /// success. The observer exists so tests can count physical loads.
    pub fn load(
        &self,
        type_name: &str,
        storage: &Storage,
        index: &AssetIndex,
        guid: Guid,
    ) -> Result<MetaHandle, AssetError> {
        let entry = self.entry_by_name(type_name)?;
        let handle = entry.load(storage, index, guid)?;
        if let Some(observer) = &self.load_observer {
            observer(guid);
        }
        Ok(handle)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_name.keys().copied()
    }
}

/// Options used to configure the creation of an [`AssetTypeRegistry`].
///
/// Registration is append-only and happens before any load is issued.
pub struct AssetTypeRegistryOptions {
    entries: Vec<Arc<AssetTypeEntry>>,
    load_observer: Option<Arc<dyn Fn(Guid) + Send + Sync>>,
}

impl AssetTypeRegistryOptions {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            load_observer: None,
        }
    }

    /// Enables support for asset type `T`.
    pub fn add_type<T: AssetValue>(mut self, display_name: impl Into<String>) -> Self {
        self.entries
            .push(Arc::new(AssetTypeEntry::new::<T>(display_name.into())));
        self
    }

    /// Installs a callback invoked once per executed (not elided) load.
    pub fn with_load_observer(mut self, observer: impl Fn(Guid) + Send + Sync + 'static) -> Self {
        self.load_observer = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> Arc<AssetTypeRegistry> {
        let mut by_name = HashMap::new();
        let mut by_type_id = HashMap::new();
        for entry in self.entries {
            by_name.insert(entry.type_name(), Arc::clone(&entry));
            by_type_id.insert(AssetTypeEntry::type_id(&entry), entry);
        }
        Arc::new(AssetTypeRegistry {
            by_name,
            by_type_id,
            load_observer: self.load_observer,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::test_asset::{test_registry, write_model_tree, Mesh, Model};

    #[test]
    fn load_bind_serialize_through_vtable() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_model_tree(dir.path(), 2, 1);

        let registry = test_registry();
        let storage = Storage::new();
        let index = AssetIndex::new();
        index.scan(dir.path()).unwrap();

        // Load children first, then the model, then bind it.
        for guid in fixture.meshes.iter().chain(&fixture.textures) {
            let entry = index.snapshot();
            let type_name = entry.entry_for_guid(*guid).unwrap().meta.type_name.clone();
            registry.load(&type_name, &storage, &index, *guid).unwrap();
        }
        registry
            .load(Model::TYPE_NAME, &storage, &index, fixture.model)
            .unwrap();

        let model_entry = registry.entry_by_name(Model::TYPE_NAME).unwrap();
        model_entry.bind(&storage, fixture.model).unwrap();

        let handle = storage.handle_for_guid::<Model>(fixture.model).unwrap();
        storage
            .read(handle, |model| {
                assert!(model.meshes.iter().all(|m| m.handle.is_some()));
                assert!(model.textures.iter().all(|t| t.handle.is_some()));
            })
            .unwrap();

        assert_eq!(
            model_entry.collect_refs(&storage, fixture.model).unwrap(),
            fixture
                .meshes
                .iter()
                .chain(&fixture.textures)
                .copied()
                .collect::<Vec<_>>()
        );

        // serialize -> deserialize -> serialize is value-identical.
        let first = model_entry.serialize_value(&storage, fixture.model).unwrap();
        let boxed = model_entry.deserialize_value(first.clone()).unwrap();
        let reparsed = boxed.downcast_ref::<Model>().unwrap();
        let second = serde_json::to_value(reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bind_with_missing_child_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_model_tree(dir.path(), 1, 0);

        let registry = test_registry();
        let storage = Storage::new();
        let index = AssetIndex::new();
        index.scan(dir.path()).unwrap();

        // Model loaded, mesh deliberately not.
        registry
            .load(Model::TYPE_NAME, &storage, &index, fixture.model)
            .unwrap();
        let err = registry
            .entry_by_name(Model::TYPE_NAME)
            .unwrap()
            .bind(&storage, fixture.model)
            .unwrap_err();
        assert!(matches!(err, AssetError::BindFailed { .. }));
    }

    #[test]
    fn unbind_clears_handles() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_model_tree(dir.path(), 1, 0);

        let registry = test_registry();
        let storage = Storage::new();
        let index = AssetIndex::new();
        index.scan(dir.path()).unwrap();

        registry
            .load(Mesh::TYPE_NAME, &storage, &index, fixture.meshes[0])
            .unwrap();
        registry
            .load(Model::TYPE_NAME, &storage, &index, fixture.model)
            .unwrap();

        let entry = registry.entry_by_name(Model::TYPE_NAME).unwrap();
        entry.bind(&storage, fixture.model).unwrap();
        entry.unbind(&storage, fixture.model).unwrap();

        let handle = storage.handle_for_guid::<Model>(fixture.model).unwrap();
        storage
            .read(handle, |model| {
                assert!(model.meshes.iter().all(|m| !m.handle.is_some()));
            })
            .unwrap();
    }

    #[test]
    fn load_observer_counts_physical_loads() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_model_tree(dir.path(), 1, 0);

        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let registry = AssetTypeRegistryOptions::new()
            .add_type::<Mesh>("Mesh")
            .with_load_observer(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let storage = Storage::new();
        let index = AssetIndex::new();
        index.scan(dir.path()).unwrap();

        registry
            .load(Mesh::TYPE_NAME, &storage, &index, fixture.meshes[0])
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_type_name_is_an_error() {
        let registry = test_registry();
        assert!(matches!(
            registry.entry_by_name("Skeleton"),
            Err(AssetError::TypeNotRegistered(_))
        ));
    }
}
