use onx_data_runtime::{AssetError, ErasedAssetRef, Guid};

use crate::{Component, ComponentRegistry, EntityId, EntityRef};

/// Contract the batch registry requires from the entity layer.
///
/// Mutating calls must be made on the thread that owns the entity world; the
/// runtime routes them through the main-thread queue. Lookups are safe from
/// any thread holding the manager's lock.
pub trait EntityManager: Send {
    /// Creates an entity with a fresh guid and an auto-attached header.
    fn create_entity(&mut self, name: &str, parent: EntityRef) -> EntityRef;

    /// Creates an entity under a persisted guid (batch instantiation).
    fn create_entity_with_guid(&mut self, guid: Guid, name: &str, parent: EntityRef) -> EntityRef;

    /// Deregisters and removes the entity. Returns false if it was not alive.
    fn destroy_entity(&mut self, entity: EntityRef) -> bool;

    fn is_alive(&self, entity: EntityId) -> bool;
    fn entity_for_guid(&self, guid: Guid) -> Option<EntityId>;
    fn guid_for_entity(&self, entity: EntityId) -> Option<Guid>;
    fn entity_count(&self) -> usize;

    fn insert_component(&mut self, entity: EntityId, component: Box<dyn Component>) -> bool;

    /// Deserializes component data through the registry and attaches it.
    fn apply_component(
        &mut self,
        entity: EntityId,
        type_name: &str,
        data: &serde_json::Value,
        registry: &ComponentRegistry,
    ) -> Result<(), AssetError>;

    /// Serializes every component, keyed by component type name.
    fn serialize_components(
        &self,
        entity: EntityId,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AssetError>;

    /// Invokes the registered entity-ref hook of every component.
    fn visit_entity_refs(&mut self, entity: EntityId, visitor: &mut dyn FnMut(&mut EntityRef));

    /// Invokes the registered asset-ref hook of every component.
    fn visit_asset_refs(
        &mut self,
        entity: EntityId,
        visitor: &mut dyn FnMut(&mut dyn ErasedAssetRef),
    );

    /// Guids of every asset referenced by the entity's components.
    fn collect_asset_guids(&mut self, entity: EntityId) -> Vec<Guid> {
        let mut guids = Vec::new();
        self.visit_asset_refs(entity, &mut |reference| {
            if reference.guid().is_valid() {
                guids.push(reference.guid());
            }
        });
        guids
    }
}
