use std::collections::BTreeMap;

use slotmap::SlotMap;
use tracing::warn;

use onx_data_runtime::{AssetError, ErasedAssetRef, Guid};

use crate::{
    Component, ComponentRegistry, ComponentValue, EntityId, EntityManager, EntityRef, Header,
};

/// Bidirectional guid↔entity map.
#[derive(Default)]
struct GuidEntityMap {
    to_entity: BTreeMap<Guid, EntityId>,
    to_guid: BTreeMap<EntityId, Guid>,
}

impl GuidEntityMap {
    fn insert(&mut self, guid: Guid, entity: EntityId) {
        if let Some(old) = self.to_entity.insert(guid, entity) {
            self.to_guid.remove(&old);
        }
        self.to_guid.insert(entity, guid);
    }

    fn remove_entity(&mut self, entity: EntityId) {
        if let Some(guid) = self.to_guid.remove(&entity) {
            self.to_entity.remove(&guid);
        }
    }
}

struct EntityRecord {
    components: Vec<Box<dyn Component>>,
}

/// Default in-memory [`EntityManager`].
pub struct EntityRegistry {
    entities: SlotMap<EntityId, EntityRecord>,
    guid_map: GuidEntityMap,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            entities: SlotMap::with_key(),
            guid_map: GuidEntityMap::default(),
        }
    }

    /// Typed component access (concrete registry only; the trait surface
    /// stays object-safe).
    pub fn get_component<C: Component>(&self, entity: EntityId) -> Option<&C> {
        self.entities.get(entity)?.components.iter().find_map(|c| {
            c.as_any().downcast_ref::<C>()
        })
    }

    pub fn get_component_mut<C: Component>(&mut self, entity: EntityId) -> Option<&mut C> {
        self.entities
            .get_mut(entity)?
            .components
            .iter_mut()
            .find_map(|c| c.as_any_mut().downcast_mut::<C>())
    }

    pub fn entity_name(&self, entity: EntityId) -> Option<String> {
        self.get_component::<Header>(entity).map(|h| h.name.clone())
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityManager for EntityRegistry {
    fn create_entity(&mut self, name: &str, parent: EntityRef) -> EntityRef {
        self.create_entity_with_guid(Guid::generate(), name, parent)
    }

    fn create_entity_with_guid(&mut self, guid: Guid, name: &str, parent: EntityRef) -> EntityRef {
        let id = self.entities.insert(EntityRecord {
            components: vec![Box::new(Header {
                name: name.to_owned(),
                parent,
            })],
        });
        self.guid_map.insert(guid, id);
        EntityRef::with_entity(guid, id)
    }

    fn destroy_entity(&mut self, entity: EntityRef) -> bool {
        let id = match entity.entity.or_else(|| self.entity_for_guid(entity.guid)) {
            Some(id) => id,
            None => return false,
        };
        if self.entities.remove(id).is_none() {
            warn!("destroy of dead entity {:?}", id);
            return false;
        }
        self.guid_map.remove_entity(id);
        true
    }

    fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.contains_key(entity)
    }

    fn entity_for_guid(&self, guid: Guid) -> Option<EntityId> {
        self.guid_map.to_entity.get(&guid).copied()
    }

    fn guid_for_entity(&self, entity: EntityId) -> Option<Guid> {
        self.guid_map.to_guid.get(&entity).copied()
    }

    fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn insert_component(&mut self, entity: EntityId, component: Box<dyn Component>) -> bool {
        match self.entities.get_mut(entity) {
            Some(record) => {
                record.components.push(component);
                true
            }
            None => false,
        }
    }

    fn apply_component(
        &mut self,
        entity: EntityId,
        type_name: &str,
        data: &serde_json::Value,
        registry: &ComponentRegistry,
    ) -> Result<(), AssetError> {
        let component = registry.deserialize(type_name, data)?;
        if type_name == Header::TYPE_NAME {
            // The auto-attached header is replaced, not duplicated.
            if let Some(record) = self.entities.get_mut(entity) {
                record
                    .components
                    .retain(|c| c.type_name() != Header::TYPE_NAME);
            }
        }
        if self.insert_component(entity, component) {
            Ok(())
        } else {
            Err(AssetError::NotFound(
                self.guid_for_entity(entity).unwrap_or(Guid::INVALID),
            ))
        }
    }

    fn serialize_components(
        &self,
        entity: EntityId,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AssetError> {
        let record = self.entities.get(entity).ok_or(AssetError::Invalid)?;
        let mut map = serde_json::Map::new();
        for component in &record.components {
            map.insert(component.type_name().to_owned(), component.to_value()?);
        }
        Ok(map)
    }

    fn visit_entity_refs(&mut self, entity: EntityId, visitor: &mut dyn FnMut(&mut EntityRef)) {
        if let Some(record) = self.entities.get_mut(entity) {
            for component in &mut record.components {
                component.visit_entity_refs(visitor);
            }
        }
    }

    fn visit_asset_refs(
        &mut self,
        entity: EntityId,
        visitor: &mut dyn FnMut(&mut dyn ErasedAssetRef),
    ) {
        if let Some(record) = self.entities.get_mut(entity) {
            for component in &mut record.components {
                component.visit_asset_refs(visitor);
            }
        }
    }
}
