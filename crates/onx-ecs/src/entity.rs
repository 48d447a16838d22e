use serde::{Deserialize, Deserializer, Serialize, Serializer};

use onx_data_runtime::Guid;

slotmap::new_key_type! {
    /// Generational id of a live entity.
    pub struct EntityId;
}

/// Reference to an entity, following the same four-state model as asset
/// references: only the guid persists, the entity id is resolved after all
/// peers of a batch exist.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EntityRef {
    pub guid: Guid,
    pub entity: Option<EntityId>,
}

impl EntityRef {
    pub fn new(guid: Guid) -> Self {
        Self { guid, entity: None }
    }

    pub fn with_entity(guid: Guid, entity: EntityId) -> Self {
        Self {
            guid,
            entity: Some(entity),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.guid.is_valid()
    }

    pub fn has_entity(&self) -> bool {
        self.entity.is_some()
    }

    pub fn clear_entity(&mut self) {
        self.entity = None;
    }
}

impl Serialize for EntityRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.guid.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EntityRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Entity ids never persist; references deserialize unresolved.
        Ok(Self::new(Guid::deserialize(deserializer)?))
    }
}
