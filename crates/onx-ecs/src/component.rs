use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use onx_data_runtime::{AssetError, ErasedAssetRef, Guid};

use crate::EntityRef;

/// Object-safe view of a component, as stored on an entity.
pub trait Component: Any + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn to_value(&self) -> Result<serde_json::Value, AssetError>;
    fn visit_asset_refs(&mut self, _visitor: &mut dyn FnMut(&mut dyn ErasedAssetRef)) {}
    fn visit_entity_refs(&mut self, _visitor: &mut dyn FnMut(&mut EntityRef)) {}
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Behaviour a concrete component type provides; erased into [`Component`]
/// by a blanket impl and into the [`ComponentRegistry`] at bootstrap.
pub trait ComponentValue:
    Serialize + DeserializeOwned + Default + Send + Sync + 'static
{
    /// Stable name used in batch files and registry lookups.
    const TYPE_NAME: &'static str;

    fn visit_asset_refs(&mut self, _visitor: &mut dyn FnMut(&mut dyn ErasedAssetRef)) {}
    fn visit_entity_refs(&mut self, _visitor: &mut dyn FnMut(&mut EntityRef)) {}
}

impl<T: ComponentValue> Component for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn to_value(&self) -> Result<serde_json::Value, AssetError> {
        serde_json::to_value(self).map_err(|err| AssetError::ParseError {
            guid: Guid::INVALID,
            message: err.to_string(),
        })
    }

    fn visit_asset_refs(&mut self, visitor: &mut dyn FnMut(&mut dyn ErasedAssetRef)) {
        ComponentValue::visit_asset_refs(self, visitor);
    }

    fn visit_entity_refs(&mut self, visitor: &mut dyn FnMut(&mut EntityRef)) {
        ComponentValue::visit_entity_refs(self, visitor);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Automatically attached to every entity; carries its display name and the
/// parent link used for hierarchy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    #[serde(default)]
    pub parent: EntityRef,
}

impl ComponentValue for Header {
    const TYPE_NAME: &'static str = "Header";

    fn visit_entity_refs(&mut self, visitor: &mut dyn FnMut(&mut EntityRef)) {
        if !self.parent.is_empty() {
            visitor(&mut self.parent);
        }
    }
}

type DeserializeFn =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Component>, AssetError> + Send + Sync>;
type DefaultFn = Box<dyn Fn() -> Box<dyn Component> + Send + Sync>;

struct ComponentTypeEntry {
    deserialize: DeserializeFn,
    default: DefaultFn,
}

/// Mapping `type_name -> component hooks`, populated during bootstrap and
/// immutable afterwards.
pub struct ComponentRegistry {
    entries: HashMap<&'static str, ComponentTypeEntry>,
}

impl ComponentRegistry {
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    pub fn deserialize(
        &self,
        type_name: &str,
        value: &serde_json::Value,
    ) -> Result<Box<dyn Component>, AssetError> {
        let entry = self
            .entries
            .get(type_name)
            .ok_or_else(|| AssetError::TypeNotRegistered(type_name.to_owned()))?;
        (entry.deserialize)(value)
    }

    pub fn instantiate(&self, type_name: &str) -> Result<Box<dyn Component>, AssetError> {
        let entry = self
            .entries
            .get(type_name)
            .ok_or_else(|| AssetError::TypeNotRegistered(type_name.to_owned()))?;
        Ok((entry.default)())
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
}

/// Options used to configure the creation of a [`ComponentRegistry`].
pub struct ComponentRegistryOptions {
    entries: HashMap<&'static str, ComponentTypeEntry>,
}

impl ComponentRegistryOptions {
    /// Starts with [`Header`] pre-registered.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
        .add_component::<Header>()
    }

    pub fn add_component<C: ComponentValue>(mut self) -> Self {
        self.entries.insert(
            C::TYPE_NAME,
            ComponentTypeEntry {
                deserialize: Box::new(|value| {
                    let parsed: C = serde_json::from_value(value.clone()).map_err(|err| {
                        AssetError::ParseError {
                            guid: Guid::INVALID,
                            message: err.to_string(),
                        }
                    })?;
                    Ok(Box::new(parsed))
                }),
                default: Box::new(|| Box::new(C::default())),
            },
        );
        self
    }

    pub fn build(self) -> Arc<ComponentRegistry> {
        Arc::new(ComponentRegistry {
            entries: self.entries,
        })
    }
}
