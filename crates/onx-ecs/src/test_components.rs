//! Mock components shared by tests across the workspace.

use serde::{Deserialize, Serialize};

use onx_data_runtime::test_asset::{Model, Texture};
use onx_data_runtime::{AssetRef, ErasedAssetRef};

use crate::{ComponentValue, EntityRef};

/// Renders a model; references the asset by guid.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ModelComponent {
    pub model: AssetRef<Model>,
}

impl ComponentValue for ModelComponent {
    const TYPE_NAME: &'static str = "ModelComponent";

    fn visit_asset_refs(&mut self, visitor: &mut dyn FnMut(&mut dyn ErasedAssetRef)) {
        visitor(&mut self.model);
    }
}

/// Projects a texture; used to exercise closure augmentation (the texture
/// need not appear in a batch's header assets).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DecalComponent {
    pub texture: AssetRef<Texture>,
}

impl ComponentValue for DecalComponent {
    const TYPE_NAME: &'static str = "DecalComponent";

    fn visit_asset_refs(&mut self, visitor: &mut dyn FnMut(&mut dyn ErasedAssetRef)) {
        visitor(&mut self.texture);
    }
}

/// Links an entity to another entity in the same batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttachComponent {
    pub target: EntityRef,
}

impl ComponentValue for AttachComponent {
    const TYPE_NAME: &'static str = "AttachComponent";

    fn visit_entity_refs(&mut self, visitor: &mut dyn FnMut(&mut EntityRef)) {
        if !self.target.is_empty() {
            visitor(&mut self.target);
        }
    }
}
