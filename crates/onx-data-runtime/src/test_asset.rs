//! Mock asset types shared by tests across the workspace.
//!
//! These stand in for real runtime data until concrete asset types move into
//! their own crates; batch and resource-manager tests build small trees of
//! them on disk.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    AssetIndex, AssetMetaData, AssetRef, AssetTypeRegistry, AssetTypeRegistryOptions, AssetValue,
    ErasedAssetRef, Guid,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub vertices: Vec<f32>,
}

impl AssetValue for Mesh {
    const TYPE_NAME: &'static str = "Mesh";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Texture {
    pub name: String,
}

impl AssetValue for Texture {
    const TYPE_NAME: &'static str = "Texture";
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Model {
    pub meshes: Vec<AssetRef<Mesh>>,
    pub textures: Vec<AssetRef<Texture>>,
}

impl AssetValue for Model {
    const TYPE_NAME: &'static str = "Model";

    fn visit_asset_refs(&mut self, visitor: &mut dyn FnMut(&mut dyn ErasedAssetRef)) {
        for mesh in &mut self.meshes {
            visitor(mesh);
        }
        for texture in &mut self.textures {
            visitor(texture);
        }
    }
}

/// Registry covering every mock type.
pub fn test_registry() -> std::sync::Arc<AssetTypeRegistry> {
    AssetTypeRegistryOptions::new()
        .add_type::<Mesh>("Mesh")
        .add_type::<Texture>("Texture")
        .add_type::<Model>("Model")
        .build()
}

/// Guids of a model tree written by [`write_model_tree`].
pub struct ModelFixture {
    pub model: Guid,
    pub meshes: Vec<Guid>,
    pub textures: Vec<Guid>,
}

/// Writes a `Model` with `mesh_count` meshes and `texture_count` textures
/// (parented under the model) into `dir`, meta files included.
pub fn write_model_tree(dir: &Path, mesh_count: usize, texture_count: usize) -> ModelFixture {
    let model_guid = Guid::generate();
    let mut model = Model::default();
    let mut fixture = ModelFixture {
        model: model_guid,
        meshes: Vec::new(),
        textures: Vec::new(),
    };

    for i in 0..mesh_count {
        let guid = Guid::generate();
        let mesh = Mesh {
            vertices: vec![i as f32, 1.0, 2.0],
        };
        let meta = AssetMetaData::new(guid, model_guid, format!("mesh_{i}"), Mesh::TYPE_NAME);
        AssetIndex::write_asset_files(
            &mesh,
            &meta,
            &dir.join(format!("mesh_{i}.json")),
            &dir.join(format!("mesh_{i}.meta.json")),
        )
        .expect("fixture mesh written");
        model.meshes.push(AssetRef::new(guid));
        fixture.meshes.push(guid);
    }

    for i in 0..texture_count {
        let guid = Guid::generate();
        let texture = Texture {
            name: format!("texture_{i}"),
        };
        let meta = AssetMetaData::new(guid, model_guid, format!("texture_{i}"), Texture::TYPE_NAME);
        AssetIndex::write_asset_files(
            &texture,
            &meta,
            &dir.join(format!("texture_{i}.json")),
            &dir.join(format!("texture_{i}.meta.json")),
        )
        .expect("fixture texture written");
        model.textures.push(AssetRef::new(guid));
        fixture.textures.push(guid);
    }

    let meta = AssetMetaData::new(model_guid, Guid::INVALID, "model", Model::TYPE_NAME);
    AssetIndex::import(&mut model, &meta, dir, "model").expect("fixture model written");

    fixture
}
