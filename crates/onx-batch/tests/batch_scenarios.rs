//! End-to-end batch lifecycle scenarios: scan → load → bind → entities →
//! unload, driven exactly like a game loop would (worker strands plus a
//! pumped main-thread queue).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use onx_batch::{
    BatchFile, BatchRegistry, BatchState, BatchTaskKind, EngineContext, EntityDesc,
    EntitySpawnDesc,
};
use onx_data_runtime::test_asset::{test_registry, write_model_tree, Model, Texture};
use onx_data_runtime::{
    AssetIndex, AssetMetaData, AssetValue, Guid, ResourceManager,
};
use onx_ecs::test_components::{AttachComponent, DecalComponent, ModelComponent};
use onx_ecs::{
    ComponentRegistryOptions, EntityManager, EntityRef, EntityRegistry,
};
use onx_tasks::{EventBus, MainThreadQueue, TaskFuture, ThreadPool};

struct Harness {
    registry: Arc<BatchRegistry>,
    ctx: EngineContext,
    world: Arc<Mutex<EntityRegistry>>,
}

fn setup(assets_root: &Path, index_path: &Path) -> Harness {
    let pool = Arc::new(ThreadPool::with_workers(4));

    let rm = ResourceManager::new(Arc::clone(&pool), test_registry());
    rm.scan_assets_async(assets_root.to_path_buf())
        .wait()
        .unwrap();

    let components = ComponentRegistryOptions::new()
        .add_component::<ModelComponent>()
        .add_component::<AttachComponent>()
        .add_component::<DecalComponent>()
        .build();

    let world = Arc::new(Mutex::new(EntityRegistry::new()));
    let ctx = EngineContext {
        resource_manager: rm,
        entity_manager: world.clone(),
        components,
        thread_pool: Arc::clone(&pool),
        main_queue: Arc::new(MainThreadQueue::new()),
        events: Arc::new(EventBus::new()),
    };

    let registry = BatchRegistry::new(pool);
    registry.load_or_create_index(index_path).unwrap();

    Harness {
        registry,
        ctx,
        world,
    }
}

/// Emulates the main loop: pump main-thread work until the future resolves.
fn pump_until<T: Clone>(ctx: &EngineContext, future: &TaskFuture<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        ctx.main_queue.pump();
        if let Some(result) = future.try_get() {
            return result.expect("task completed");
        }
        assert!(Instant::now() < deadline, "batch task timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn write_texture(dir: &Path, stem: &str, name: &str) -> Guid {
    let guid = Guid::generate();
    let texture = Texture { name: name.into() };
    let meta = AssetMetaData::new(guid, Guid::INVALID, name, Texture::TYPE_NAME);
    AssetIndex::write_asset_files(
        &texture,
        &meta,
        &dir.join(format!("{stem}.json")),
        &dir.join(format!("{stem}.meta.json")),
    )
    .unwrap();
    guid
}

#[test]
fn batch_create_load_spawn_save_unload_reload() {
    let dir = tempfile::tempdir().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    let fixture = write_model_tree(&assets, 2, 0);
    let index_path = dir.path().join("batches").join("index.json");

    let h = setup(&assets, &index_path);
    let id = h.registry.create_batch("Startup Batch 1");

    // Load the (still empty) batch.
    let result = pump_until(&h.ctx, &h.registry.queue_load(id, &h.ctx));
    assert!(result.success, "{:?}", result);
    assert_eq!(h.registry.state(id), Some(BatchState::Loaded));
    assert!(h.registry.live(id).is_empty());

    // Create a root entity, then spawn a player referencing both the root
    // (entity ref) and the model (asset ref).
    let root = pump_until(
        &h.ctx,
        &h.registry
            .queue_create_entity(id, "Root", EntityRef::default(), &h.ctx),
    )
    .unwrap();

    let mut data = serde_json::Map::new();
    data.insert(
        "ModelComponent".into(),
        json!({ "model": fixture.model.to_string() }),
    );
    data.insert(
        "AttachComponent".into(),
        json!({ "target": root.guid.to_string() }),
    );
    let player = pump_until(
        &h.ctx,
        &h.registry.queue_spawn_entity(
            id,
            EntitySpawnDesc {
                name: "Player".into(),
                archetype: String::new(),
                parent: root,
                data,
            },
            &h.ctx,
        ),
    )
    .unwrap();

    // The spawn augmented the closure and loaded + bound the model tree.
    assert!(h.registry.closure(id).contains(&fixture.model));
    let rm = &h.ctx.resource_manager;
    assert_eq!(rm.total_leases(fixture.model), 1);
    let storage = rm.storage();
    let model_handle = storage.handle_for_guid::<Model>(fixture.model).unwrap();
    {
        let world = h.world.lock();
        let player_id = player.entity.unwrap();
        let model_component = world.get_component::<ModelComponent>(player_id).unwrap();
        assert_eq!(model_component.model.handle, model_handle);
        assert!(storage.validate(model_component.model.handle));

        let attach = world.get_component::<AttachComponent>(player_id).unwrap();
        assert_eq!(attach.target.entity, root.entity);
    }
    assert_eq!(h.registry.live(id).len(), 2);

    // Persist, then tear down.
    let saved = pump_until(&h.ctx, &h.registry.queue_save_batch(id, &h.ctx));
    assert!(saved.success, "{:?}", saved);
    h.registry.save_index(&index_path).unwrap();

    let unloaded = pump_until(&h.ctx, &h.registry.queue_unload(id, &h.ctx));
    assert!(unloaded.success, "{:?}", unloaded);
    assert_eq!(h.registry.state(id), Some(BatchState::Unloaded));
    assert!(h.registry.live(id).is_empty());
    assert_eq!(h.world.lock().entity_count(), 0);

    // No other batch held a lease, so the model tree is gone and old handles
    // turned stale.
    assert_eq!(rm.total_leases(fixture.model), 0);
    assert!(storage.meta_handle_for_guid(fixture.model).is_none());
    assert!(!storage.validate(model_handle));

    // Reload from the saved file: entities respawn and every ref rebinds.
    let reloaded = pump_until(&h.ctx, &h.registry.queue_load(id, &h.ctx));
    assert!(reloaded.success, "{:?}", reloaded);
    assert_eq!(h.world.lock().entity_count(), 2);

    let world = h.world.lock();
    let player_id = world.entity_for_guid(player.guid).unwrap();
    let root_id = world.entity_for_guid(root.guid).unwrap();
    let model_component = world.get_component::<ModelComponent>(player_id).unwrap();
    assert!(storage.validate(model_component.model.handle));
    let attach = world.get_component::<AttachComponent>(player_id).unwrap();
    assert_eq!(attach.target.entity, Some(root_id));
}

#[test]
fn closure_augmentation_is_applied_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    let fixture = write_model_tree(&assets, 1, 0);
    let texture = write_texture(&assets, "wall", "wall");
    let index_path = dir.path().join("batches").join("index.json");

    let h = setup(&assets, &index_path);
    let id = h.registry.create_batch("Level 1");

    // Author a batch file whose header closure misses the texture that one
    // entity references.
    let entity_guid = Guid::generate();
    let mut data = serde_json::Map::new();
    data.insert(
        "Header".into(),
        json!({ "name": "Decal", "parent": "0" }),
    );
    data.insert(
        "DecalComponent".into(),
        json!({ "texture": texture.to_string() }),
    );
    let file = BatchFile {
        id,
        name: "Level 1".into(),
        entities: vec![EntityDesc {
            guid: entity_guid,
            archetype: String::new(),
            data,
        }],
        assets: vec![fixture.model],
    };
    let batch_path = dir
        .path()
        .join("batches")
        .join(format!("{}.batch.json", id));
    std::fs::write(&batch_path, serde_json::to_string_pretty(&file).unwrap()).unwrap();

    let events = h.ctx.events.subscribe();
    let result = pump_until(&h.ctx, &h.registry.queue_load(id, &h.ctx));
    assert!(result.success, "{:?}", result);

    // The texture was pulled in even though the header did not declare it.
    let rm = &h.ctx.resource_manager;
    assert!(rm.storage().meta_handle_for_guid(texture).is_some());
    assert!(rm.storage().meta_handle_for_guid(fixture.model).is_some());
    assert!(h.registry.closure(id).contains(&texture));
    assert_eq!(rm.total_leases(texture), 1);

    let load_event = events
        .try_iter()
        .find(|e| e.kind == BatchTaskKind::Load)
        .unwrap();
    assert!(load_event.success);
    assert_eq!(load_event.closure_delta, Some(1));

    // The decal's reference is bound.
    {
        let world = h.world.lock();
        let entity = world.entity_for_guid(entity_guid).unwrap();
        let decal = world.get_component::<DecalComponent>(entity).unwrap();
        assert!(rm.storage().validate(decal.texture.handle));
        assert_eq!(world.entity_name(entity).unwrap(), "Decal");
    }

    // Saving persists the augmented closure.
    let saved = pump_until(&h.ctx, &h.registry.queue_save_batch(id, &h.ctx));
    assert!(saved.success, "{:?}", saved);
    let saved_file: BatchFile =
        serde_json::from_str(&std::fs::read_to_string(&batch_path).unwrap()).unwrap();
    assert!(saved_file.assets.contains(&texture));
    assert!(saved_file.assets.contains(&fixture.model));
}

#[test]
fn double_queue_load_has_single_effect() {
    let dir = tempfile::tempdir().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    let fixture = write_model_tree(&assets, 0, 0);
    let index_path = dir.path().join("batches").join("index.json");

    let h = setup(&assets, &index_path);
    let id = h.registry.create_batch("Once");

    let mut data = serde_json::Map::new();
    data.insert(
        "ModelComponent".into(),
        json!({ "model": fixture.model.to_string() }),
    );
    let file = BatchFile {
        id,
        name: "Once".into(),
        entities: vec![EntityDesc {
            guid: Guid::generate(),
            archetype: String::new(),
            data,
        }],
        assets: vec![fixture.model],
    };
    std::fs::write(
        dir.path().join("batches").join(format!("{}.batch.json", id)),
        serde_json::to_string_pretty(&file).unwrap(),
    )
    .unwrap();

    // The second request is rejected up front: the batch is already queued.
    let first = h.registry.queue_load(id, &h.ctx);
    let second = h.registry.queue_load(id, &h.ctx);

    let second_result = pump_until(&h.ctx, &second);
    assert!(!second_result.success);
    let first_result = pump_until(&h.ctx, &first);
    assert!(first_result.success, "{:?}", first_result);

    assert_eq!(h.world.lock().entity_count(), 1);
    assert_eq!(h.ctx.resource_manager.total_leases(fixture.model), 1);
    assert_eq!(h.registry.live(id).len(), 1);
}

#[test]
fn illegal_transitions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    let index_path = dir.path().join("batches").join("index.json");

    let h = setup(&assets, &index_path);
    let id = h.registry.create_batch("Strict");

    // Unload before any load.
    let result = pump_until(&h.ctx, &h.registry.queue_unload(id, &h.ctx));
    assert!(!result.success);
    assert!(result.results[0].message.contains("forbidden"));
    assert_eq!(h.registry.state(id), Some(BatchState::Unloaded));

    // Entity creation is rejected until the batch is loaded.
    let created = pump_until(
        &h.ctx,
        &h.registry
            .queue_create_entity(id, "Early", EntityRef::default(), &h.ctx),
    );
    assert!(created.is_err());

    // Loading an unknown batch fails with a completed result.
    let missing = pump_until(&h.ctx, &h.registry.queue_load(Guid::generate(), &h.ctx));
    assert!(!missing.success);
}

#[test]
fn load_all_and_unload_all_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    let fixture = write_model_tree(&assets, 1, 1);
    let index_path = dir.path().join("batches").join("index.json");

    let h = setup(&assets, &index_path);
    let a = h.registry.create_batch("A");
    let b = h.registry.create_batch("B");

    for id in [a, b] {
        let file = BatchFile {
            id,
            name: format!("{id}"),
            entities: Vec::new(),
            assets: vec![fixture.model],
        };
        std::fs::write(
            dir.path().join("batches").join(format!("{}.batch.json", id)),
            serde_json::to_string_pretty(&file).unwrap(),
        )
        .unwrap();
    }

    let loaded = pump_until(&h.ctx, &h.registry.queue_load_all_async(&h.ctx));
    assert!(loaded.success, "{:?}", loaded);
    assert_eq!(h.registry.state(a), Some(BatchState::Loaded));
    assert_eq!(h.registry.state(b), Some(BatchState::Loaded));
    assert_eq!(h.ctx.resource_manager.total_leases(fixture.model), 2);

    // Unloading one batch keeps the shared model alive.
    let unloaded_a = pump_until(&h.ctx, &h.registry.queue_unload(a, &h.ctx));
    assert!(unloaded_a.success);
    assert!(h
        .ctx
        .resource_manager
        .storage()
        .meta_handle_for_guid(fixture.model)
        .is_some());

    let unloaded_rest = pump_until(&h.ctx, &h.registry.queue_unload_all_async(&h.ctx));
    assert!(unloaded_rest.success, "{:?}", unloaded_rest);
    assert_eq!(h.registry.state(b), Some(BatchState::Unloaded));
    assert!(h
        .ctx
        .resource_manager
        .storage()
        .meta_handle_for_guid(fixture.model)
        .is_none());
}

#[test]
fn destroy_and_detach_entities() {
    let dir = tempfile::tempdir().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    let index_path = dir.path().join("batches").join("index.json");

    let h = setup(&assets, &index_path);
    let id = h.registry.create_batch("Entities");
    assert!(pump_until(&h.ctx, &h.registry.queue_load(id, &h.ctx)).success);

    let a = pump_until(
        &h.ctx,
        &h.registry
            .queue_create_entity(id, "A", EntityRef::default(), &h.ctx),
    )
    .unwrap();
    let b = pump_until(
        &h.ctx,
        &h.registry
            .queue_create_entity(id, "B", EntityRef::default(), &h.ctx),
    )
    .unwrap();
    assert_eq!(h.registry.live(id).len(), 2);

    // Destroy removes from both the world and the live set.
    assert!(pump_until(&h.ctx, &h.registry.queue_destroy_entity(id, a, &h.ctx)));
    assert_eq!(h.registry.live(id).len(), 1);
    assert_eq!(h.world.lock().entity_count(), 1);

    // Detach removes only from the live set.
    assert!(pump_until(&h.ctx, &h.registry.queue_detach_entity(id, b, &h.ctx)));
    assert!(h.registry.live(id).is_empty());
    assert_eq!(h.world.lock().entity_count(), 1);

    // Attach wires it back in.
    assert!(pump_until(&h.ctx, &h.registry.queue_attach_entity(id, b, &h.ctx)));
    assert_eq!(h.registry.live(id).len(), 1);
}
