use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use onx_data_runtime::{AssetError, BatchId, Guid, OpResult, TaskKind, TaskResult};
use onx_ecs::{ComponentRegistry, ComponentValue, EntityId, EntityRef, Header};
use onx_tasks::{task_channel, SerialExecutor, TaskFuture, ThreadPool};

use crate::{
    BatchFile, BatchIndexEntry, BatchIndexFile, BatchTaskCompletedEvent, BatchTaskKind,
    EngineContext, EntityDesc, EntitySpawnDesc,
};

/// Lifecycle of a batch. `Error` is a sink reachable from `Loading` and
/// `Unloading`; an explicit unload reconciles partial state out of it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BatchState {
    Unloaded,
    Queued,
    Loading,
    Loaded,
    Unloading,
    Error,
}

impl BatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "Unloaded",
            Self::Queued => "Queued",
            Self::Loading => "Loading",
            Self::Loaded => "Loaded",
            Self::Unloading => "Unloading",
            Self::Error => "Error",
        }
    }
}

/// Registry-side record of one batch.
pub struct BatchInfo {
    pub id: BatchId,
    pub name: String,
    /// Batch file name, relative to the batches root.
    pub filename: String,
    /// Header closure plus any augmentations discovered during load.
    pub asset_closure: Vec<Guid>,
    /// Entities instantiated by the last load; empty while unloaded.
    pub live: Vec<EntityRef>,
    pub state: BatchState,
    pub last_result: Option<TaskResult>,
    /// Closure entries added beyond the header by the last load.
    pub closure_delta: Option<usize>,
}

impl BatchInfo {
    fn new(id: BatchId, name: String, filename: String) -> Self {
        Self {
            id,
            name,
            filename,
            asset_closure: Vec::new(),
            live: Vec::new(),
            state: BatchState::Unloaded,
            last_result: None,
            closure_delta: None,
        }
    }
}

/// Copyable view of a batch for tooling and tests.
#[derive(Clone, Debug)]
pub struct BatchSummary {
    pub id: BatchId,
    pub name: String,
    pub state: BatchState,
    pub live_entities: usize,
    pub asset_closure_size: usize,
}

struct BrInner {
    strand: SerialExecutor,
    batches: Mutex<HashMap<BatchId, BatchInfo>>,
    index_path: Mutex<Option<PathBuf>>,
}

/// Owns all batches and runs their state machines on a per-registry strand.
///
/// Mutating operations are posted to the strand and report through shared
/// futures plus completion events. Main-thread work (entity creation and
/// destruction, component ref passes) is routed through the context's main
/// queue.
pub struct BatchRegistry {
    inner: Arc<BrInner>,
}

impl BatchRegistry {
    pub fn new(pool: Arc<ThreadPool>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(BrInner {
                strand: SerialExecutor::new(pool),
                batches: Mutex::new(HashMap::new()),
                index_path: Mutex::new(None),
            }),
        })
    }

    // --- index persistence -------------------------------------------------

    /// Reads the batch index at `path`, creating an empty one if absent.
    pub fn load_or_create_index(&self, path: &Path) -> Result<(), AssetError> {
        *self.inner.index_path.lock() = Some(path.to_path_buf());

        if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|err| AssetError::io(Guid::INVALID, err))?;
            let file: BatchIndexFile = serde_json::from_str(&text)
                .map_err(|err| AssetError::parse(Guid::INVALID, err))?;

            let mut batches = self.inner.batches.lock();
            for entry in file.batches {
                batches
                    .entry(entry.id)
                    .or_insert_with(|| BatchInfo::new(entry.id, entry.name, entry.filename));
            }
            info!("loaded batch index with {} batch(es)", batches.len());
            Ok(())
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| AssetError::io(Guid::INVALID, err))?;
            }
            self.save_index(path)
        }
    }

    /// Writes the batch index to `path`.
    pub fn save_index(&self, path: &Path) -> Result<(), AssetError> {
        *self.inner.index_path.lock() = Some(path.to_path_buf());

        let file = BatchIndexFile {
            batches: {
                let batches = self.inner.batches.lock();
                let mut entries: Vec<BatchIndexEntry> = batches
                    .values()
                    .map(|b| BatchIndexEntry {
                        id: b.id,
                        name: b.name.clone(),
                        filename: b.filename.clone(),
                    })
                    .collect();
                entries.sort_by_key(|e| e.id);
                entries
            },
        };
        let text = serde_json::to_string_pretty(&file)
            .map_err(|err| AssetError::parse(Guid::INVALID, err))?;
        std::fs::write(path, text).map_err(|err| AssetError::io(Guid::INVALID, err))
    }

    // --- CRUD --------------------------------------------------------------

    /// Registers a new empty batch; persisted on the next `save_index`.
    pub fn create_batch(&self, name: impl Into<String>) -> BatchId {
        let id = Guid::generate();
        let name = name.into();
        let filename = format!("{}.batch.json", id);
        self.inner
            .batches
            .lock()
            .insert(id, BatchInfo::new(id, name, filename));
        id
    }

    pub fn list(&self) -> Vec<BatchSummary> {
        let mut summaries: Vec<BatchSummary> = self
            .inner
            .batches
            .lock()
            .values()
            .map(|b| BatchSummary {
                id: b.id,
                name: b.name.clone(),
                state: b.state,
                live_entities: b.live.len(),
                asset_closure_size: b.asset_closure.len(),
            })
            .collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    pub fn state(&self, id: BatchId) -> Option<BatchState> {
        self.inner.batches.lock().get(&id).map(|b| b.state)
    }

    pub fn last_result(&self, id: BatchId) -> Option<TaskResult> {
        self.inner
            .batches
            .lock()
            .get(&id)
            .and_then(|b| b.last_result.clone())
    }

    pub fn closure(&self, id: BatchId) -> Vec<Guid> {
        self.inner
            .batches
            .lock()
            .get(&id)
            .map(|b| b.asset_closure.clone())
            .unwrap_or_default()
    }

    pub fn live(&self, id: BatchId) -> Vec<EntityRef> {
        self.inner
            .batches
            .lock()
            .get(&id)
            .map(|b| b.live.clone())
            .unwrap_or_default()
    }

    // --- orchestration -----------------------------------------------------

    /// Queues the full load sequence; completes when the batch reached
    /// `Loaded` (or `Error`).
    pub fn queue_load(&self, id: BatchId, ctx: &EngineContext) -> TaskFuture<TaskResult> {
        if let Err(result) = self.inner.try_transition(
            id,
            TaskKind::Load,
            &[BatchState::Unloaded],
            BatchState::Queued,
        ) {
            return TaskFuture::ready(result);
        }

        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let (promise, future) = task_channel();
        self.inner.strand.post(move || {
            inner.set_state(id, BatchState::Loading);
            let result = inner.do_load(id, &ctx);
            let state = if result.success {
                BatchState::Loaded
            } else {
                BatchState::Error
            };
            inner.finish(id, &ctx, BatchTaskKind::Load, &result, state);
            let _ = promise.fulfill(result);
        });
        future
    }

    /// Queues the inverse sequence; also legal from `Error` to reconcile a
    /// partial load.
    pub fn queue_unload(&self, id: BatchId, ctx: &EngineContext) -> TaskFuture<TaskResult> {
        if let Err(result) = self.inner.try_transition(
            id,
            TaskKind::Unload,
            &[BatchState::Loaded, BatchState::Error],
            BatchState::Unloading,
        ) {
            return TaskFuture::ready(result);
        }

        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let (promise, future) = task_channel();
        self.inner.strand.post(move || {
            inner.set_state(id, BatchState::Unloading);
            let result = inner.do_unload(id, &ctx);
            let state = if result.success {
                BatchState::Unloaded
            } else {
                BatchState::Error
            };
            inner.finish(id, &ctx, BatchTaskKind::Unload, &result, state);
            let _ = promise.fulfill(result);
        });
        future
    }

    /// Loads every currently unloaded batch; the future resolves when all of
    /// them finished their full sequence. Aggregation runs on a worker, not
    /// the strand, so individual loads can proceed.
    pub fn queue_load_all_async(&self, ctx: &EngineContext) -> TaskFuture<TaskResult> {
        let ids: Vec<BatchId> = self
            .inner
            .batches
            .lock()
            .values()
            .filter(|b| b.state == BatchState::Unloaded)
            .map(|b| b.id)
            .collect();
        let futures: Vec<_> = ids.iter().map(|id| self.queue_load(*id, ctx)).collect();
        self.aggregate(ctx, BatchTaskKind::LoadAll, TaskKind::Load, futures)
    }

    pub fn queue_unload_all_async(&self, ctx: &EngineContext) -> TaskFuture<TaskResult> {
        let ids: Vec<BatchId> = self
            .inner
            .batches
            .lock()
            .values()
            .filter(|b| b.state == BatchState::Loaded)
            .map(|b| b.id)
            .collect();
        let futures: Vec<_> = ids.iter().map(|id| self.queue_unload(*id, ctx)).collect();
        self.aggregate(ctx, BatchTaskKind::UnloadAll, TaskKind::Unload, futures)
    }

    /// Saves one batch's file (entities from the live set when loaded).
    pub fn queue_save_batch(&self, id: BatchId, ctx: &EngineContext) -> TaskFuture<TaskResult> {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let (promise, future) = task_channel();
        self.inner.strand.post(move || {
            let result = inner.save_batch_impl(id, &ctx);
            inner.publish_event(&ctx, BatchTaskKind::Save, id, result.success);
            let _ = promise.fulfill(result);
        });
        future
    }

    /// Saves every loaded batch; unloaded batches are skipped.
    pub fn queue_save_all_async(&self, ctx: &EngineContext) -> TaskFuture<TaskResult> {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let (promise, future) = task_channel();
        self.inner.strand.post(move || {
            let ids: Vec<BatchId> = inner
                .batches
                .lock()
                .values()
                .filter(|b| b.state == BatchState::Loaded)
                .map(|b| b.id)
                .collect();

            let mut result = TaskResult::new(TaskKind::Save);
            for id in ids {
                result.merge(inner.save_batch_impl(id, &ctx));
            }
            inner.publish_event(&ctx, BatchTaskKind::SaveAll, Guid::INVALID, result.success);
            let _ = promise.fulfill(result);
        });
        future
    }

    /// Creates a fresh entity in a loaded batch.
    pub fn queue_create_entity(
        &self,
        id: BatchId,
        name: impl Into<String>,
        parent: EntityRef,
        ctx: &EngineContext,
    ) -> TaskFuture<Result<EntityRef, String>> {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let name = name.into();
        let (promise, future) = task_channel();
        self.inner.strand.post(move || {
            if let Err(err) = inner.require_state(id, BatchState::Loaded) {
                inner.publish_event(&ctx, BatchTaskKind::CreateEntity, id, false);
                let _ = promise.fulfill(Err(err.to_string()));
                return;
            }

            let main_ctx = ctx.clone();
            let created = ctx.main_queue.push_and_wait(move || {
                let mut em = main_ctx.entity_manager.lock();
                let mut parent = parent;
                if parent.guid.is_valid() && !parent.has_entity() {
                    parent.entity = em.entity_for_guid(parent.guid);
                }
                em.create_entity(&name, parent)
            });

            let outcome = match created {
                Ok(reference) => {
                    if let Some(batch) = inner.batches.lock().get_mut(&id) {
                        batch.live.push(reference);
                    }
                    Ok(reference)
                }
                Err(_) => Err(AssetError::Aborted.to_string()),
            };
            inner.publish_event(&ctx, BatchTaskKind::CreateEntity, id, outcome.is_ok());
            let _ = promise.fulfill(outcome);
        });
        future
    }

    /// Destroys an entity and removes it from the batch's live set.
    pub fn queue_destroy_entity(
        &self,
        id: BatchId,
        entity: EntityRef,
        ctx: &EngineContext,
    ) -> TaskFuture<bool> {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let (promise, future) = task_channel();
        self.inner.strand.post(move || {
            let allowed = inner.require_state(id, BatchState::Loaded).is_ok();
            let destroyed = allowed
                && ctx
                    .main_queue
                    .push_and_wait({
                        let ctx = ctx.clone();
                        move || ctx.entity_manager.lock().destroy_entity(entity)
                    })
                    .unwrap_or(false);
            if destroyed {
                if let Some(batch) = inner.batches.lock().get_mut(&id) {
                    batch.live.retain(|er| er.guid != entity.guid);
                }
            }
            inner.publish_event(&ctx, BatchTaskKind::DestroyEntity, id, destroyed);
            let _ = promise.fulfill(destroyed);
        });
        future
    }

    /// Adds an already-existing entity to the batch, augmenting the closure
    /// with the assets it references. Does not spawn.
    pub fn queue_attach_entity(
        &self,
        id: BatchId,
        entity: EntityRef,
        ctx: &EngineContext,
    ) -> TaskFuture<bool> {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let (promise, future) = task_channel();
        self.inner.strand.post(move || {
            let attached = inner.attach_entity_impl(id, entity, &ctx);
            inner.publish_event(&ctx, BatchTaskKind::AttachEntity, id, attached);
            let _ = promise.fulfill(attached);
        });
        future
    }

    /// Removes an entity from the batch's live set without destroying it.
    pub fn queue_detach_entity(
        &self,
        id: BatchId,
        entity: EntityRef,
        ctx: &EngineContext,
    ) -> TaskFuture<bool> {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let (promise, future) = task_channel();
        self.inner.strand.post(move || {
            let detached = inner.require_state(id, BatchState::Loaded).is_ok() && {
                let mut batches = inner.batches.lock();
                match batches.get_mut(&id) {
                    Some(batch) => {
                        let before = batch.live.len();
                        batch.live.retain(|er| er.guid != entity.guid);
                        batch.live.len() != before
                    }
                    None => false,
                }
            };
            inner.publish_event(&ctx, BatchTaskKind::DetachEntity, id, detached);
            let _ = promise.fulfill(detached);
        });
        future
    }

    /// Spawns an entity from a description into a loaded batch, loading any
    /// assets it references that the closure does not cover yet.
    pub fn queue_spawn_entity(
        &self,
        id: BatchId,
        desc: EntitySpawnDesc,
        ctx: &EngineContext,
    ) -> TaskFuture<Result<EntityRef, String>> {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let (promise, future) = task_channel();
        self.inner.strand.post(move || {
            let outcome = inner.spawn_entity_impl(id, desc, &ctx);
            inner.publish_event(&ctx, BatchTaskKind::SpawnEntity, id, outcome.is_ok());
            let _ = promise.fulfill(outcome);
        });
        future
    }

    fn aggregate(
        &self,
        ctx: &EngineContext,
        kind: BatchTaskKind,
        task_kind: TaskKind,
        futures: Vec<TaskFuture<TaskResult>>,
    ) -> TaskFuture<TaskResult> {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let pool = Arc::clone(&ctx.thread_pool);
        let (promise, future) = task_channel();
        pool.spawn(move || {
            let mut result = TaskResult::new(task_kind);
            for f in futures {
                match f.wait() {
                    Ok(sub) => result.merge(sub),
                    Err(_) => result.push(OpResult::failed(Guid::INVALID, AssetError::Aborted)),
                }
            }
            inner.publish_event(&ctx, kind, Guid::INVALID, result.success);
            let _ = promise.fulfill(result);
        });
        future
    }
}

impl BrInner {
    // --- transitions & events ----------------------------------------------

    fn try_transition(
        &self,
        id: BatchId,
        kind: TaskKind,
        allowed: &[BatchState],
        next: BatchState,
    ) -> Result<(), TaskResult> {
        let mut batches = self.batches.lock();
        let Some(batch) = batches.get_mut(&id) else {
            return Err(TaskResult::failed(kind, id, AssetError::NotFound(id)));
        };
        if !allowed.contains(&batch.state) {
            return Err(TaskResult::failed(
                kind,
                id,
                AssetError::StateTransitionForbidden {
                    state: batch.state.as_str(),
                },
            ));
        }
        batch.state = next;
        Ok(())
    }

    fn require_state(&self, id: BatchId, wanted: BatchState) -> Result<(), AssetError> {
        match self.batches.lock().get(&id).map(|b| b.state) {
            None => Err(AssetError::NotFound(id)),
            Some(state) if state == wanted => Ok(()),
            Some(state) => Err(AssetError::StateTransitionForbidden {
                state: state.as_str(),
            }),
        }
    }

    fn set_state(&self, id: BatchId, state: BatchState) {
        if let Some(batch) = self.batches.lock().get_mut(&id) {
            batch.state = state;
        }
    }

    fn finish(
        &self,
        id: BatchId,
        ctx: &EngineContext,
        kind: BatchTaskKind,
        result: &TaskResult,
        state: BatchState,
    ) {
        let event = {
            let mut batches = self.batches.lock();
            let Some(batch) = batches.get_mut(&id) else {
                return;
            };
            batch.state = state;
            batch.last_result = Some(result.clone());
            BatchTaskCompletedEvent {
                kind,
                batch_id: id,
                batch_name: batch.name.clone(),
                success: result.success,
                live_entities: batch.live.len(),
                asset_closure_size: batch.asset_closure.len(),
                closure_delta: batch.closure_delta,
            }
        };
        ctx.events.publish(&event);
    }

    fn publish_event(&self, ctx: &EngineContext, kind: BatchTaskKind, id: BatchId, success: bool) {
        let (name, live, closure) = {
            let batches = self.batches.lock();
            match batches.get(&id) {
                Some(b) => (b.name.clone(), b.live.len(), b.asset_closure.len()),
                None => (String::new(), 0, 0),
            }
        };
        ctx.events.publish(&BatchTaskCompletedEvent {
            kind,
            batch_id: id,
            batch_name: name,
            success,
            live_entities: live,
            asset_closure_size: closure,
            closure_delta: None,
        });
    }

    fn batches_root(&self) -> Option<PathBuf> {
        self.index_path
            .lock()
            .as_ref()
            .and_then(|p| p.parent().map(Path::to_path_buf))
    }

    fn batch_file_path(&self, filename: &str) -> Option<PathBuf> {
        self.batches_root().map(|root| root.join(filename))
    }

    // --- load/unload sequences (strand side) --------------------------------

    fn do_load(&self, id: BatchId, ctx: &EngineContext) -> TaskResult {
        let mut result = TaskResult::new(TaskKind::Load);
        let (filename, mut closure) = {
            let batches = self.batches.lock();
            let Some(batch) = batches.get(&id) else {
                result.push(OpResult::failed(id, AssetError::NotFound(id)));
                return result;
            };
            (batch.filename.clone(), batch.asset_closure.clone())
        };

        // 1. Recompute the closure: header roots from the batch file, plus
        //    every asset referenced by the entity descriptions.
        let mut descs: Vec<EntityDesc> = Vec::new();
        if let Some(path) = self.batch_file_path(&filename) {
            if path.exists() {
                match read_batch_file(&path) {
                    Ok(file) => {
                        for guid in file.assets {
                            if !closure.contains(&guid) {
                                closure.push(guid);
                            }
                        }
                        descs = file.entities;
                    }
                    Err(err) => {
                        result.push(OpResult::failed(id, err));
                        return result;
                    }
                }
            }
        }

        let header_len = closure.len();
        for guid in collect_desc_asset_guids(&descs, &ctx.components) {
            if !closure.contains(&guid) {
                closure.push(guid);
            }
        }
        let delta = closure.len() - header_len;
        if delta > 0 {
            info!("batch {}: {}", id, AssetError::ClosureAugmented { added: delta });
            result.push(OpResult::ok_with(
                id,
                AssetError::ClosureAugmented { added: delta }.to_string(),
            ));
        }
        {
            let mut batches = self.batches.lock();
            if let Some(batch) = batches.get_mut(&id) {
                batch.asset_closure = closure.clone();
                batch.closure_delta = (delta > 0).then_some(delta);
            }
        }

        // 2. Load and bind the closure through the resource manager.
        match ctx
            .resource_manager
            .load_and_bind_async(closure.into_iter().collect(), id)
            .wait()
        {
            Ok(rm_result) => {
                let ok = rm_result.success;
                result.merge(rm_result);
                if !ok {
                    return result;
                }
            }
            Err(_) => {
                result.push(OpResult::failed(id, AssetError::Aborted));
                return result;
            }
        }

        // 3.-5. Spawn entities and resolve their references on the main
        // thread. Live entities are recorded even on failure so a subsequent
        // unload can reconcile.
        let main_ctx = ctx.clone();
        let spawned = ctx
            .main_queue
            .push_and_wait(move || spawn_and_resolve(&main_ctx, descs));
        match spawned {
            Ok((live, spawn_error)) => {
                let count = live.len();
                if let Some(batch) = self.batches.lock().get_mut(&id) {
                    batch.live = live;
                }
                match spawn_error {
                    None => result.push(OpResult::ok_with(id, format!("{} entities live", count))),
                    Some(message) => result.push(OpResult::failed(id, message)),
                }
            }
            Err(_) => result.push(OpResult::failed(id, AssetError::Aborted)),
        }

        result
    }

    fn do_unload(&self, id: BatchId, ctx: &EngineContext) -> TaskResult {
        let mut result = TaskResult::new(TaskKind::Unload);
        let (closure, live) = {
            let mut batches = self.batches.lock();
            let Some(batch) = batches.get_mut(&id) else {
                result.push(OpResult::failed(id, AssetError::NotFound(id)));
                return result;
            };
            (batch.asset_closure.clone(), std::mem::take(&mut batch.live))
        };

        // Entities leave the world before their assets do.
        let main_ctx = ctx.clone();
        let destroyed = ctx.main_queue.push_and_wait(move || {
            let mut em = main_ctx.entity_manager.lock();
            let mut count = 0;
            for entity in live {
                if em.destroy_entity(entity) {
                    count += 1;
                }
            }
            count
        });
        match destroyed {
            Ok(count) => {
                result.push(OpResult::ok_with(id, format!("{} entities destroyed", count)));
            }
            Err(_) => {
                result.push(OpResult::failed(id, AssetError::Aborted));
                return result;
            }
        }

        match ctx
            .resource_manager
            .unbind_and_unload_async(closure.into_iter().collect(), id)
            .wait()
        {
            Ok(rm_result) => result.merge(rm_result),
            Err(_) => result.push(OpResult::failed(id, AssetError::Aborted)),
        }

        result
    }

    fn attach_entity_impl(&self, id: BatchId, entity: EntityRef, ctx: &EngineContext) -> bool {
        if self.require_state(id, BatchState::Loaded).is_err() {
            return false;
        }

        // Guids the entity references, via the main thread.
        let main_ctx = ctx.clone();
        let Ok(Some((entity, referenced))) = ctx.main_queue.push_and_wait(move || {
            let mut em = main_ctx.entity_manager.lock();
            let resolved = entity
                .entity
                .or_else(|| em.entity_for_guid(entity.guid))
                .filter(|&e| em.is_alive(e))?;
            let guids = em.collect_asset_guids(resolved);
            Some((EntityRef::with_entity(entity.guid, resolved), guids))
        }) else {
            return false;
        };

        // Augment the closure, load whatever is missing, then rebind the
        // entity's own references.
        {
            let mut batches = self.batches.lock();
            let Some(batch) = batches.get_mut(&id) else {
                return false;
            };
            for guid in &referenced {
                if !batch.asset_closure.contains(guid) {
                    batch.asset_closure.push(*guid);
                }
            }
        }
        if !referenced.is_empty() {
            let loaded = ctx
                .resource_manager
                .load_and_bind_async(referenced.into_iter().collect(), id)
                .wait();
            if !matches!(loaded, Ok(ref r) if r.success) {
                return false;
            }
        }

        let main_ctx = ctx.clone();
        let bound = ctx.main_queue.push_and_wait(move || {
            let mut em = main_ctx.entity_manager.lock();
            let storage = Arc::clone(main_ctx.resource_manager.storage());
            let mut ok = true;
            em.visit_asset_refs(entity.entity.expect("resolved above"), &mut |r| {
                if r.guid().is_valid() && r.rebind(&storage).is_err() {
                    ok = false;
                }
            });
            ok
        });
        if !matches!(bound, Ok(true)) {
            return false;
        }

        if let Some(batch) = self.batches.lock().get_mut(&id) {
            if !batch.live.iter().any(|er| er.guid == entity.guid) {
                batch.live.push(entity);
            }
        }
        true
    }

    fn spawn_entity_impl(
        &self,
        id: BatchId,
        desc: EntitySpawnDesc,
        ctx: &EngineContext,
    ) -> Result<EntityRef, String> {
        self.require_state(id, BatchState::Loaded)
            .map_err(|err| err.to_string())?;

        // Closure augmentation before anything is instantiated.
        let entity_desc = EntityDesc {
            guid: Guid::generate(),
            archetype: desc.archetype.clone(),
            data: desc.data.clone(),
        };
        let referenced =
            collect_desc_asset_guids(std::slice::from_ref(&entity_desc), &ctx.components);
        {
            let mut batches = self.batches.lock();
            let batch = batches.get_mut(&id).ok_or("batch disappeared")?;
            for guid in &referenced {
                if !batch.asset_closure.contains(guid) {
                    batch.asset_closure.push(*guid);
                }
            }
        }
        if !referenced.is_empty() {
            let loaded = ctx
                .resource_manager
                .load_and_bind_async(referenced.iter().copied().collect(), id)
                .wait()
                .map_err(|err| err.to_string())?;
            if !loaded.success {
                return Err("failed to load referenced assets".into());
            }
        }

        let main_ctx = ctx.clone();
        let name = desc.name.clone();
        let parent = desc.parent;
        let spawned = ctx
            .main_queue
            .push_and_wait(move || {
                let mut em = main_ctx.entity_manager.lock();
                let mut parent = parent;
                if parent.guid.is_valid() && !parent.has_entity() {
                    parent.entity = em.entity_for_guid(parent.guid);
                }
                let reference = em.create_entity_with_guid(entity_desc.guid, &name, parent);
                let entity = reference.entity.ok_or("entity creation failed")?;

                if !entity_desc.archetype.is_empty() {
                    if let Ok(component) = main_ctx.components.instantiate(&entity_desc.archetype) {
                        em.insert_component(entity, component);
                    }
                }
                for (type_name, value) in &entity_desc.data {
                    if type_name == Header::TYPE_NAME {
                        continue; // the header came from name/parent above
                    }
                    em.apply_component(entity, type_name, value, &main_ctx.components)
                        .map_err(|err| err.to_string())?;
                }

                // Refs resolve immediately: all peers already exist.
                let mut wanted = Vec::new();
                em.visit_entity_refs(entity, &mut |r| wanted.push(r.guid));
                let resolved: HashMap<Guid, Option<EntityId>> = wanted
                    .into_iter()
                    .map(|guid| (guid, em.entity_for_guid(guid)))
                    .collect();
                em.visit_entity_refs(entity, &mut |r| {
                    if let Some(Some(target)) = resolved.get(&r.guid) {
                        r.entity = Some(*target);
                    }
                });

                let storage = Arc::clone(main_ctx.resource_manager.storage());
                let mut bind_failure: Option<String> = None;
                em.visit_asset_refs(entity, &mut |r| {
                    if r.guid().is_valid() && bind_failure.is_none() {
                        if let Err(err) = r.rebind(&storage) {
                            bind_failure = Some(err.to_string());
                        }
                    }
                });
                match bind_failure {
                    None => Ok(reference),
                    Some(message) => Err(message),
                }
            })
            .map_err(|_| AssetError::Aborted.to_string())??;

        if let Some(batch) = self.batches.lock().get_mut(&id) {
            batch.live.push(spawned);
        }
        Ok(spawned)
    }

    fn save_batch_impl(&self, id: BatchId, ctx: &EngineContext) -> TaskResult {
        let mut result = TaskResult::new(TaskKind::Save);
        let (name, filename, closure, live, state) = {
            let batches = self.batches.lock();
            let Some(batch) = batches.get(&id) else {
                result.push(OpResult::failed(id, AssetError::NotFound(id)));
                return result;
            };
            (
                batch.name.clone(),
                batch.filename.clone(),
                batch.asset_closure.clone(),
                batch.live.clone(),
                batch.state,
            )
        };
        let Some(path) = self.batch_file_path(&filename) else {
            result.push(OpResult::failed(id, AssetError::NotFound(id)));
            return result;
        };

        // A loaded batch serializes its live entities; otherwise the entity
        // list of an existing file is preserved.
        let entities = if state == BatchState::Loaded {
            let main_ctx = ctx.clone();
            match ctx.main_queue.push_and_wait(move || {
                let em = main_ctx.entity_manager.lock();
                live.iter()
                    .map(|er| {
                        let entity = er.entity.ok_or_else(|| "unresolved entity".to_string())?;
                        let data = em
                            .serialize_components(entity)
                            .map_err(|err| err.to_string())?;
                        Ok(EntityDesc {
                            guid: er.guid,
                            archetype: String::new(),
                            data,
                        })
                    })
                    .collect::<Result<Vec<_>, String>>()
            }) {
                Ok(Ok(descs)) => descs,
                Ok(Err(message)) => {
                    result.push(OpResult::failed(id, message));
                    return result;
                }
                Err(_) => {
                    result.push(OpResult::failed(id, AssetError::Aborted));
                    return result;
                }
            }
        } else if path.exists() {
            match read_batch_file(&path) {
                Ok(file) => file.entities,
                Err(err) => {
                    result.push(OpResult::failed(id, err));
                    return result;
                }
            }
        } else {
            Vec::new()
        };

        let file = BatchFile {
            id,
            name,
            entities,
            assets: closure,
        };
        match write_batch_file(&path, &file) {
            Ok(()) => result.push(OpResult::ok(id)),
            Err(err) => result.push(OpResult::failed(id, err)),
        }
        result
    }
}

/// Main-thread body of the load sequence: instantiate every entity, then
/// resolve entity refs (all peers exist now), then asset refs.
fn spawn_and_resolve(
    ctx: &EngineContext,
    descs: Vec<EntityDesc>,
) -> (Vec<EntityRef>, Option<String>) {
    let mut em = ctx.entity_manager.lock();
    let mut live = Vec::new();

    for desc in &descs {
        let reference = em.create_entity_with_guid(desc.guid, "", EntityRef::default());
        let Some(entity) = reference.entity else {
            return (live, Some("entity creation failed".into()));
        };
        live.push(reference);

        if !desc.archetype.is_empty() {
            match ctx.components.instantiate(&desc.archetype) {
                Ok(component) => {
                    em.insert_component(entity, component);
                }
                Err(_) => warn!(
                    "batch entity {}: unknown archetype '{}'",
                    desc.guid, desc.archetype
                ),
            }
        }
        for (type_name, value) in &desc.data {
            if let Err(err) = em.apply_component(entity, type_name, value, &ctx.components) {
                return (live, Some(format!("component '{}': {}", type_name, err)));
            }
        }
    }

    // Entity-ref pass. Lookups are gathered first so the visitor does not
    // re-enter the manager.
    let mut wanted = Vec::new();
    for reference in &live {
        em.visit_entity_refs(reference.entity.expect("spawned above"), &mut |r| {
            wanted.push(r.guid);
        });
    }
    let resolved: HashMap<Guid, Option<EntityId>> = wanted
        .into_iter()
        .map(|guid| (guid, em.entity_for_guid(guid)))
        .collect();
    for reference in &live {
        em.visit_entity_refs(reference.entity.expect("spawned above"), &mut |r| {
            if let Some(Some(entity)) = resolved.get(&r.guid) {
                r.entity = Some(*entity);
            }
        });
    }

    // Asset-ref pass.
    let storage = Arc::clone(ctx.resource_manager.storage());
    let mut bind_failure = None;
    for reference in &live {
        em.visit_asset_refs(reference.entity.expect("spawned above"), &mut |r| {
            if r.guid().is_valid() && bind_failure.is_none() {
                if let Err(err) = r.rebind(&storage) {
                    bind_failure = Some(err.to_string());
                }
            }
        });
    }

    (live, bind_failure)
}

// --- batch file io ----------------------------------------------------------

fn read_batch_file(path: &Path) -> Result<BatchFile, AssetError> {
    let text = std::fs::read_to_string(path).map_err(|err| AssetError::io(Guid::INVALID, err))?;
    serde_json::from_str(&text).map_err(|err| AssetError::parse(Guid::INVALID, err))
}

fn write_batch_file(path: &Path, file: &BatchFile) -> Result<(), AssetError> {
    let text = serde_json::to_string_pretty(file).map_err(|err| AssetError::parse(file.id, err))?;
    std::fs::write(path, text).map_err(|err| AssetError::io(file.id, err))
}

/// Asset guids referenced by entity descriptions, discovered by deserializing
/// their components through the registered hooks.
fn collect_desc_asset_guids(descs: &[EntityDesc], components: &ComponentRegistry) -> Vec<Guid> {
    let mut guids = Vec::new();
    for desc in descs {
        for (type_name, value) in &desc.data {
            match components.deserialize(type_name, value) {
                Ok(mut component) => {
                    component.visit_asset_refs(&mut |r| {
                        if r.guid().is_valid() && !guids.contains(&r.guid()) {
                            guids.push(r.guid());
                        }
                    });
                }
                Err(err) => {
                    // Real failures resurface when the component is applied
                    // during spawn.
                    warn!("closure scan of '{}' failed: {}", type_name, err);
                }
            }
        }
    }
    guids
}
