use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use onx_tasks::{task_channel, EventBus, SerialExecutor, TaskFuture, ThreadPool};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    AssetError, AssetIndex, AssetIndexData, AssetTypeRegistry, BatchId, Guid, OpResult,
    ResourceTaskCompletedEvent, Storage, TaskKind, TaskResult,
};

/// Coarse lifecycle of a guid as seen by the resource manager.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AssetStatus {
    Unloaded,
    Queued,
    Loading,
    Loaded,
    Failed,
}

#[derive(Default)]
struct AssetLease {
    total: u32,
    by_batch: HashMap<BatchId, u32>,
}

struct RmInner {
    storage: Arc<Storage>,
    index: Arc<AssetIndex>,
    types: Arc<AssetTypeRegistry>,
    strand: SerialExecutor,
    leases: Mutex<HashMap<Guid, AssetLease>>,
    statuses: Mutex<HashMap<Guid, AssetStatus>>,
    events: EventBus<ResourceTaskCompletedEvent>,
}

/// Serialized orchestration of scan/load/unload/reload over [`Storage`].
///
/// Every mutating operation runs on a single strand, which is what upholds
/// at-most-one in-flight load per guid. Batches lease the guids they loaded;
/// an asset becomes eligible for unload only when its total lease count
/// reaches zero.
pub struct ResourceManager {
    inner: Arc<RmInner>,
}

impl ResourceManager {
    pub fn new(pool: Arc<ThreadPool>, types: Arc<AssetTypeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(RmInner {
                storage: Arc::new(Storage::new()),
                index: Arc::new(AssetIndex::new()),
                types,
                strand: SerialExecutor::new(pool),
                leases: Mutex::new(HashMap::new()),
                statuses: Mutex::new(HashMap::new()),
                events: EventBus::new(),
            }),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.inner.storage
    }

    pub fn index(&self) -> &Arc<AssetIndex> {
        &self.inner.index
    }

    pub fn types(&self) -> &Arc<AssetTypeRegistry> {
        &self.inner.types
    }

    /// Snapshot of the asset index.
    pub fn index_data(&self) -> Arc<AssetIndexData> {
        self.inner.index.snapshot()
    }

    pub fn get_status(&self, guid: Guid) -> AssetStatus {
        *self
            .inner
            .statuses
            .lock()
            .get(&guid)
            .unwrap_or(&AssetStatus::Unloaded)
    }

    /// Subscribe to task-completion events; drained on the main loop.
    pub fn subscribe_events(&self) -> crossbeam_channel::Receiver<ResourceTaskCompletedEvent> {
        self.inner.events.subscribe()
    }

    pub fn queued_tasks(&self) -> usize {
        self.inner.strand.queued()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.strand.is_busy()
    }

    pub fn wait_until_idle(&self) {
        self.inner.strand.wait_idle();
    }

    pub fn total_leases(&self, guid: Guid) -> u32 {
        self.inner.leases.lock().get(&guid).map_or(0, |l| l.total)
    }

    pub fn held_by_any(&self, guid: Guid) -> bool {
        self.total_leases(guid) > 0
    }

    pub fn held_by_batch(&self, guid: Guid, batch: BatchId) -> bool {
        self.inner
            .leases
            .lock()
            .get(&guid)
            .and_then(|l| l.by_batch.get(&batch))
            .map_or(false, |c| *c > 0)
    }

    // --- direct ref-count access for non-batch callers ---------------------

    pub fn retain_guid(&self, guid: Guid) -> Result<u32, AssetError> {
        let meta = self
            .inner
            .storage
            .meta_handle_for_guid(guid)
            .ok_or(AssetError::NotFound(guid))?;
        self.inner.storage.retain(meta)
    }

    pub fn release_guid(&self, guid: Guid) -> Result<u32, AssetError> {
        let meta = self
            .inner
            .storage
            .meta_handle_for_guid(guid)
            .ok_or(AssetError::NotFound(guid))?;
        self.inner.storage.release(meta)
    }

    // --- async operations --------------------------------------------------

    /// Rescans the asset root and publishes a fresh index snapshot.
    pub fn scan_assets_async(&self, root: PathBuf) -> TaskFuture<TaskResult> {
        post_task(&self.inner, move |rm| {
            let mut result = TaskResult::new(TaskKind::Scan);
            match rm.index.scan(&root) {
                Ok(stats) => result.push(OpResult::ok_with(
                    Guid::INVALID,
                    format!("indexed {} asset(s), skipped {}", stats.indexed, stats.skipped),
                )),
                Err(err) => result.push(OpResult::failed(Guid::INVALID, err)),
            }
            result
        })
    }

    /// Loads the given guids (roots first) and their contained assets, then
    /// binds inter-asset references. Leases every touched guid to `batch`.
    pub fn load_and_bind_async(
        &self,
        guids: VecDeque<Guid>,
        batch: BatchId,
    ) -> TaskFuture<TaskResult> {
        {
            let mut statuses = self.inner.statuses.lock();
            for &guid in &guids {
                statuses.entry(guid).or_insert(AssetStatus::Queued);
            }
        }
        post_task(&self.inner, move |rm| rm.load_and_bind_impl(guids, batch))
    }

    /// Releases leases and unloads every guid whose total lease count reached
    /// zero, clearing its outgoing references first.
    pub fn unbind_and_unload_async(
        &self,
        guids: VecDeque<Guid>,
        batch: BatchId,
    ) -> TaskFuture<TaskResult> {
        post_task(&self.inner, move |rm| rm.unbind_and_unload_impl(guids, batch))
    }

    /// Replaces the stored values of loaded guids from disk and rebinds.
    pub fn reload_and_rebind_async(
        &self,
        guids: VecDeque<Guid>,
        batch: BatchId,
    ) -> TaskFuture<TaskResult> {
        post_task(&self.inner, move |rm| rm.reload_and_rebind_impl(guids, batch))
    }
}

fn post_task(
    inner: &Arc<RmInner>,
    task: impl FnOnce(&RmInner) -> TaskResult + Send + 'static,
) -> TaskFuture<TaskResult> {
    let (promise, future) = task_channel();
    let rm = Arc::clone(inner);
    inner.strand.post(move || {
        let result = task(&rm);
        rm.events.publish(&(&result).into());
        let _ = promise.fulfill(result);
    });
    future
}

impl RmInner {
    // --- lease bookkeeping -------------------------------------------------

    /// First acquire per (batch, guid) counts; repeats are no-ops.
    fn batch_acquire(&self, batch: BatchId, guid: Guid) -> bool {
        let mut leases = self.leases.lock();
        let lease = leases.entry(guid).or_default();
        let count = lease.by_batch.entry(batch).or_insert(0);
        if *count == 0 {
            *count += 1;
            lease.total += 1;
            true
        } else {
            false
        }
    }

    /// Returns true when the total lease count reached zero.
    fn batch_release(&self, batch: BatchId, guid: Guid) -> bool {
        let mut leases = self.leases.lock();
        let Some(lease) = leases.get_mut(&guid) else {
            return false;
        };
        let Some(count) = lease.by_batch.get_mut(&batch) else {
            return false;
        };
        if *count == 0 {
            return false;
        }
        *count -= 1;
        lease.total -= 1;
        if *count == 0 {
            lease.by_batch.remove(&batch);
        }
        if lease.total == 0 {
            leases.remove(&guid);
            true
        } else {
            false
        }
    }

    fn set_status(&self, guid: Guid, status: AssetStatus) {
        self.statuses.lock().insert(guid, status);
    }

    /// BFS expansion of a request: requested guids first, then their
    /// `contained_assets` transitively, deduplicated.
    fn expand_request(&self, guids: VecDeque<Guid>) -> Vec<Guid> {
        let snapshot = self.index.snapshot();
        let mut queue = guids;
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();

        while let Some(guid) = queue.pop_front() {
            if !guid.is_valid() || !seen.insert(guid) {
                continue;
            }
            ordered.push(guid);
            if let Some(entry) = snapshot.entry_for_guid(guid) {
                queue.extend(entry.meta.contained_assets.iter().copied());
            }
        }
        ordered
    }

    fn load_and_bind_impl(&self, guids: VecDeque<Guid>, batch: BatchId) -> TaskResult {
        let mut result = TaskResult::new(TaskKind::Load);
        let ordered = self.expand_request(guids);
        let snapshot = self.index.snapshot();

        // Load pass.
        for &guid in &ordered {
            self.batch_acquire(batch, guid);

            if self.storage.meta_handle_for_guid(guid).is_some() {
                result.push(OpResult::ok_with(guid, "already loaded"));
                continue;
            }

            let Some(entry) = snapshot.entry_for_guid(guid) else {
                self.set_status(guid, AssetStatus::Failed);
                result.push(OpResult::failed(guid, AssetError::NotFound(guid)));
                continue;
            };

            self.set_status(guid, AssetStatus::Loading);
            match self
                .types
                .load(&entry.meta.type_name, &self.storage, &self.index, guid)
            {
                Ok(_) => {
                    self.set_status(guid, AssetStatus::Loaded);
                    debug!("loaded {} ({})", guid, entry.meta.type_name);
                    result.push(OpResult::ok(guid));
                }
                Err(err) => {
                    self.set_status(guid, AssetStatus::Failed);
                    warn!("load of {} failed: {}", guid, err);
                    result.push(OpResult::failed(guid, err));
                }
            }
        }

        // Bind pass over everything that is now in storage. A missing child
        // here is a scan or closure bug and fails the task, but the loaded
        // assets stay so a retry can progress.
        for &guid in &ordered {
            let Some(meta) = self.storage.meta_handle_for_guid(guid) else {
                continue;
            };
            let bound = self
                .types
                .entry_by_type_id(meta.type_id())
                .and_then(|entry| entry.bind(&self.storage, guid));
            if let Err(err) = bound {
                warn!("bind of {} failed: {}", guid, err);
                result.push(OpResult::failed(guid, err));
            }
        }

        result
    }

    fn unbind_and_unload_impl(&self, guids: VecDeque<Guid>, batch: BatchId) -> TaskResult {
        let mut result = TaskResult::new(TaskKind::Unload);
        let ordered = self.expand_request(guids);

        for &guid in &ordered {
            if !self.batch_release(batch, guid) {
                result.push(OpResult::ok_with(guid, "leases remain"));
                continue;
            }

            let Some(meta) = self.storage.meta_handle_for_guid(guid) else {
                result.push(OpResult::ok_with(guid, "not loaded"));
                continue;
            };

            let unloaded = self
                .types
                .entry_by_type_id(meta.type_id())
                .and_then(|entry| {
                    entry.unbind(&self.storage, guid)?;
                    entry.unload(&self.storage, guid)
                });
            match unloaded {
                Ok(()) => {
                    self.set_status(guid, AssetStatus::Unloaded);
                    debug!("unloaded {}", guid);
                    result.push(OpResult::ok(guid));
                }
                Err(err) => {
                    warn!("unload of {} failed: {}", guid, err);
                    result.push(OpResult::failed(guid, err));
                }
            }
        }

        result
    }

    fn reload_and_rebind_impl(&self, guids: VecDeque<Guid>, batch: BatchId) -> TaskResult {
        let _ = batch;
        let mut result = TaskResult::new(TaskKind::Reload);
        let ordered = self.expand_request(guids);
        let snapshot = self.index.snapshot();

        // Validate up front: a reload of unknown or unloaded guids fails as
        // a whole and leaves prior state untouched.
        for &guid in &ordered {
            if self.storage.meta_handle_for_guid(guid).is_none()
                || snapshot.entry_for_guid(guid).is_none()
            {
                return TaskResult::failed(TaskKind::Reload, guid, AssetError::NotFound(guid));
            }
        }

        for &guid in &ordered {
            let type_name = snapshot
                .entry_for_guid(guid)
                .expect("validated above")
                .meta
                .type_name
                .clone();

            let reloaded = self
                .types
                .entry_by_name(&type_name)
                .and_then(|entry| {
                    entry.unbind(&self.storage, guid)?;
                    entry.unload(&self.storage, guid)?;
                    Ok(entry)
                })
                .and_then(|entry| {
                    self.types.load(&type_name, &self.storage, &self.index, guid)?;
                    entry.bind(&self.storage, guid)
                });
            match reloaded {
                Ok(()) => result.push(OpResult::ok(guid)),
                Err(err) => {
                    warn!("reload of {} failed: {}", guid, err);
                    result.push(OpResult::failed(guid, err));
                    break;
                }
            }
        }

        // Rebind everything that referenced the reloaded guids.
        for entry in snapshot.entries() {
            let guid = entry.meta.guid;
            if ordered.contains(&guid) {
                continue;
            }
            if let Some(meta) = self.storage.meta_handle_for_guid(guid) {
                if let Ok(type_entry) = self.types.entry_by_type_id(meta.type_id()) {
                    if let Err(err) = type_entry.bind(&self.storage, guid) {
                        result.push(OpResult::failed(guid, err));
                    }
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_asset::{test_registry, write_model_tree, Mesh, Model, Texture};
    use crate::AssetTypeRegistryOptions;
    use crate::AssetValue;

    fn manager_with(types: Arc<AssetTypeRegistry>) -> Arc<ResourceManager> {
        ResourceManager::new(Arc::new(ThreadPool::with_workers(4)), types)
    }

    #[test]
    fn scan_only() {
        let dir = tempfile::tempdir().unwrap();
        write_model_tree(dir.path(), 1, 1); // Mesh + Texture + Model

        let rm = manager_with(test_registry());
        let result = rm
            .scan_assets_async(dir.path().to_path_buf())
            .wait()
            .unwrap();
        assert!(result.success);

        let index = rm.index_data();
        assert_eq!(index.len(), 3);
        assert_eq!(index.entries_of_type(Mesh::TYPE_NAME).count(), 1);
        assert_eq!(index.entries_of_type(Texture::TYPE_NAME).count(), 1);
        assert_eq!(index.entries_of_type(Model::TYPE_NAME).count(), 1);
        assert!(index.entries().iter().all(|e| e.meta.guid.is_valid()));
    }

    #[test]
    fn load_single_asset_binds_children() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_model_tree(dir.path(), 2, 0);
        let batch = Guid::generate();

        let rm = manager_with(test_registry());
        rm.scan_assets_async(dir.path().to_path_buf()).wait().unwrap();

        let result = rm
            .load_and_bind_async(VecDeque::from([fixture.model]), batch)
            .wait()
            .unwrap();
        assert!(result.success, "{:?}", result);

        let storage = rm.storage();
        let handle = storage.handle_for_guid::<Model>(fixture.model).unwrap();
        storage
            .read(handle, |model| {
                assert_eq!(model.meshes.len(), 2);
                assert!(model.meshes.iter().all(|m| storage.validate(m.handle)));
            })
            .unwrap();

        for mesh in &fixture.meshes {
            assert_eq!(rm.total_leases(*mesh), 1);
            assert_eq!(rm.get_status(*mesh), AssetStatus::Loaded);
        }
    }

    #[test]
    fn double_load_has_single_effect() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_model_tree(dir.path(), 0, 0);
        let batch = Guid::generate();

        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let types = AssetTypeRegistryOptions::new()
            .add_type::<Mesh>("Mesh")
            .add_type::<Texture>("Texture")
            .add_type::<Model>("Model")
            .with_load_observer(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let rm = manager_with(types);
        rm.scan_assets_async(dir.path().to_path_buf()).wait().unwrap();

        let first = rm.load_and_bind_async(VecDeque::from([fixture.model]), batch);
        let second = rm.load_and_bind_async(VecDeque::from([fixture.model]), batch);
        assert!(first.wait().unwrap().success);
        assert!(second.wait().unwrap().success);

        assert_eq!(rm.storage().loaded_count(), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(rm.total_leases(fixture.model), 1); // acquire is idempotent
    }

    #[test]
    fn lease_gated_unload() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_model_tree(dir.path(), 0, 0);
        let (b1, b2) = (Guid::generate(), Guid::generate());

        let rm = manager_with(test_registry());
        rm.scan_assets_async(dir.path().to_path_buf()).wait().unwrap();

        rm.load_and_bind_async(VecDeque::from([fixture.model]), b1)
            .wait()
            .unwrap();
        rm.load_and_bind_async(VecDeque::from([fixture.model]), b2)
            .wait()
            .unwrap();
        assert_eq!(rm.total_leases(fixture.model), 2);
        assert!(rm.held_by_batch(fixture.model, b1));

        let handle = rm
            .storage()
            .handle_for_guid::<Model>(fixture.model)
            .unwrap();

        rm.unbind_and_unload_async(VecDeque::from([fixture.model]), b1)
            .wait()
            .unwrap();
        assert_eq!(rm.total_leases(fixture.model), 1);
        assert!(rm.storage().meta_handle_for_guid(fixture.model).is_some());

        rm.unbind_and_unload_async(VecDeque::from([fixture.model]), b2)
            .wait()
            .unwrap();
        assert_eq!(rm.total_leases(fixture.model), 0);
        assert!(rm.storage().meta_handle_for_guid(fixture.model).is_none());
        assert!(!rm.storage().validate(handle)); // previously held handles went stale
    }

    #[test]
    fn load_of_unknown_guid_fails_but_task_completes() {
        let dir = tempfile::tempdir().unwrap();
        let rm = manager_with(test_registry());
        rm.scan_assets_async(dir.path().to_path_buf()).wait().unwrap();

        let stranger = Guid::generate();
        let result = rm
            .load_and_bind_async(VecDeque::from([stranger]), Guid::generate())
            .wait()
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failures().count(), 1);
        assert_eq!(rm.get_status(stranger), AssetStatus::Failed);
    }

    #[test]
    fn reload_replaces_value_and_rebinds() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_model_tree(dir.path(), 1, 0);
        let batch = Guid::generate();

        let rm = manager_with(test_registry());
        rm.scan_assets_async(dir.path().to_path_buf()).wait().unwrap();
        rm.load_and_bind_async(VecDeque::from([fixture.model]), batch)
            .wait()
            .unwrap();

        // Change the mesh payload on disk, then reload it.
        let mesh = Mesh {
            vertices: vec![9.0],
        };
        std::fs::write(
            dir.path().join("mesh_0.json"),
            serde_json::to_string_pretty(&mesh).unwrap(),
        )
        .unwrap();

        let result = rm
            .reload_and_rebind_async(VecDeque::from([fixture.meshes[0]]), batch)
            .wait()
            .unwrap();
        assert!(result.success, "{:?}", result);

        let storage = rm.storage();
        let mesh_handle = storage.handle_for_guid::<Mesh>(fixture.meshes[0]).unwrap();
        assert_eq!(
            storage.read(mesh_handle, |m| m.vertices.clone()).unwrap(),
            vec![9.0]
        );

        // The model's reference was rebound to the new slot version.
        let model_handle = storage.handle_for_guid::<Model>(fixture.model).unwrap();
        storage
            .read(model_handle, |model| {
                assert_eq!(model.meshes[0].handle, mesh_handle);
            })
            .unwrap();
    }

    #[test]
    fn reload_of_unloaded_guid_fails_whole_task() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_model_tree(dir.path(), 0, 0);

        let rm = manager_with(test_registry());
        rm.scan_assets_async(dir.path().to_path_buf()).wait().unwrap();

        let result = rm
            .reload_and_rebind_async(VecDeque::from([fixture.model]), Guid::generate())
            .wait()
            .unwrap();
        assert!(!result.success);
        assert!(rm.storage().meta_handle_for_guid(fixture.model).is_none());
    }

    #[test]
    fn completion_events_are_published() {
        let dir = tempfile::tempdir().unwrap();
        write_model_tree(dir.path(), 0, 0);

        let rm = manager_with(test_registry());
        let events = rm.subscribe_events();

        rm.scan_assets_async(dir.path().to_path_buf()).wait().unwrap();
        rm.wait_until_idle();

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, TaskKind::Scan);
        assert!(received[0].success);
    }
}
