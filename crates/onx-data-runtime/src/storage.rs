use std::any::Any;
use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::{AssetError, AssetTypeId, Guid, Handle, MetaHandle};

#[derive(Clone, Copy)]
struct RawHandle {
    offset: u32,
    version: u32,
}

impl RawHandle {
    fn of_meta(meta: MetaHandle) -> Self {
        Self {
            offset: meta.offset,
            version: meta.version,
        }
    }

    fn of<T>(handle: Handle<T>) -> Self {
        Self {
            offset: handle.offset,
            version: handle.version,
        }
    }
}

struct Slot<T> {
    /// `None` while the slot is free, or while the value is temporarily taken
    /// out by `modify` (distinguished by `occupied`).
    value: Option<T>,
    version: u32,
    guid: Guid,
    ref_count: u32,
    occupied: bool,
}

struct PoolInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

/// Per-type slot pool. Slot versions start at 1 and bump on every removal so
/// outstanding handles can never resolve a reused slot.
struct Pool<T> {
    inner: RwLock<PoolInner<T>>,
}

enum SlotCheck {
    Live,
    Stale,
    Invalid,
}

impl<T: Send + Sync + 'static> Pool<T> {
    fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    fn check(inner: &PoolInner<T>, raw: RawHandle) -> SlotCheck {
        if raw.version == 0 {
            return SlotCheck::Invalid;
        }
        match inner.slots.get(raw.offset as usize) {
            Some(slot) if slot.occupied && slot.version == raw.version => SlotCheck::Live,
            Some(_) => SlotCheck::Stale,
            None => SlotCheck::Invalid,
        }
    }

    fn add_value(&self, value: T, guid: Guid) -> RawHandle {
        let mut inner = self.inner.write();
        if let Some(offset) = inner.free.pop() {
            let slot = &mut inner.slots[offset as usize];
            slot.value = Some(value);
            slot.guid = guid;
            slot.ref_count = 1;
            slot.occupied = true;
            RawHandle {
                offset,
                version: slot.version,
            }
        } else {
            let offset = inner.slots.len() as u32;
            inner.slots.push(Slot {
                value: Some(value),
                version: 1,
                guid,
                ref_count: 1,
                occupied: true,
            });
            RawHandle { offset, version: 1 }
        }
    }

    fn read<R>(&self, raw: RawHandle, f: impl FnOnce(&T) -> R) -> Result<R, AssetError> {
        // Recursive read so ref visitors may descend into siblings of the
        // same pool without self-deadlocking against a queued writer.
        let inner = self.inner.read_recursive();
        match Self::check(&inner, raw) {
            SlotCheck::Live => {
                let slot = &inner.slots[raw.offset as usize];
                match &slot.value {
                    Some(value) => Ok(f(value)),
                    None => Err(AssetError::CyclicReference(slot.guid)),
                }
            }
            SlotCheck::Stale => Err(AssetError::Stale),
            SlotCheck::Invalid => Err(AssetError::Invalid),
        }
    }

    /// Moves the value out for exclusive mutation; the slot stays occupied.
    fn take_out(&self, raw: RawHandle) -> Result<T, AssetError> {
        let mut inner = self.inner.write();
        match Self::check(&inner, raw) {
            SlotCheck::Live => {
                let slot = &mut inner.slots[raw.offset as usize];
                slot.value.take().ok_or(AssetError::CyclicReference(slot.guid))
            }
            SlotCheck::Stale => Err(AssetError::Stale),
            SlotCheck::Invalid => Err(AssetError::Invalid),
        }
    }

    /// Puts a taken-out value back. If the slot was removed (or reused) in
    /// the meantime the value is simply dropped.
    fn restore(&self, raw: RawHandle, value: T) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.slots.get_mut(raw.offset as usize) {
            if slot.occupied && slot.version == raw.version && slot.value.is_none() {
                slot.value = Some(value);
            }
        }
    }

    fn validate(&self, raw: RawHandle) -> bool {
        // Recursive for the same reason as `read`: validation happens inside
        // ref visitors that already hold this pool's read lock.
        matches!(Self::check(&self.inner.read_recursive(), raw), SlotCheck::Live)
    }

    fn retain(&self, raw: RawHandle) -> Result<u32, AssetError> {
        let mut inner = self.inner.write();
        match Self::check(&inner, raw) {
            SlotCheck::Live => {
                let slot = &mut inner.slots[raw.offset as usize];
                slot.ref_count += 1;
                Ok(slot.ref_count)
            }
            SlotCheck::Stale => Err(AssetError::Stale),
            SlotCheck::Invalid => Err(AssetError::Invalid),
        }
    }

    /// Decrements the ref-count; at zero the slot is freed, its version
    /// bumped and the owning guid returned for index cleanup.
    fn release(&self, raw: RawHandle) -> Result<(u32, Option<Guid>), AssetError> {
        let mut inner = self.inner.write();
        match Self::check(&inner, raw) {
            SlotCheck::Live => {
                let count = {
                    let slot = &mut inner.slots[raw.offset as usize];
                    slot.ref_count -= 1;
                    slot.ref_count
                };
                if count == 0 {
                    let guid = Self::free_slot(&mut inner, raw.offset);
                    Ok((0, Some(guid)))
                } else {
                    Ok((count, None))
                }
            }
            SlotCheck::Stale => Err(AssetError::Stale),
            SlotCheck::Invalid => Err(AssetError::Invalid),
        }
    }

    /// Frees the slot regardless of its ref-count.
    fn remove_now(&self, raw: RawHandle) -> Result<Guid, AssetError> {
        let mut inner = self.inner.write();
        match Self::check(&inner, raw) {
            SlotCheck::Live => Ok(Self::free_slot(&mut inner, raw.offset)),
            SlotCheck::Stale => Err(AssetError::Stale),
            SlotCheck::Invalid => Err(AssetError::Invalid),
        }
    }

    fn free_slot(inner: &mut PoolInner<T>, offset: u32) -> Guid {
        let slot = &mut inner.slots[offset as usize];
        let guid = slot.guid;
        // Drop the value (it may be taken out, in which case the restore
        // path drops it instead) and invalidate every outstanding handle.
        slot.value = None;
        slot.version = slot.version.wrapping_add(1).max(1);
        slot.guid = Guid::INVALID;
        slot.ref_count = 0;
        slot.occupied = false;
        inner.free.push(offset);
        guid
    }
}

trait ErasedPool: Send + Sync {
    fn validate(&self, raw: RawHandle) -> bool;
    fn retain(&self, raw: RawHandle) -> Result<u32, AssetError>;
    fn release(&self, raw: RawHandle) -> Result<(u32, Option<Guid>), AssetError>;
    fn remove_now(&self, raw: RawHandle) -> Result<Guid, AssetError>;
    fn live_count(&self) -> usize;
    fn value_type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + Sync + 'static> ErasedPool for Pool<T> {
    fn validate(&self, raw: RawHandle) -> bool {
        Pool::validate(self, raw)
    }

    fn retain(&self, raw: RawHandle) -> Result<u32, AssetError> {
        Pool::retain(self, raw)
    }

    fn release(&self, raw: RawHandle) -> Result<(u32, Option<Guid>), AssetError> {
        Pool::release(self, raw)
    }

    fn remove_now(&self, raw: RawHandle) -> Result<Guid, AssetError> {
        Pool::remove_now(self, raw)
    }

    fn live_count(&self) -> usize {
        self.inner
            .read_recursive()
            .slots
            .iter()
            .filter(|s| s.occupied)
            .count()
    }

    fn value_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct GuidIndex {
    by_guid: HashMap<Guid, MetaHandle>,
    by_handle: HashMap<MetaHandle, Guid>,
}

/// Thread-safe, type-erased, reference-counted home of all loaded assets.
///
/// One slot pool per asset type, plus a guid index mapping each loaded asset
/// to its erased handle. Lock order is guid index before pool; `read` and
/// `modify` touch only the pool. `modify` moves the value out of its slot for
/// the duration of the callback, so callbacks are free to re-enter storage,
/// including the same pool; only the slot being modified reports a cyclic
/// reference.
pub struct Storage {
    pools: RwLock<HashMap<AssetTypeId, std::sync::Arc<dyn ErasedPool>>>,
    index: Mutex<GuidIndex>,
}

impl Storage {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            index: Mutex::new(GuidIndex::default()),
        }
    }

    /// Idempotently creates the pool for `T`.
    pub fn assure<T: Send + Sync + 'static>(&self) {
        self.pools
            .write()
            .entry(AssetTypeId::of::<T>())
            .or_insert_with(|| std::sync::Arc::new(Pool::<T>::new()));
    }

    fn erased_pool(&self, type_id: AssetTypeId) -> Option<std::sync::Arc<dyn ErasedPool>> {
        self.pools.read().get(&type_id).cloned()
    }

    fn typed_pool<T: Send + Sync + 'static>(
        &self,
    ) -> Option<std::sync::Arc<dyn ErasedPool>> {
        self.erased_pool(AssetTypeId::of::<T>())
    }

    /// Inserts `value` under `guid` with an initial ref-count of 1.
    ///
    /// # Errors
    /// [`AssetError::AlreadyPresent`] if the guid is already mapped.
    pub fn add<T: Send + Sync + 'static>(
        &self,
        value: T,
        guid: Guid,
    ) -> Result<Handle<T>, AssetError> {
        self.assure::<T>();
        let pool = self.typed_pool::<T>().expect("pool was just assured");

        let mut index = self.index.lock();
        if index.by_guid.contains_key(&guid) {
            return Err(AssetError::AlreadyPresent(guid));
        }

        let pool = pool
            .as_any()
            .downcast_ref::<Pool<T>>()
            .expect("pool type keyed by type id");
        let raw = pool.add_value(value, guid);
        let meta = MetaHandle::new(raw.offset, raw.version, AssetTypeId::of::<T>());
        index.by_guid.insert(guid, meta);
        index.by_handle.insert(meta, guid);
        Ok(Handle::new(raw.offset, raw.version))
    }

    /// O(1) typed lookup; `None` when the guid is unknown or maps to another
    /// type.
    pub fn handle_for_guid<T: 'static>(&self, guid: Guid) -> Option<Handle<T>> {
        self.index
            .lock()
            .by_guid
            .get(&guid)
            .and_then(|meta| meta.downcast::<T>())
    }

    /// Like [`Self::handle_for_guid`], but tells an unknown guid
    /// ([`AssetError::NotFound`]) apart from a guid stored under a different
    /// type ([`AssetError::TypeMismatch`]).
    pub fn typed_handle_for_guid<T: Send + Sync + 'static>(
        &self,
        guid: Guid,
    ) -> Result<Handle<T>, AssetError> {
        let meta = self
            .meta_handle_for_guid(guid)
            .ok_or(AssetError::NotFound(guid))?;
        match meta.downcast::<T>() {
            Some(handle) => Ok(handle),
            None => Err(AssetError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found: self
                    .erased_pool(meta.type_id)
                    .map_or("<unknown>", |pool| pool.value_type_name()),
            }),
        }
    }

    pub fn meta_handle_for_guid(&self, guid: Guid) -> Option<MetaHandle> {
        self.index.lock().by_guid.get(&guid).copied()
    }

    pub fn guid_for_handle(&self, meta: MetaHandle) -> Option<Guid> {
        self.index.lock().by_handle.get(&meta).copied()
    }

    pub fn validate<T: Send + Sync + 'static>(&self, handle: Handle<T>) -> bool {
        handle.is_some()
            && self
                .typed_pool::<T>()
                .map_or(false, |pool| pool.validate(RawHandle::of(handle)))
    }

    pub fn validate_meta(&self, meta: MetaHandle) -> bool {
        meta.is_some()
            && self
                .erased_pool(meta.type_id)
                .map_or(false, |pool| pool.validate(RawHandle::of_meta(meta)))
    }

    /// Shared access to the value behind `handle`.
    pub fn read<T: Send + Sync + 'static, R>(
        &self,
        handle: Handle<T>,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R, AssetError> {
        let pool = self.typed_pool::<T>().ok_or(AssetError::Invalid)?;
        let pool = pool
            .as_any()
            .downcast_ref::<Pool<T>>()
            .expect("pool type keyed by type id");
        pool.read(RawHandle::of(handle), f)
    }

    /// Exclusive access to the value behind `handle`.
    ///
    /// The value is moved out of its slot for the duration of `f`, so `f` may
    /// re-enter storage freely; re-entering the *same* slot reports
    /// [`AssetError::CyclicReference`]. The value is restored on every exit
    /// path, including panics inside `f`.
    pub fn modify<T: Send + Sync + 'static, R>(
        &self,
        handle: Handle<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, AssetError> {
        let pool = self.typed_pool::<T>().ok_or(AssetError::Invalid)?;
        let pool = pool
            .as_any()
            .downcast_ref::<Pool<T>>()
            .expect("pool type keyed by type id");

        let raw = RawHandle::of(handle);
        let value = pool.take_out(raw)?;

        struct Restore<'a, T: Send + Sync + 'static> {
            pool: &'a Pool<T>,
            raw: RawHandle,
            value: Option<T>,
        }
        impl<'a, T: Send + Sync + 'static> Drop for Restore<'a, T> {
            fn drop(&mut self) {
                if let Some(value) = self.value.take() {
                    self.pool.restore(self.raw, value);
                }
            }
        }

        let mut guard = Restore {
            pool,
            raw,
            value: Some(value),
        };
        let result = f(guard.value.as_mut().expect("value present until drop"));
        drop(guard);
        Ok(result)
    }

    /// Increments the ref-count; returns the new count.
    pub fn retain(&self, meta: MetaHandle) -> Result<u32, AssetError> {
        self.erased_pool(meta.type_id)
            .ok_or(AssetError::Invalid)?
            .retain(RawHandle::of_meta(meta))
    }

    /// Decrements the ref-count; at zero the asset is removed, its slot
    /// version bumped (outstanding handles become stale) and the guid
    /// mapping erased. Returns the new count.
    pub fn release(&self, meta: MetaHandle) -> Result<u32, AssetError> {
        let pool = self.erased_pool(meta.type_id).ok_or(AssetError::Invalid)?;
        let mut index = self.index.lock();
        let (count, removed) = pool.release(RawHandle::of_meta(meta))?;
        if let Some(guid) = removed {
            index.by_guid.remove(&guid);
            index.by_handle.remove(&meta);
        }
        Ok(count)
    }

    /// Force-removes the asset regardless of its ref-count. Used by unload
    /// paths that run under the resource manager's single-writer guarantee.
    pub fn remove_now(&self, meta: MetaHandle) -> Result<(), AssetError> {
        let pool = self.erased_pool(meta.type_id).ok_or(AssetError::Invalid)?;
        let mut index = self.index.lock();
        let guid = pool.remove_now(RawHandle::of_meta(meta))?;
        index.by_guid.remove(&guid);
        index.by_handle.remove(&meta);
        Ok(())
    }

    /// [`Self::remove_now`] addressed by guid.
    pub fn remove_now_guid(&self, guid: Guid) -> Result<(), AssetError> {
        let meta = self
            .meta_handle_for_guid(guid)
            .ok_or(AssetError::NotFound(guid))?;
        self.remove_now(meta)
    }

    /// Number of live assets across all pools.
    pub fn loaded_count(&self) -> usize {
        self.pools.read().values().map(|p| p.live_count()).sum()
    }

    /// Human-readable per-pool summary for logs and inspection.
    pub fn summary(&self) -> String {
        let pools = self.pools.read();
        let mut lines: Vec<String> = pools
            .values()
            .map(|p| format!("{}: {} live", p.value_type_name(), p.live_count()))
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}
