use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{AssetEntry, AssetError, AssetMetaData, AssetValue, Guid};

const META_SUFFIX: &str = ".meta.json";

/// Immutable snapshot of the on-disk asset catalogue.
///
/// Entries are ordered by their lexicographic scan order; the derived maps
/// index into `entries`. Snapshots are published whole, readers never observe
/// partial state.
pub struct AssetIndexData {
    entries: Vec<AssetEntry>,
    by_guid: HashMap<Guid, usize>,
    by_type: HashMap<String, Vec<usize>>,
    by_parent: HashMap<Guid, Vec<usize>>,
}

impl AssetIndexData {
    fn from_entries(entries: Vec<AssetEntry>) -> Self {
        let mut by_guid = HashMap::new();
        let mut by_type: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_parent: HashMap<Guid, Vec<usize>> = HashMap::new();

        for (i, entry) in entries.iter().enumerate() {
            by_guid.insert(entry.meta.guid, i);
            by_type
                .entry(entry.meta.type_name.clone())
                .or_default()
                .push(i);
            by_parent.entry(entry.meta.guid_parent).or_default().push(i);
        }

        Self {
            entries,
            by_guid,
            by_type,
            by_parent,
        }
    }

    pub fn entries(&self) -> &[AssetEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_for_guid(&self, guid: Guid) -> Option<&AssetEntry> {
        self.by_guid.get(&guid).map(|&i| &self.entries[i])
    }

    pub fn entries_of_type<'a>(
        &'a self,
        type_name: &str,
    ) -> impl Iterator<Item = &'a AssetEntry> + 'a {
        self.by_type
            .get(type_name)
            .into_iter()
            .flatten()
            .map(move |&i| &self.entries[i])
    }

    pub fn children_of<'a>(&'a self, parent: Guid) -> impl Iterator<Item = &'a AssetEntry> + 'a {
        self.by_parent
            .get(&parent)
            .into_iter()
            .flatten()
            .map(move |&i| &self.entries[i])
    }
}

/// Outcome of a completed scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanStats {
    pub indexed: usize,
    pub skipped: usize,
}

/// Scan-and-catalogue of `*.meta.json` files under an asset root.
///
/// The current snapshot is replaced atomically after each scan; previously
/// obtained snapshots stay valid for concurrent readers.
pub struct AssetIndex {
    data: RwLock<Arc<AssetIndexData>>,
    scanning: AtomicBool,
}

impl AssetIndex {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Arc::new(AssetIndexData::from_entries(Vec::new()))),
            scanning: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<AssetIndexData> {
        Arc::clone(&self.data.read())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Walks `root`, parses every meta file and publishes a fresh snapshot.
    ///
    /// Per-file failures are logged and skipped; only an unreadable root
    /// fails the scan as a whole.
    ///
    /// # Errors
    /// [`AssetError::ScanBusy`] if another scan is in progress,
    /// [`AssetError::IOError`] if the root cannot be read.
    pub fn scan(&self, root: &Path) -> Result<ScanStats, AssetError> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AssetError::ScanBusy);
        }

        let result = self.scan_inner(root);
        self.scanning.store(false, Ordering::Release);
        result
    }

    fn scan_inner(&self, root: &Path) -> Result<ScanStats, AssetError> {
        if !root.is_dir() {
            return Err(AssetError::io(
                Guid::INVALID,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("asset root not readable: {}", root.display()),
                ),
            ));
        }

        let mut entries = Vec::new();
        let mut stats = ScanStats::default();

        // Deterministic lexicographic order; payloads without a meta sibling
        // are never visited at all.
        for item in walkdir::WalkDir::new(root).sort_by_file_name() {
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    warn!("scan: skipping unreadable entry: {}", err);
                    stats.skipped += 1;
                    continue;
                }
            };
            if !item.file_type().is_file() {
                continue;
            }
            let meta_path = item.path();
            let file_name = match meta_path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !file_name.ends_with(META_SUFFIX) {
                continue;
            }

            match Self::read_entry(root, meta_path, file_name) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!("scan: skipping {}: {}", meta_path.display(), err);
                    stats.skipped += 1;
                }
            }
        }

        stats.indexed = entries.len();
        info!(
            "scan: indexed {} asset(s) under {} ({} skipped)",
            stats.indexed,
            root.display(),
            stats.skipped
        );

        *self.data.write() = Arc::new(AssetIndexData::from_entries(entries));
        Ok(stats)
    }

    fn read_entry(root: &Path, meta_path: &Path, file_name: &str) -> Result<AssetEntry, AssetError> {
        let text = std::fs::read_to_string(meta_path)
            .map_err(|err| AssetError::io(Guid::INVALID, err))?;
        let meta: AssetMetaData =
            serde_json::from_str(&text).map_err(|err| AssetError::parse(Guid::INVALID, err))?;

        let stem = &file_name[..file_name.len() - META_SUFFIX.len()];
        let absolute_path = meta_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(format!("{}.json", stem));
        let relative_path = absolute_path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| absolute_path.clone());

        Ok(AssetEntry {
            meta,
            relative_path,
            absolute_path,
        })
    }

    /// Reads and parses the payload of a catalogued asset.
    pub fn read_payload_value(&self, guid: Guid) -> Result<serde_json::Value, AssetError> {
        let snapshot = self.snapshot();
        let entry = snapshot
            .entry_for_guid(guid)
            .ok_or(AssetError::NotFound(guid))?;
        let text = std::fs::read_to_string(&entry.absolute_path)
            .map_err(|err| AssetError::io(guid, err))?;
        serde_json::from_str(&text).map_err(|err| AssetError::parse(guid, err))
    }

    /// Typed variant of [`Self::read_payload_value`].
    pub fn read_payload<T: AssetValue>(&self, guid: Guid) -> Result<T, AssetError> {
        let value = self.read_payload_value(guid)?;
        serde_json::from_value(value).map_err(|err| AssetError::parse(guid, err))
    }

    /// Writes an asset to disk: payload first, then meta, so a scanner that
    /// sees the meta always sees the payload.
    pub fn write_asset_files<T: AssetValue>(
        value: &T,
        meta: &AssetMetaData,
        payload_path: &Path,
        meta_path: &Path,
    ) -> Result<(), AssetError> {
        let payload =
            serde_json::to_string_pretty(value).map_err(|err| AssetError::parse(meta.guid, err))?;
        let meta_text =
            serde_json::to_string_pretty(meta).map_err(|err| AssetError::parse(meta.guid, err))?;

        std::fs::write(payload_path, payload).map_err(|err| AssetError::io(meta.guid, err))?;
        std::fs::write(meta_path, meta_text).map_err(|err| AssetError::io(meta.guid, err))
    }

    /// Authors a new asset under `dir`, deriving `contained_assets` from the
    /// value's own references before writing.
    pub fn import<T: AssetValue>(
        value: &mut T,
        meta: &AssetMetaData,
        dir: &Path,
        stem: &str,
    ) -> Result<(), AssetError> {
        let mut meta = meta.clone();
        meta.contained_assets.clear();
        value.visit_asset_refs(&mut |reference| {
            meta.contained_assets.push(reference.guid());
        });

        let payload_path = dir.join(format!("{}.json", stem));
        let meta_path = dir.join(format!("{}{}", stem, META_SUFFIX));
        Self::write_asset_files(&*value, &meta, &payload_path, &meta_path)
    }
}

impl Default for AssetIndex {
    fn default() -> Self {
        Self::new()
    }
}
