use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{AssetError, AssetValue, Guid, Handle, Storage};

/// Observable state of an [`AssetRef`] or entity reference.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefState {
    /// No guid, no handle.
    Empty,
    /// Known guid, target not wired.
    Unbound,
    /// Guid and live handle.
    Bound,
    /// Guid with a handle whose slot version moved on; behaves as unbound
    /// until rebound.
    Stale,
}

/// Reference from one asset (or component) to another asset.
///
/// Only the guid persists; the handle is wired by the bind pass after load
/// and cleared again on unbind. Deserialized references always start unbound.
pub struct AssetRef<T: AssetValue> {
    pub guid: Guid,
    pub handle: Handle<T>,
}

impl<T: AssetValue> AssetRef<T> {
    pub fn new(guid: Guid) -> Self {
        Self {
            guid,
            handle: Handle::NONE,
        }
    }

    pub fn empty() -> Self {
        Self::new(Guid::INVALID)
    }

    pub fn state(&self, storage: &Storage) -> RefState {
        if !self.guid.is_valid() {
            RefState::Empty
        } else if !self.handle.is_some() {
            RefState::Unbound
        } else if storage.validate(self.handle) {
            RefState::Bound
        } else {
            RefState::Stale
        }
    }

    pub fn is_bound(&self, storage: &Storage) -> bool {
        self.state(storage) == RefState::Bound
    }

    /// Wires the handle by guid lookup. Idempotent for already-bound refs.
    ///
    /// # Errors
    /// [`AssetError::TypeMismatch`] if the target is loaded under a type
    /// other than `T`; [`AssetError::BindFailed`] if it is not loaded at
    /// all (a missing target at bind time is a scan or closure bug).
    pub fn rebind(&mut self, storage: &Storage) -> Result<(), AssetError> {
        if storage.validate(self.handle) {
            return Ok(());
        }
        match storage.typed_handle_for_guid::<T>(self.guid) {
            Ok(handle) => {
                self.handle = handle;
                Ok(())
            }
            Err(err @ AssetError::TypeMismatch { .. }) => Err(err),
            Err(_) => Err(AssetError::BindFailed {
                guid: self.guid,
                message: format!("referenced {} not loaded", T::TYPE_NAME),
            }),
        }
    }

    pub fn unbind(&mut self) {
        self.handle.reset();
    }
}

impl<T: AssetValue> Clone for AssetRef<T> {
    fn clone(&self) -> Self {
        Self {
            guid: self.guid,
            handle: self.handle,
        }
    }
}

impl<T: AssetValue> Default for AssetRef<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: AssetValue> PartialEq for AssetRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}

impl<T: AssetValue> std::fmt::Debug for AssetRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetRef<{}>({})", T::TYPE_NAME, self.guid)
    }
}

impl<T: AssetValue> Serialize for AssetRef<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.guid.serialize(serializer)
    }
}

impl<'de, T: AssetValue> Deserialize<'de> for AssetRef<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // References always deserialize unbound; binding happens after load.
        Ok(Self::new(Guid::deserialize(deserializer)?))
    }
}

/// Object-safe view over any typed [`AssetRef`], used by the generic ref
/// visitors of assets and components.
pub trait ErasedAssetRef {
    fn guid(&self) -> Guid;
    fn is_bound(&self, storage: &Storage) -> bool;
    /// Wires the handle by guid lookup; see [`AssetRef::rebind`].
    fn rebind(&mut self, storage: &Storage) -> Result<(), AssetError>;
    fn clear(&mut self);
    fn target_type_name(&self) -> &'static str;
}

impl<T: AssetValue> ErasedAssetRef for AssetRef<T> {
    fn guid(&self) -> Guid {
        self.guid
    }

    fn is_bound(&self, storage: &Storage) -> bool {
        AssetRef::is_bound(self, storage)
    }

    fn rebind(&mut self, storage: &Storage) -> Result<(), AssetError> {
        AssetRef::rebind(self, storage)
    }

    fn clear(&mut self) {
        self.unbind();
    }

    fn target_type_name(&self) -> &'static str {
        T::TYPE_NAME
    }
}
