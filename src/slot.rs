use std::sync::{Arc, PoisonError, RwLock};

/// A collaborator that may be registered after construction.
///
/// Cloning shares the slot, so a background loop holding a clone sees a
/// registration made later through the owner.
pub struct Slot<T: ?Sized> {
    inner: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T: ?Sized> Slot<T> {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Register `value`, replacing whatever was there.
    pub fn set(&self, value: Arc<T>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    /// Current value, if any.
    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

impl<T: ?Sized> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Self::empty()
    }
}
