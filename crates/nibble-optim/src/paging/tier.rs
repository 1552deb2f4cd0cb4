//! Slow-tier storage for evicted pages

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

use super::PageId;

/// Failures reported by a slow tier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    /// The transfer may succeed if retried
    #[error("transient transfer failure: {message}")]
    Transient {
        /// What went wrong
        message: String,
    },

    /// The tier cannot hold the bytes
    #[error("slow tier full: {requested} bytes requested, {available} available")]
    CapacityExceeded {
        /// Bytes in the rejected store
        requested: usize,
        /// Bytes still free
        available: usize,
    },

    /// The tier holds nothing under this id
    #[error("page {page} is not held by the slow tier")]
    Missing {
        /// The id that was looked up
        page: PageId,
    },
}

impl TierError {
    /// Whether the paging manager should retry the transfer
    pub fn is_transient(&self) -> bool {
        matches!(self, TierError::Transient { .. })
    }
}

/// Byte storage backing evicted pages.
///
/// `take` removes the bytes it returns; after a successful `take` the tier no
/// longer holds the page.
pub trait SlowTier: Send + Sync {
    /// Stores bytes under `page`, replacing any previous bytes
    fn store(&self, page: PageId, bytes: &[u8]) -> Result<(), TierError>;

    /// Removes and returns the bytes for `page`
    fn take(&self, page: PageId) -> Result<Vec<u8>, TierError>;

    /// Drops the bytes for `page`, returning whether any were held
    fn remove(&self, page: PageId) -> bool;

    /// Whether bytes are held for `page`
    fn contains(&self, page: PageId) -> bool;

    /// Bytes currently held
    fn used_bytes(&self) -> usize;

    /// Total capacity in bytes
    fn capacity_bytes(&self) -> usize;

    /// Drops everything
    fn clear(&self);
}

#[derive(Debug, Default)]
struct HostPages {
    pages: HashMap<PageId, Vec<u8>>,
    used: usize,
}

/// Capacity-limited slow tier in host memory
#[derive(Debug)]
pub struct HostTier {
    capacity: usize,
    inner: Mutex<HostPages>,
}

impl HostTier {
    /// Creates an empty tier holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HostPages::default()),
        }
    }

    /// Number of pages held
    pub fn len(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Whether no pages are held
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pages.is_empty()
    }
}

impl SlowTier for HostTier {
    fn store(&self, page: PageId, bytes: &[u8]) -> Result<(), TierError> {
        let mut inner = self.inner.lock();
        let replaced = inner.pages.get(&page).map_or(0, Vec::len);
        let used = inner.used - replaced;
        if used + bytes.len() > self.capacity {
            return Err(TierError::CapacityExceeded {
                requested: bytes.len(),
                available: self.capacity.saturating_sub(used),
            });
        }
        inner.pages.insert(page, bytes.to_vec());
        inner.used = used + bytes.len();
        Ok(())
    }

    fn take(&self, page: PageId) -> Result<Vec<u8>, TierError> {
        let mut inner = self.inner.lock();
        let bytes = inner.pages.remove(&page).ok_or(TierError::Missing { page })?;
        inner.used -= bytes.len();
        Ok(bytes)
    }

    fn remove(&self, page: PageId) -> bool {
        let mut inner = self.inner.lock();
        match inner.pages.remove(&page) {
            Some(bytes) => {
                inner.used -= bytes.len();
                true
            }
            None => false,
        }
    }

    fn contains(&self, page: PageId) -> bool {
        self.inner.lock().pages.contains_key(&page)
    }

    fn used_bytes(&self) -> usize {
        self.inner.lock().used
    }

    fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.pages.clear();
        inner.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_take() {
        let tier = HostTier::new(16);
        let page = PageId::new();
        tier.store(page, &[1, 2, 3]).unwrap();
        assert!(tier.contains(page));
        assert_eq!(tier.used_bytes(), 3);

        assert_eq!(tier.take(page).unwrap(), vec![1, 2, 3]);
        assert!(!tier.contains(page));
        assert_eq!(tier.used_bytes(), 0);
        assert_eq!(tier.take(page).unwrap_err(), TierError::Missing { page });
    }

    #[test]
    fn test_capacity_enforced() {
        let tier = HostTier::new(8);
        let a = PageId::new();
        tier.store(a, &[0; 6]).unwrap();
        let err = tier.store(PageId::new(), &[0; 4]).unwrap_err();
        assert_eq!(err, TierError::CapacityExceeded { requested: 4, available: 2 });
        assert!(!err.is_transient());

        // Replacing a page only counts the difference
        tier.store(a, &[0; 8]).unwrap();
        assert_eq!(tier.used_bytes(), 8);
    }

    #[test]
    fn test_remove_and_clear() {
        let tier = HostTier::new(64);
        let a = PageId::new();
        tier.store(a, &[1; 10]).unwrap();
        tier.store(PageId::new(), &[2; 10]).unwrap();
        assert!(tier.remove(a));
        assert!(!tier.remove(a));
        assert_eq!(tier.len(), 1);
        tier.clear();
        assert!(tier.is_empty());
        assert_eq!(tier.used_bytes(), 0);
    }
}
