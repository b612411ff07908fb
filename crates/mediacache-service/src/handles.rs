//! Revocable local handles to fetched media bytes.
//!
//! Renderers never see the bytes owned by the cache directly. They get an opaque handle, much
//! like an object URL, that stays valid until the cache revokes it. A revoked handle dangles:
//! reading through it yields nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

/// Creates and revokes the handles the cache hands out to consumers.
///
/// Implemented by the host environment. The cache calls [`revoke`](Self::revoke) exactly once for
/// every handle it created, when the corresponding entry is removed.
pub trait HandleProvider: Send + Sync + 'static {
    /// The opaque handle type given to consumers.
    type Handle: Clone + fmt::Debug + Send + Sync + 'static;

    /// Registers `bytes` and returns a handle referring to them.
    fn create(&self, bytes: Bytes) -> Self::Handle;

    /// Releases the bytes behind `handle`.
    fn revoke(&self, handle: &Self::Handle);
}

/// A handle created by a [`BlobRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobHandle(u64);

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob:mediacache/{}", self.0)
    }
}

/// An in-process registry of blobs, addressed by [`BlobHandle`].
#[derive(Clone, Debug, Default)]
pub struct BlobRegistry {
    inner: Arc<BlobRegistryInner>,
}

#[derive(Debug, Default)]
struct BlobRegistryInner {
    next_id: AtomicU64,
    blobs: Mutex<HashMap<u64, Bytes>>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bytes behind `handle`, or `None` if it was revoked.
    pub fn read(&self, handle: &BlobHandle) -> Option<Bytes> {
        self.inner.blobs.lock().get(&handle.0).cloned()
    }

    /// The number of handles that have not been revoked yet.
    pub fn live_count(&self) -> usize {
        self.inner.blobs.lock().len()
    }
}

impl HandleProvider for BlobRegistry {
    type Handle = BlobHandle;

    fn create(&self, bytes: Bytes) -> BlobHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.blobs.lock().insert(id, bytes);
        BlobHandle(id)
    }

    fn revoke(&self, handle: &BlobHandle) {
        if self.inner.blobs.lock().remove(&handle.0).is_none() {
            tracing::warn!(%handle, "Revoking unknown handle");
        }
    }
}
