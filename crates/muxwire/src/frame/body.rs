//! Frame body ownership.
//!
//! A [`Body`] is a move-only handle on an immutable, atomically
//! reference-counted byte slice. Bodies adopted by a [`BodyArena`] are counted
//! until released; release happens exactly once, either through
//! [`Body::release`] or on drop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;

/// Accounting for bodies handed out by the decoder.
#[derive(Debug, Default)]
pub struct BodyArena {
    live: AtomicUsize,
    adopted: AtomicU64,
    released: AtomicU64,
}

impl BodyArena {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take ownership of `bytes` as a tracked body.
    pub fn adopt(self: &Arc<Self>, bytes: Bytes) -> Body {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.adopted.fetch_add(1, Ordering::Relaxed);
        Body {
            bytes,
            lease: Some(Arc::clone(self)),
        }
    }

    /// Bodies adopted and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn adopted(&self) -> u64 {
        self.adopted.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    fn release_one(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owned frame payload.
pub struct Body {
    bytes: Bytes,
    lease: Option<Arc<BodyArena>>,
}

impl Body {
    /// Untracked body, used for locally built outbound frames.
    pub fn detached(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            lease: None,
        }
    }

    pub fn empty() -> Self {
        Self::detached(Bytes::new())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// A second, independently releasable handle on the same bytes.
    pub fn retain(&self) -> Body {
        match &self.lease {
            Some(arena) => arena.adopt(self.bytes.clone()),
            None => Body::detached(self.bytes.clone()),
        }
    }

    /// Release the body. Consuming `self` makes a second release impossible.
    pub fn release(self) {
        drop(self);
    }

    /// Release the body and keep only the bytes.
    pub fn into_bytes(mut self) -> Bytes {
        std::mem::take(&mut self.bytes)
    }

    pub fn is_tracked(&self) -> bool {
        self.lease.is_some()
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        if let Some(arena) = self.lease.take() {
            arena.release_one();
        }
    }
}

impl AsRef<[u8]> for Body {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("len", &self.bytes.len())
            .field("tracked", &self.lease.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_counted_once() {
        let arena = BodyArena::new();
        let body = arena.adopt(Bytes::from_static(b"payload"));
        assert_eq!(arena.live(), 1);

        body.release();
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.released(), 1);
    }

    #[test]
    fn drop_releases() {
        let arena = BodyArena::new();
        {
            let _body = arena.adopt(Bytes::from_static(b"x"));
        }
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.released(), 1);
    }

    #[test]
    fn retained_slices_release_independently() {
        let arena = BodyArena::new();
        let body = arena.adopt(Bytes::from_static(b"shared"));
        let copy = body.retain();
        assert_eq!(arena.live(), 2);
        assert_eq!(copy.as_bytes(), body.as_bytes());

        body.release();
        assert_eq!(arena.live(), 1);
        assert_eq!(copy.as_ref(), b"shared");
        copy.release();
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.released(), 2);
    }

    #[test]
    fn into_bytes_releases_the_lease() {
        let arena = BodyArena::new();
        let bytes = arena.adopt(Bytes::from_static(b"abc")).into_bytes();
        assert_eq!(&bytes[..], b"abc");
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn detached_bodies_are_untracked() {
        let body = Body::detached(vec![1, 2, 3]);
        assert!(!body.is_tracked());
        assert!(!body.retain().is_tracked());
        assert_eq!(body.len(), 3);
    }
}
