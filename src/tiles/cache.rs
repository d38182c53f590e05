//! LRU cache of decompressed tiles

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;

use super::tile::Tile;

/// Identifies one decoded snapshot of a tile.
///
/// The tile generation is part of the key, so a tile that was recompressed
/// or invalidated never hits a stale entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DecodeKey {
    pub scale: u32,
    /// Pixel origin of the tile at that scale
    pub x: i64,
    pub y: i64,
    pub generation: u64,
}

impl DecodeKey {
    #[must_use]
    pub fn for_tile(scale: u32, tile: &Tile) -> Self {
        let px = tile.pixel_rect();
        Self {
            scale,
            x: px.x,
            y: px.y,
            generation: tile.generation(),
        }
    }
}

/// Decoded pixel buffers, evicted least recently used first.
pub struct DecodeCache {
    cache: LruCache<DecodeKey, Arc<[u8]>>,
}

pub type SharedDecodeCache = Arc<Mutex<DecodeCache>>;

impl DecodeCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    #[must_use]
    pub fn shared(capacity: usize) -> SharedDecodeCache {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// Get a decoded tile, promoting it in the LRU order
    #[must_use]
    pub fn get(&mut self, key: &DecodeKey) -> Option<Arc<[u8]>> {
        self.cache.get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &DecodeKey) -> bool {
        self.cache.contains(key)
    }

    pub fn insert(&mut self, key: DecodeKey, pixels: Vec<u8>) -> Arc<[u8]> {
        let arc: Arc<[u8]> = pixels.into();
        self.cache.put(key, Arc::clone(&arc));
        arc
    }

    pub fn invalidate_all(&mut self) {
        self.cache.clear();
    }

    /// Drops every entry decoded at `scale`.
    pub fn invalidate_scale(&mut self, scale: u32) {
        let stale: Vec<DecodeKey> = self
            .cache
            .iter()
            .filter(|(k, _)| k.scale == scale)
            .map(|(k, _)| *k)
            .collect();

        for key in stale {
            self.cache.pop(&key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }
}

/// Locks a shared cache, ignoring poisoning.
pub fn lock(cache: &SharedDecodeCache) -> std::sync::MutexGuard<'_, DecodeCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}
