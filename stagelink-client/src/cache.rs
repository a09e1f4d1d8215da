//! Versioned layer cache
//!
//! Maps layer paths to the newest known content. Timestamps are host-issued
//! logical versions: an update wins only if its timestamp is strictly greater
//! than the cached one, whatever order the updates arrive in.

use std::collections::BTreeMap;

use bytes::Bytes;

/// One cached layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub timestamp: u64,
    pub payload: Bytes,
}

impl Layer {
    pub fn new(timestamp: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }
}

/// Result of [`LayerCache::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// Path was not cached before
    Inserted,
    /// Older version replaced
    Replaced { previous: u64 },
    /// Incoming version not newer than the cached one, cache untouched
    Stale { cached: u64 },
}

/// Path-keyed layer store with a dirty flag
///
/// Keys iterate in lexical order, which is also the sublayer order of the
/// composed document.
#[derive(Debug, Default)]
pub struct LayerCache {
    layers: BTreeMap<String, Layer>,
    dirty: bool,
}

impl LayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached timestamp that makes an update at `timestamp` stale
    ///
    /// `None` means the update would be accepted.
    pub fn stale_against(&self, path: &str, timestamp: u64) -> Option<u64> {
        self.timestamp(path).filter(|cached| timestamp <= *cached)
    }

    /// Timestamp of the cached layer at `path`
    pub fn timestamp(&self, path: &str) -> Option<u64> {
        self.layers.get(path).map(|l| l.timestamp)
    }

    /// Insert or overwrite, subject to the freshness rule
    pub fn upsert(&mut self, path: impl Into<String>, layer: Layer) -> Upsert {
        let path = path.into();
        if let Some(cached) = self.stale_against(&path, layer.timestamp) {
            return Upsert::Stale { cached };
        }
        match self.layers.get_mut(&path) {
            Some(cached) => {
                let previous = cached.timestamp;
                *cached = layer;
                self.dirty = true;
                Upsert::Replaced { previous }
            }
            None => {
                self.layers.insert(path, layer);
                self.dirty = true;
                Upsert::Inserted
            }
        }
    }

    /// Remove a layer; `None` if the path was not cached
    pub fn remove(&mut self, path: &str) -> Option<Layer> {
        let removed = self.layers.remove(path);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn get(&self, path: &str) -> Option<&Layer> {
        self.layers.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.layers.contains_key(path)
    }

    /// Cached paths in lexical order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag once the composed document has been persisted
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}
