/// Bounded LRU registry of loaded layers
///
/// Equivalent queries reuse the layer built for the first one. Layers that
/// no live view references form the unused set; once it grows past the
/// capacity the least recently accessed unused layers are dropped.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::layer::StampLayer;

/// Default number of unused layers kept
pub const DEFAULT_CAPACITY: usize = 5;

struct RegistryEntry {
    layer: Arc<StampLayer>,
    last_access: DateTime<Utc>,
    /// Position in the access order; larger is more recent
    tick: u64,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, RegistryEntry>,
    /// tick -> signature, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    /// Signatures being opened, with the number of openers
    pinned: HashMap<String, usize>,
}

impl RegistryState {
    fn touch(&mut self, signature: &str) {
        let tick = self.next_tick;
        if let Some(entry) = self.entries.get_mut(signature) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            entry.last_access = Utc::now();
            self.order.insert(tick, signature.to_string());
            self.next_tick += 1;
        }
    }

    fn insert(&mut self, signature: &str, layer: Arc<StampLayer>) {
        self.remove(signature);
        let tick = self.next_tick;
        self.next_tick += 1;
        self.entries.insert(
            signature.to_string(),
            RegistryEntry {
                layer,
                last_access: Utc::now(),
                tick,
            },
        );
        self.order.insert(tick, signature.to_string());
    }

    fn remove(&mut self, signature: &str) -> Option<RegistryEntry> {
        let entry = self.entries.remove(signature)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }

    /// Signatures outside `in_use` and not pinned, oldest access first
    fn unused(&self, in_use: &HashSet<String>) -> Vec<String> {
        self.order
            .values()
            .filter(|sig| !in_use.contains(*sig) && !self.pinned.contains_key(*sig))
            .cloned()
            .collect()
    }

    /// Live (non-bad) layer for a signature
    fn usable(&self, signature: &str) -> Option<Arc<StampLayer>> {
        self.entries
            .get(signature)
            .filter(|e| !e.layer.is_bad())
            .map(|e| Arc::clone(&e.layer))
    }
}

/// Keeps a signature out of eviction until dropped. See `LayerRegistry::pin`.
#[must_use]
pub struct PinnedLayer<'a> {
    registry: &'a LayerRegistry,
    signature: String,
}

impl Drop for PinnedLayer<'_> {
    fn drop(&mut self) {
        let mut state = self.registry.lock();
        if let Some(count) = state.pinned.get_mut(&self.signature) {
            *count -= 1;
            if *count == 0 {
                state.pinned.remove(&self.signature);
            }
        }
    }
}

/// Summary of one cached layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerEntryInfo {
    pub signature: String,
    pub description: String,
    pub records: usize,
    pub last_access: DateTime<Utc>,
}

pub struct LayerRegistry {
    capacity: usize,
    state: Mutex<RegistryState>,
}

impl LayerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the cached layer for `signature`, or build one with `factory`.
    ///
    /// A layer marked bad is replaced. The factory runs without the registry
    /// lock held; its errors are returned and nothing is cached.
    pub fn get_or_create<F, E>(&self, signature: &str, factory: F) -> Result<Arc<StampLayer>, E>
    where
        F: FnOnce() -> Result<StampLayer, E>,
    {
        {
            let mut state = self.lock();
            if let Some(layer) = state.usable(signature) {
                state.touch(signature);
                debug!(signature, "Layer cache hit");
                return Ok(layer);
            }
        }

        let layer = Arc::new(factory()?);

        let mut state = self.lock();
        // Another caller may have built the same layer meanwhile
        if let Some(existing) = state.usable(signature) {
            state.touch(signature);
            return Ok(existing);
        }
        state.insert(signature, Arc::clone(&layer));
        info!(signature, description = layer.description(), "Layer cached");
        Ok(layer)
    }

    /// Treat `signature` as in use until the returned guard is dropped.
    ///
    /// Covers the window between `get_or_create` returning and the caller
    /// registering a view on the layer.
    pub fn pin(&self, signature: &str) -> PinnedLayer<'_> {
        *self.lock().pinned.entry(signature.to_string()).or_insert(0) += 1;
        PinnedLayer {
            registry: self,
            signature: signature.to_string(),
        }
    }

    /// Cached layer, refreshing its access time
    pub fn get(&self, signature: &str) -> Option<Arc<StampLayer>> {
        let mut state = self.lock();
        let layer = state.entries.get(signature).map(|e| Arc::clone(&e.layer))?;
        state.touch(signature);
        Some(layer)
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.lock().entries.contains_key(signature)
    }

    pub fn remove(&self, signature: &str) -> Option<Arc<StampLayer>> {
        self.lock().remove(signature).map(|e| e.layer)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Signatures neither in `in_use` nor pinned, oldest access first
    pub fn unused(&self, in_use: &HashSet<String>) -> Vec<String> {
        self.lock().unused(in_use)
    }

    /// Evict least recently accessed unused layers until at most `capacity`
    /// remain unused. Returns the evicted signatures.
    pub fn evict_excess(&self, in_use: &HashSet<String>) -> Vec<String> {
        let mut state = self.lock();
        let unused = state.unused(in_use);
        let excess = unused.len().saturating_sub(self.capacity);

        let evicted: Vec<String> = unused.into_iter().take(excess).collect();
        for signature in &evicted {
            if let Some(entry) = state.remove(signature) {
                info!(
                    description = entry.layer.description(),
                    last_access = %entry.last_access,
                    "Evicted unused layer"
                );
            }
        }
        evicted
    }

    pub fn entries(&self) -> Vec<LayerEntryInfo> {
        let state = self.lock();
        state
            .order
            .values()
            .filter_map(|sig| state.entries.get(sig).map(|e| (sig, e)))
            .map(|(sig, e)| LayerEntryInfo {
                signature: sig.clone(),
                description: e.layer.description().to_string(),
                records: e.layer.record_count(),
                last_access: e.last_access,
            })
            .collect()
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
