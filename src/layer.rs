/// A loaded query: the records one descriptor produced

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use crate::error::LoadError;
use crate::loader::{QueryDescriptor, SourceKind, TieredLoader};
use crate::source::ColumnMeta;
use crate::stamp::StampRecord;

#[derive(Debug, Default)]
struct LayerState {
    records: Vec<Arc<StampRecord>>,
    columns: Arc<Vec<ColumnMeta>>,
    last_source: Option<SourceKind>,
    qualifiers: Vec<String>,
    loaded_at: Option<DateTime<Utc>>,
}

/// Records for one query, plus how they were obtained.
///
/// Loads of the same layer are serialized by its state lock; different
/// layers load independently.
#[derive(Debug)]
pub struct StampLayer {
    descriptor: QueryDescriptor,
    signature: String,
    state: Mutex<LayerState>,
    /// Readable while a reload holds the state lock
    bad: AtomicBool,
}

impl StampLayer {
    /// An empty layer; nothing is loaded until `reload`
    pub fn new(descriptor: QueryDescriptor) -> Self {
        Self {
            signature: descriptor.signature(),
            descriptor,
            state: Mutex::new(LayerState::default()),
            bad: AtomicBool::new(false),
        }
    }

    /// Build a layer and load it. Failure produces no layer.
    pub fn load(descriptor: QueryDescriptor, loader: &TieredLoader) -> Result<Self, LoadError> {
        let layer = Self::new(descriptor);
        layer.reload(loader)?;
        Ok(layer)
    }

    /// Run the tiered load again, replacing the records on success.
    ///
    /// On failure the previous records are kept but the layer is marked bad,
    /// so the registry rebuilds it on the next request.
    pub fn reload(&self, loader: &TieredLoader) -> Result<usize, LoadError> {
        let mut state = self.lock();
        match loader.load(&self.descriptor) {
            Ok(outcome) => {
                let count = outcome.records.len();
                state.records = outcome.records;
                state.columns = outcome.columns;
                state.last_source = Some(outcome.source);
                state.qualifiers = outcome.qualifiers;
                state.loaded_at = Some(Utc::now());
                self.bad.store(false, Ordering::Release);
                Ok(count)
            }
            Err(e) => {
                warn!(layer = %self.descriptor.description, error = %e, "Layer load failed");
                self.bad.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LayerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    pub fn records(&self) -> Vec<Arc<StampRecord>> {
        self.lock().records.clone()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn columns(&self) -> Arc<Vec<ColumnMeta>> {
        Arc::clone(&self.lock().columns)
    }

    /// Tier that supplied the current records
    pub fn last_source(&self) -> Option<SourceKind> {
        self.lock().last_source
    }

    pub fn qualifiers(&self) -> Vec<String> {
        self.lock().qualifiers.clone()
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.lock().loaded_at
    }

    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    pub fn mark_bad(&self) {
        self.bad.store(true, Ordering::Release);
    }
}
