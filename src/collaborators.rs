//! Seams to the systems this crate does not own.
//!
//! - [`SampleStore`]: persistence, reads the samples of a case
//! - [`MarkerSource`]: network search for infrastructure inside bounds
//! - [`MarkerRenderer`]: map SDK, receives render commands
//!
//! The in-memory implementations back the tests and are usable for embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use futures::future::{self, BoxFuture};
use serde::Serialize;

use crate::reconciler::RenderCommand;
use crate::viewport_cache::InfrastructureMarker;
use crate::{CaseMapError, GeoBounds, LocationSample, Result};

/// Read access to persisted samples.
pub trait SampleStore: Send + Sync {
    fn load_samples(&self, case_id: &str) -> Result<Vec<LocationSample>>;
}

/// Asynchronous marker search.
pub trait MarkerSource: Send + Sync {
    fn fetch<'a>(&'a self, bounds: GeoBounds) -> BoxFuture<'a, Result<Vec<InfrastructureMarker>>>;
}

/// Which overlay a batch of commands targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MarkerLayer {
    /// Markers built from the case's samples
    Samples,
    /// Cell towers and cameras from the marker source
    Infrastructure,
}

/// Receiver of render commands.
pub trait MarkerRenderer: Send + Sync {
    fn apply(&self, layer: MarkerLayer, commands: &[RenderCommand]);
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// Samples grouped by case id.
#[derive(Debug, Default)]
pub struct MemorySampleStore {
    cases: RwLock<HashMap<String, Vec<LocationSample>>>,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all samples of a case.
    pub fn set_case(&self, case_id: &str, samples: Vec<LocationSample>) {
        let mut cases = self.cases.write().unwrap_or_else(|e| e.into_inner());
        cases.insert(case_id.to_string(), samples);
    }

    /// Insert or replace one sample by id.
    pub fn upsert_sample(&self, case_id: &str, sample: LocationSample) {
        let mut cases = self.cases.write().unwrap_or_else(|e| e.into_inner());
        let samples = cases.entry(case_id.to_string()).or_default();
        match samples.iter_mut().find(|s| s.id == sample.id) {
            Some(existing) => *existing = sample,
            None => samples.push(sample),
        }
    }

    pub fn remove_sample(&self, case_id: &str, sample_id: &str) -> bool {
        let mut cases = self.cases.write().unwrap_or_else(|e| e.into_inner());
        match cases.get_mut(case_id) {
            Some(samples) => {
                let before = samples.len();
                samples.retain(|s| s.id != sample_id);
                samples.len() != before
            }
            None => false,
        }
    }
}

impl SampleStore for MemorySampleStore {
    fn load_samples(&self, case_id: &str) -> Result<Vec<LocationSample>> {
        let cases = self.cases.read().unwrap_or_else(|e| e.into_inner());
        cases
            .get(case_id)
            .cloned()
            .ok_or_else(|| CaseMapError::persistence(format!("unknown case '{}'", case_id)))
    }
}

/// Fixed marker set filtered by bounds; can be switched to fail.
#[derive(Debug, Default)]
pub struct StaticMarkerSource {
    markers: Vec<InfrastructureMarker>,
    calls: AtomicU32,
    failing: AtomicBool,
}

impl StaticMarkerSource {
    pub fn new(markers: Vec<InfrastructureMarker>) -> Self {
        Self {
            markers,
            calls: AtomicU32::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of fetches received so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl MarkerSource for StaticMarkerSource {
    fn fetch<'a>(&'a self, bounds: GeoBounds) -> BoxFuture<'a, Result<Vec<InfrastructureMarker>>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let result = if self.failing.load(Ordering::Relaxed) {
            Err(CaseMapError::Fetch {
                message: "source unavailable".to_string(),
                status_code: Some(503),
            })
        } else {
            Ok(self
                .markers
                .iter()
                .filter(|m| bounds.contains_point(&m.coordinate))
                .cloned()
                .collect())
        };
        Box::pin(future::ready(result))
    }
}

/// Renderer that records every batch it receives.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    batches: Mutex<Vec<(MarkerLayer, Vec<RenderCommand>)>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain recorded batches.
    pub fn take(&self) -> Vec<(MarkerLayer, Vec<RenderCommand>)> {
        std::mem::take(&mut *self.batches.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Commands recorded for one layer, flattened in arrival order.
    pub fn commands_for(&self, layer: MarkerLayer) -> Vec<RenderCommand> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(l, _)| *l == layer)
            .flat_map(|(_, commands)| commands.iter().cloned())
            .collect()
    }
}

impl MarkerRenderer for RecordingRenderer {
    fn apply(&self, layer: MarkerLayer, commands: &[RenderCommand]) {
        if commands.is_empty() {
            return;
        }
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((layer, commands.to_vec()));
    }
}
