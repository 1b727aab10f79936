//! # Aggregation Orchestrator
//!
//! Connects the pure aggregation passes, the viewport cache and the marker reconcilers to
//! app events, and talks to the collaborators.
//!
//! ## Events
//!
//! - **case loaded**: read samples, compute stays, frequencies and time series, reconcile
//!   the sample marker layer
//! - **viewport idle**: consult the cache, fetch if needed, reconcile the infrastructure layer
//! - **layer toggle**: hide infrastructure markers or re-evaluate the last viewport
//! - **selection**: expand one marker, collapse the rest
//!
//! Mutable state sits behind mutexes that are never held across an `.await`, so a fetch
//! completing while a new idle event is being evaluated is serialized on the cache lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{MarkerLayer, MarkerRenderer, MarkerSource, SampleStore};
use crate::frequency::{
    filter_by_type, normalize_address, raw_frequency_by_address, raw_frequency_by_coordinate,
    run_frequency_by_address, run_frequency_by_coordinate, time_sorted, CoordinateFrequency,
    CoordinateKey,
};
use crate::reconciler::{MarkerColor, MarkerKind, MarkerModel, MarkerReconciler, RenderCommand};
use crate::stays::{group_stays, Stay};
use crate::timeseries::{analyze, TimeSeriesReport};
use crate::viewport_cache::{
    CacheConfig, CacheStats, IdleDecision, InfrastructureKind, InfrastructureMarker,
    ViewportCache,
};
use crate::{AggregationConfig, GeoBounds, LocationSample, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Complete configuration for the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub aggregation: AggregationConfig,
    pub cache: CacheConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.aggregation.validate()?;
        self.cache.validate()
    }

    /// Parse and validate a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: OrchestratorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Everything derived from one case load.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseAnalysis {
    pub case_id: String,
    pub stays: Vec<Stay>,
    /// The last stay, if it is still ongoing
    pub current_stay: Option<Stay>,
    /// Run-based counts per rounded coordinate (trackable type only)
    pub visit_counts: Vec<CoordinateFrequency>,
    /// Raw counts per rounded coordinate (trackable type only)
    pub stay_counts: Vec<CoordinateFrequency>,
    /// Run-based counts per address (trackable type only)
    pub address_visits: Vec<(String, u32)>,
    /// Raw counts per address (trackable type only)
    pub address_samples: Vec<(String, u32)>,
    pub time_series: TimeSeriesReport,
}

/// Orchestrator statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub cases_loaded: u32,
    pub current_case: Option<String>,
    pub sample_marker_count: u32,
    pub infrastructure_marker_count: u32,
    pub cache: CacheStats,
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Run every aggregation pass over one case's samples.
pub fn build_case_analysis(
    case_id: &str,
    samples: &[LocationSample],
    config: &AggregationConfig,
    clock: &dyn Clock,
) -> CaseAnalysis {
    let tracked = filter_by_type(samples, config.trackable_type);
    let stays = group_stays(&tracked);
    let current_stay = stays
        .last()
        .filter(|s| s.is_ongoing(clock, config))
        .cloned();

    CaseAnalysis {
        case_id: case_id.to_string(),
        current_stay,
        visit_counts: run_frequency_by_coordinate(&tracked, config.coordinate_precision),
        stay_counts: raw_frequency_by_coordinate(&tracked, config.coordinate_precision),
        address_visits: run_frequency_by_address(&tracked),
        address_samples: raw_frequency_by_address(&tracked),
        time_series: analyze(&tracked, config),
        stays,
    }
}

/// Markers for the sample layer.
///
/// Trackable samples collapse to one marker per rounded coordinate showing its visit
/// count; every other sample is a pin of its own.
pub fn sample_marker_models(
    samples: &[LocationSample],
    config: &AggregationConfig,
) -> Vec<MarkerModel> {
    let tracked = filter_by_type(samples, config.trackable_type);

    let mut captions: HashMap<String, String> = HashMap::new();
    let mut colors: HashMap<String, MarkerColor> = HashMap::new();
    for sample in time_sorted(&tracked) {
        let key = CoordinateKey::new(&sample.coordinate, config.coordinate_precision).label();
        captions
            .entry(key.clone())
            .or_insert_with(|| normalize_address(sample.address.as_deref()));
        colors
            .entry(key)
            .or_insert_with(|| MarkerColor::from_tag(sample.color_tag.as_deref()));
    }

    let visits = run_frequency_by_coordinate(&tracked, config.coordinate_precision);
    let mut models: Vec<MarkerModel> = visits
        .into_iter()
        .map(|freq| {
            let label = freq.key.label();
            let kind = if freq.count > 1 {
                MarkerKind::Number(freq.count)
            } else {
                MarkerKind::Symbol(config.trackable_type.symbol_name().to_string())
            };
            MarkerModel {
                id: format!("visit:{}", label),
                coordinate: freq.centroid,
                kind,
                color: colors.remove(&label).unwrap_or(MarkerColor::Red),
                caption: captions.remove(&label),
            }
        })
        .collect();

    models.extend(
        samples
            .iter()
            .filter(|s| s.location_type != config.trackable_type)
            .map(|s| {
                let caption = if s.title.trim().is_empty() {
                    s.usable_address().map(str::to_string)
                } else {
                    Some(s.title.clone())
                };
                MarkerModel {
                    id: format!("pin:{}", s.id),
                    coordinate: s.coordinate,
                    kind: MarkerKind::Symbol(s.location_type.symbol_name().to_string()),
                    color: MarkerColor::from_tag(s.color_tag.as_deref()),
                    caption,
                }
            }),
    );

    models
}

/// Marker for one cached infrastructure entry.
pub fn infrastructure_marker_model(marker: &InfrastructureMarker) -> MarkerModel {
    let color = match marker.kind {
        InfrastructureKind::CellTower => MarkerColor::Blue,
        InfrastructureKind::Cctv => MarkerColor::Purple,
    };
    MarkerModel {
        id: format!("infra:{}", marker.id),
        coordinate: marker.coordinate,
        kind: MarkerKind::Image(marker.kind.image_name().to_string()),
        color,
        caption: (!marker.name.is_empty()).then(|| marker.name.clone()),
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Event-driven owner of the cache and marker state.
pub struct AggregationOrchestrator {
    store: Arc<dyn SampleStore>,
    source: Arc<dyn MarkerSource>,
    renderer: Arc<dyn MarkerRenderer>,
    clock: Arc<dyn Clock>,

    config: RwLock<OrchestratorConfig>,
    cache: Mutex<ViewportCache>,
    sample_markers: Mutex<MarkerReconciler>,
    infra_markers: Mutex<MarkerReconciler>,

    /// Last viewport and zoom reported idle
    viewport: Mutex<Option<(GeoBounds, f64)>>,
    current_case: Mutex<Option<String>>,
    cases_loaded: AtomicU32,
}

impl AggregationOrchestrator {
    /// Create an orchestrator with default configuration and the system clock.
    pub fn new(
        store: Arc<dyn SampleStore>,
        source: Arc<dyn MarkerSource>,
        renderer: Arc<dyn MarkerRenderer>,
    ) -> Self {
        Self {
            store,
            source,
            renderer,
            clock: Arc::new(SystemClock),
            cache: Mutex::new(ViewportCache::new(CacheConfig::default())),
            config: RwLock::new(OrchestratorConfig::default()),
            sample_markers: Mutex::new(MarkerReconciler::new()),
            infra_markers: Mutex::new(MarkerReconciler::new()),
            viewport: Mutex::new(None),
            current_case: Mutex::new(None),
            cases_loaded: AtomicU32::new(0),
        }
    }

    /// Create an orchestrator with a validated configuration.
    pub fn with_config(
        store: Arc<dyn SampleStore>,
        source: Arc<dyn MarkerSource>,
        renderer: Arc<dyn MarkerRenderer>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let orchestrator = Self::new(store, source, renderer);
        *lock(&orchestrator.cache) = ViewportCache::new(config.cache.clone());
        *orchestrator.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        Ok(orchestrator)
    }

    /// Replace the clock (tests pin "now" with a [`crate::FixedClock`]).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Update configuration. Takes effect on the next event; a smaller cache capacity
    /// evicts immediately.
    pub fn set_config(&self, config: OrchestratorConfig) -> Result<()> {
        config.validate()?;
        let evicted = lock(&self.cache).set_config(config.cache.clone());
        if !evicted.is_empty() {
            info!(
                "[Orchestrator] Config change evicted {} cached markers",
                evicted.len()
            );
        }
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        if !evicted.is_empty() {
            self.render_infrastructure();
        }
        Ok(())
    }

    // ========================================================================
    // Case load
    // ========================================================================

    /// Load a case, compute its aggregates and refresh the sample layer.
    pub fn load_case(&self, case_id: &str) -> Result<CaseAnalysis> {
        let samples = self.store.load_samples(case_id)?;
        let config = self.config().aggregation;

        let analysis = build_case_analysis(case_id, &samples, &config, self.clock.as_ref());
        let models = sample_marker_models(&samples, &config);

        let commands = lock(&self.sample_markers).reconcile(models);
        self.renderer.apply(MarkerLayer::Samples, &commands);

        *lock(&self.current_case) = Some(case_id.to_string());
        self.cases_loaded.fetch_add(1, Ordering::Relaxed);

        info!(
            "[Orchestrator] Loaded case {}: {} samples, {} stays, {} marker commands",
            case_id,
            samples.len(),
            analysis.stays.len(),
            commands.len()
        );
        Ok(analysis)
    }

    /// Reload the current case, if any.
    pub fn refresh_case(&self) -> Result<Option<CaseAnalysis>> {
        let current = lock(&self.current_case).clone();
        current.map(|id| self.load_case(&id)).transpose()
    }

    // ========================================================================
    // Viewport
    // ========================================================================

    /// Handle the map settling on a new viewport.
    pub async fn on_viewport_idle(&self, bounds: GeoBounds, zoom: f64) -> IdleDecision {
        *lock(&self.viewport) = Some((bounds, zoom));

        let decision = lock(&self.cache).on_viewport_idle(bounds, zoom);

        match decision {
            IdleDecision::Fetch { ticket } => {
                let result = self.source.fetch(ticket.bounds).await;
                {
                    let mut cache = lock(&self.cache);
                    match result {
                        Ok(markers) => {
                            cache.on_fetch_success(&ticket, markers);
                        }
                        Err(e) => {
                            cache.on_fetch_failure(&ticket, &e);
                        }
                    }
                }
                self.render_infrastructure();
            }
            IdleDecision::Reuse => self.render_infrastructure(),
            IdleDecision::Skip { reason } => {
                debug!("[Orchestrator] Idle skipped: {:?}", reason);
            }
        }

        decision
    }

    /// Turn the infrastructure layer on or off. Turning it off hides its markers.
    ///
    /// Turning it on shows nothing until the next idle event; call
    /// [`AggregationOrchestrator::reevaluate_viewport`] to evaluate right away.
    pub fn set_infrastructure_enabled(&self, enabled: bool) {
        lock(&self.cache).set_enabled(enabled);
        if !enabled {
            let commands = lock(&self.infra_markers).clear();
            self.renderer.apply(MarkerLayer::Infrastructure, &commands);
        }
    }

    /// Re-run the idle evaluation for the last reported viewport, if any.
    pub async fn reevaluate_viewport(&self) -> Option<IdleDecision> {
        let last = *lock(&self.viewport);
        match last {
            Some((bounds, zoom)) => Some(self.on_viewport_idle(bounds, zoom).await),
            None => None,
        }
    }

    /// Reconcile the infrastructure layer against cached markers in the last viewport.
    fn render_infrastructure(&self) {
        let Some((viewport, _)) = *lock(&self.viewport) else {
            return;
        };
        let models: Vec<MarkerModel> = {
            let mut cache = lock(&self.cache);
            if !cache.is_enabled() {
                return;
            }
            cache
                .markers_in(&viewport)
                .into_iter()
                .map(infrastructure_marker_model)
                .collect()
        };
        let commands = lock(&self.infra_markers).reconcile(models);
        self.renderer.apply(MarkerLayer::Infrastructure, &commands);
    }

    // ========================================================================
    // Selection
    // ========================================================================

    fn reconciler(&self, layer: MarkerLayer) -> &Mutex<MarkerReconciler> {
        match layer {
            MarkerLayer::Samples => &self.sample_markers,
            MarkerLayer::Infrastructure => &self.infra_markers,
        }
    }

    /// Select a marker; any selection on the other layer is cleared.
    pub fn select_marker(&self, layer: MarkerLayer, id: &str) {
        let other = match layer {
            MarkerLayer::Samples => MarkerLayer::Infrastructure,
            MarkerLayer::Infrastructure => MarkerLayer::Samples,
        };
        let commands = lock(self.reconciler(other)).deselect();
        self.renderer.apply(other, &commands);

        let commands = lock(self.reconciler(layer)).select(id);
        self.renderer.apply(layer, &commands);
    }

    /// Clear the selection on both layers.
    pub fn deselect_marker(&self) {
        for layer in [MarkerLayer::Samples, MarkerLayer::Infrastructure] {
            let commands = lock(self.reconciler(layer)).deselect();
            self.renderer.apply(layer, &commands);
        }
    }

    pub fn selected_marker(&self) -> Option<(MarkerLayer, String)> {
        [MarkerLayer::Samples, MarkerLayer::Infrastructure]
            .into_iter()
            .find_map(|layer| {
                lock(self.reconciler(layer))
                    .selected()
                    .map(|id| (layer, id.to_string()))
            })
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            cases_loaded: self.cases_loaded.load(Ordering::Relaxed),
            current_case: lock(&self.current_case).clone(),
            sample_marker_count: lock(&self.sample_markers).len() as u32,
            infrastructure_marker_count: lock(&self.infra_markers).len() as u32,
            cache: lock(&self.cache).stats(),
        }
    }

    /// Commands that would redraw a layer from scratch (after the renderer lost state).
    pub fn snapshot_commands(&self, layer: MarkerLayer) -> Vec<RenderCommand> {
        lock(self.reconciler(layer))
            .records()
            .cloned()
            .map(|record| RenderCommand::Add { record })
            .collect()
    }
}

// ============================================================================
// Global Singleton
// ============================================================================

/// Global orchestrator instance, installed once at app startup.
///
/// This singleton allows FFI calls to reach shared state without passing it back and
/// forth across the FFI boundary.
pub static ORCHESTRATOR: Lazy<Mutex<Option<Arc<AggregationOrchestrator>>>> =
    Lazy::new(|| Mutex::new(None));

/// Install (or replace) the global orchestrator.
pub fn install_orchestrator(orchestrator: Arc<AggregationOrchestrator>) {
    *lock(&*ORCHESTRATOR) = Some(orchestrator);
}

/// Run `f` against the global orchestrator. `None` if none is installed.
///
/// The global lock is released before `f` runs, so `f` may await.
pub fn with_orchestrator<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Arc<AggregationOrchestrator>) -> R,
{
    let orchestrator = lock(&*ORCHESTRATOR).clone()?;
    Some(f(&orchestrator))
}

// ============================================================================
// Tests
// ============================================================================
