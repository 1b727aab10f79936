//! FFI bindings for mobile platforms (iOS/Android).
//!
//! Exposes the aggregation passes and the orchestrator to Kotlin and Swift through UniFFI.
//! Structured values cross the boundary as JSON strings; failures come back as
//! `{"error": "..."}` instead of panicking across the boundary.

use std::future::Future;
use std::sync::Arc;

use log::{info, warn};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::collaborators::{MarkerLayer, MarkerRenderer, MarkerSource, MemorySampleStore};
use crate::orchestrator::{
    install_orchestrator, with_orchestrator, AggregationOrchestrator, OrchestratorConfig,
};
use crate::reconciler::RenderCommand;
use crate::{
    analyze, group_stays, init_logging, raw_frequency_by_address, raw_frequency_by_coordinate,
    run_frequency_by_address, run_frequency_by_coordinate, AggregationConfig, CaseMapError,
    GeoBounds, LocationSample, OptionExt,
};

const NOT_INITIALIZED: &str = "orchestrator not initialized";

/// Samples pushed from the app, read back by the orchestrator on case load.
static SAMPLE_STORE: Lazy<Arc<MemorySampleStore>> =
    Lazy::new(|| Arc::new(MemorySampleStore::new()));

// ============================================================================
// Helpers
// ============================================================================

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn error_json(error: &CaseMapError) -> String {
    warn!("[CasemapRust] {}", error);
    serde_json::json!({ "error": error.to_string() }).to_string()
}

fn parse_samples(samples_json: &str) -> crate::Result<Vec<LocationSample>> {
    Ok(serde_json::from_str(samples_json)?)
}

fn parse_aggregation_config(config_json: &str) -> crate::Result<AggregationConfig> {
    if config_json.trim().is_empty() {
        return Ok(AggregationConfig::default());
    }
    let config: AggregationConfig = serde_json::from_str(config_json)?;
    config.validate()?;
    Ok(config)
}

fn parse_layer(layer: &str) -> Option<MarkerLayer> {
    match layer {
        "samples" => Some(MarkerLayer::Samples),
        "infrastructure" => Some(MarkerLayer::Infrastructure),
        _ => None,
    }
}

#[cfg(feature = "http")]
static RUNTIME: Lazy<Option<tokio::runtime::Runtime>> = Lazy::new(|| {
    tokio::runtime::Runtime::new()
        .map_err(|e| warn!("[CasemapRust] Failed to create tokio runtime: {}", e))
        .ok()
});

/// Drive a future to completion from a synchronous FFI call.
#[cfg(feature = "http")]
fn block_on<F: Future>(future: F) -> Option<F::Output> {
    RUNTIME.as_ref().map(|rt| rt.block_on(future))
}

#[cfg(not(feature = "http"))]
fn block_on<F: Future>(future: F) -> Option<F::Output> {
    Some(futures::executor::block_on(future))
}

#[cfg(feature = "http")]
fn default_marker_source() -> Arc<dyn MarkerSource> {
    match crate::http::OverpassMarkerSource::new() {
        Ok(source) => Arc::new(source),
        Err(e) => {
            warn!("[CasemapRust] Falling back to empty marker source: {}", e);
            Arc::new(crate::collaborators::StaticMarkerSource::default())
        }
    }
}

#[cfg(not(feature = "http"))]
fn default_marker_source() -> Arc<dyn MarkerSource> {
    Arc::new(crate::collaborators::StaticMarkerSource::default())
}

// ============================================================================
// Renderer Callback Interface
// ============================================================================

/// Receives render commands on the app side.
/// Implement this in Kotlin/Swift and hand it to [`ffi_init_orchestrator`].
#[uniffi::export(callback_interface)]
pub trait RenderCallback: Send + Sync {
    /// - layer: `"samples"` or `"infrastructure"`
    /// - commands_json: JSON array of add/update/remove commands
    fn on_commands(&self, layer: String, commands_json: String);
}

struct CallbackRenderer(Box<dyn RenderCallback>);

impl MarkerRenderer for CallbackRenderer {
    fn apply(&self, layer: MarkerLayer, commands: &[RenderCommand]) {
        if commands.is_empty() {
            return;
        }
        let layer = match layer {
            MarkerLayer::Samples => "samples",
            MarkerLayer::Infrastructure => "infrastructure",
        };
        self.0.on_commands(layer.to_string(), to_json(&commands));
    }
}

// ============================================================================
// Aggregation Functions
// ============================================================================

/// Group samples into stays.
///
/// # Returns
/// JSON array of stays
#[uniffi::export]
pub fn ffi_group_stays(samples_json: String) -> String {
    init_logging();
    match parse_samples(&samples_json) {
        Ok(samples) => {
            let stays = group_stays(&samples);
            info!(
                "[CasemapRust] group_stays: {} samples -> {} stays",
                samples.len(),
                stays.len()
            );
            to_json(&stays)
        }
        Err(e) => error_json(&e),
    }
}

/// Run-based and raw visit counts, keyed by rounded coordinate and by address.
#[uniffi::export]
pub fn ffi_visit_frequencies(samples_json: String, precision: u32) -> String {
    init_logging();
    let samples = match parse_samples(&samples_json) {
        Ok(samples) => samples,
        Err(e) => return error_json(&e),
    };
    serde_json::json!({
        "runByCoordinate": run_frequency_by_coordinate(&samples, precision),
        "rawByCoordinate": raw_frequency_by_coordinate(&samples, precision),
        "runByAddress": run_frequency_by_address(&samples),
        "rawByAddress": raw_frequency_by_address(&samples),
    })
    .to_string()
}

/// Rankings and hourly grids for charting.
///
/// An empty `config_json` uses the default configuration.
#[uniffi::export]
pub fn ffi_analyze(samples_json: String, config_json: String) -> String {
    init_logging();
    let result = parse_samples(&samples_json).and_then(|samples| {
        let config = parse_aggregation_config(&config_json)?;
        Ok(analyze(&samples, &config))
    });
    match result {
        Ok(report) => to_json(&report),
        Err(e) => error_json(&e),
    }
}

/// Default orchestrator configuration as JSON.
#[uniffi::export]
pub fn default_config_json() -> String {
    to_json(&OrchestratorConfig::default())
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Install the global orchestrator. Returns false if the config is invalid.
#[uniffi::export]
pub fn ffi_init_orchestrator(config_json: String, renderer: Box<dyn RenderCallback>) -> bool {
    init_logging();
    let config = if config_json.trim().is_empty() {
        Ok(OrchestratorConfig::default())
    } else {
        OrchestratorConfig::from_json(&config_json)
    };

    let orchestrator = config.and_then(|config| {
        AggregationOrchestrator::with_config(
            SAMPLE_STORE.clone(),
            default_marker_source(),
            Arc::new(CallbackRenderer(renderer)),
            config,
        )
    });

    match orchestrator {
        Ok(orchestrator) => {
            install_orchestrator(Arc::new(orchestrator));
            info!("[CasemapRust] Orchestrator installed");
            true
        }
        Err(e) => {
            warn!("[CasemapRust] Orchestrator init failed: {}", e);
            false
        }
    }
}

/// Replace the samples of a case. Returns false if the JSON is malformed.
#[uniffi::export]
pub fn ffi_set_case_samples(case_id: String, samples_json: String) -> bool {
    match parse_samples(&samples_json) {
        Ok(samples) => {
            SAMPLE_STORE.set_case(&case_id, samples);
            true
        }
        Err(e) => {
            warn!("[CasemapRust] Rejected samples for {}: {}", case_id, e);
            false
        }
    }
}

/// Load a case through the orchestrator.
///
/// # Returns
/// JSON case analysis, or `{"error": ...}`
#[uniffi::export]
pub fn ffi_load_case(case_id: String) -> String {
    let result = with_orchestrator(|o| o.load_case(&case_id))
        .ok_or_internal(NOT_INITIALIZED)
        .and_then(|r| r);
    match result {
        Ok(analysis) => to_json(&analysis),
        Err(e) => error_json(&e),
    }
}

/// Report the map settling on a viewport. Blocks until any triggered fetch completes.
///
/// # Returns
/// JSON idle decision, or `{"error": ...}`
#[uniffi::export]
pub fn ffi_viewport_idle(
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
    zoom: f64,
) -> String {
    let bounds = match GeoBounds::new(min_lat, min_lon, max_lat, max_lon) {
        Ok(bounds) => bounds,
        Err(e) => return error_json(&e),
    };
    let decision = with_orchestrator(|o| block_on(o.on_viewport_idle(bounds, zoom)))
        .ok_or_internal(NOT_INITIALIZED)
        .and_then(|d| d.ok_or_internal("no async runtime"));
    match decision {
        Ok(decision) => to_json(&decision),
        Err(e) => error_json(&e),
    }
}

#[uniffi::export]
pub fn ffi_set_infrastructure_enabled(enabled: bool) {
    with_orchestrator(|o| o.set_infrastructure_enabled(enabled));
}

/// Select a marker. `layer` is `"samples"` or `"infrastructure"`.
#[uniffi::export]
pub fn ffi_select_marker(layer: String, marker_id: String) -> bool {
    let Some(layer) = parse_layer(&layer) else {
        warn!("[CasemapRust] Unknown layer '{}'", layer);
        return false;
    };
    with_orchestrator(|o| o.select_marker(layer, &marker_id)).is_some()
}

#[uniffi::export]
pub fn ffi_deselect_marker() {
    with_orchestrator(|o| o.deselect_marker());
}

/// Orchestrator statistics as JSON.
#[uniffi::export]
pub fn ffi_orchestrator_stats() -> String {
    match with_orchestrator(|o| o.stats()) {
        Some(stats) => to_json(&stats),
        None => "{}".to_string(),
    }
}
