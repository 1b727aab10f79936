//! End-to-end flows through the orchestrator with in-memory collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use casemap::{
    AggregationOrchestrator, Coordinate, FixedClock, GeoBounds, IdleDecision, InfrastructureKind,
    InfrastructureMarker, LocationSample, LocationType, MarkerKind, MarkerLayer, MarkerSource,
    MemorySampleStore, RecordingRenderer, RenderCommand, SkipReason, StaticMarkerSource,
    VisualState,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::channel::oneshot;
use futures::future::BoxFuture;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn t(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap() + Duration::minutes(minute)
}

fn bounds(min: f64, max: f64) -> GeoBounds {
    GeoBounds::new(min, min, max, max).unwrap()
}

fn tower(id: &str, at: f64) -> InfrastructureMarker {
    InfrastructureMarker::new(id, Coordinate::new(at, at), InfrastructureKind::CellTower)
}

fn five_towers() -> Vec<InfrastructureMarker> {
    vec![
        tower("t1", 1.0),
        tower("t3", 3.0),
        tower("t4", 4.0),
        tower("t7", 7.0),
        tower("t9", 9.0),
    ]
}

struct Harness {
    store: Arc<MemorySampleStore>,
    source: Arc<StaticMarkerSource>,
    renderer: Arc<RecordingRenderer>,
    orchestrator: AggregationOrchestrator,
}

fn harness(markers: Vec<InfrastructureMarker>) -> Harness {
    init_logging();
    let store = Arc::new(MemorySampleStore::new());
    let source = Arc::new(StaticMarkerSource::new(markers));
    let renderer = Arc::new(RecordingRenderer::new());
    let orchestrator = AggregationOrchestrator::new(store.clone(), source.clone(), renderer.clone())
        .with_clock(Arc::new(FixedClock::new(t(120))));
    Harness {
        store,
        source,
        renderer,
        orchestrator,
    }
}

fn adds(commands: &[RenderCommand]) -> usize {
    commands
        .iter()
        .filter(|c| matches!(c, RenderCommand::Add { .. }))
        .count()
}

fn removes(commands: &[RenderCommand]) -> usize {
    commands
        .iter()
        .filter(|c| matches!(c, RenderCommand::Remove { .. }))
        .count()
}

// ============================================================================
// Case load
// ============================================================================

#[test]
fn test_case_load_counts_visits_and_stays() {
    let h = harness(Vec::new());

    let sequence = [
        ("A", 1.0),
        ("A", 1.0),
        ("B", 2.0),
        ("B", 2.0),
        ("A", 1.0),
        ("C", 3.0),
        ("C", 3.0),
        ("B", 2.0),
    ];
    let samples: Vec<LocationSample> = sequence
        .iter()
        .enumerate()
        .map(|(i, (address, lat))| {
            LocationSample::new(i.to_string(), Coordinate::new(*lat, 5.0), LocationType::CellTower)
                .with_address(*address)
                .with_time(t(i as i64 * 10))
        })
        .collect();
    h.store.set_case("case-1", samples);

    let analysis = h.orchestrator.load_case("case-1").unwrap();

    let stays: Vec<&str> = analysis.stays.iter().map(|s| s.address.as_str()).collect();
    assert_eq!(stays, vec!["A", "B", "A", "C", "B"]);

    let visits = |name: &str| {
        analysis
            .address_visits
            .iter()
            .find(|(a, _)| a == name)
            .map(|(_, n)| *n)
    };
    assert_eq!(visits("A"), Some(2));
    assert_eq!(visits("B"), Some(2));
    assert_eq!(visits("C"), Some(1));

    let raw: Vec<u32> = analysis.address_samples.iter().map(|(_, n)| *n).collect();
    assert_eq!(raw, vec![3, 3, 2]);

    let run_total: u32 = analysis.visit_counts.iter().map(|f| f.count).sum();
    let raw_total: u32 = analysis.stay_counts.iter().map(|f| f.count).sum();
    assert!(run_total <= raw_total);

    // Last ping at minute 70, clock at 120
    assert!(analysis.current_stay.is_none());

    let grid = &analysis.time_series.grids[0];
    assert_eq!(grid.buckets.len(), analysis.time_series.weeks as usize * 7 * 24);

    let commands = h.renderer.commands_for(MarkerLayer::Samples);
    assert_eq!(adds(&commands), 3);
}

#[test]
fn test_missing_case_propagates_error() {
    let h = harness(Vec::new());
    assert!(h.orchestrator.load_case("nope").is_err());
    assert!(h.renderer.take().is_empty());
}

#[test]
fn test_selection_expands_and_collapses_marker() {
    let h = harness(Vec::new());
    h.store.set_case(
        "c",
        vec![LocationSample::new("home", Coordinate::new(1.0, 1.0), LocationType::Home)
            .with_title("Safe house")],
    );
    h.orchestrator.load_case("c").unwrap();
    h.renderer.take();

    h.orchestrator.select_marker(MarkerLayer::Samples, "pin:home");
    let commands = h.renderer.commands_for(MarkerLayer::Samples);
    match commands.as_slice() {
        [RenderCommand::Update { id, patch }] => {
            assert_eq!(id, "pin:home");
            assert_eq!(patch.kind, Some(MarkerKind::Text("Safe house".to_string())));
            assert_eq!(patch.visual_state, Some(VisualState::Selected));
        }
        other => panic!("unexpected commands: {:?}", other),
    }

    // Reloading keeps the expanded marker
    h.renderer.take();
    h.orchestrator.load_case("c").unwrap();
    assert!(h.renderer.take().is_empty());

    h.orchestrator.deselect_marker();
    let commands = h.renderer.commands_for(MarkerLayer::Samples);
    match commands.as_slice() {
        [RenderCommand::Update { patch, .. }] => {
            assert_eq!(patch.kind, Some(MarkerKind::Symbol("house".to_string())));
            assert_eq!(patch.visual_state, Some(VisualState::Normal));
        }
        other => panic!("unexpected commands: {:?}", other),
    }
    assert!(h.orchestrator.selected_marker().is_none());
}

// ============================================================================
// Viewport
// ============================================================================

#[tokio::test]
async fn test_contained_viewport_is_served_from_cache() {
    let h = harness(five_towers());

    let first = h.orchestrator.on_viewport_idle(bounds(0.0, 10.0), 14.0).await;
    assert!(matches!(first, IdleDecision::Fetch { .. }));
    assert_eq!(adds(&h.renderer.commands_for(MarkerLayer::Infrastructure)), 5);
    h.renderer.take();

    let second = h.orchestrator.on_viewport_idle(bounds(2.0, 5.0), 14.0).await;
    assert_eq!(second, IdleDecision::Reuse);
    assert_eq!(h.source.call_count(), 1);

    let stats = h.orchestrator.stats();
    assert_eq!(stats.cache.entry_count, 5);
    assert_eq!(stats.cache.cache_hits, 1);
    assert_eq!(stats.infrastructure_marker_count, 2);

    // t1, t7 and t9 left the viewport
    assert_eq!(removes(&h.renderer.commands_for(MarkerLayer::Infrastructure)), 3);
}

#[tokio::test]
async fn test_low_zoom_skips_fetch() {
    let h = harness(five_towers());
    let decision = h.orchestrator.on_viewport_idle(bounds(0.0, 10.0), 9.0).await;
    assert_eq!(
        decision,
        IdleDecision::Skip {
            reason: SkipReason::ZoomTooLow
        }
    );
    assert_eq!(h.source.call_count(), 0);
}

#[tokio::test]
async fn test_failed_fetch_is_retried_on_next_idle() {
    let h = harness(five_towers());
    h.source.set_failing(true);

    let decision = h.orchestrator.on_viewport_idle(bounds(0.0, 10.0), 14.0).await;
    assert!(matches!(decision, IdleDecision::Fetch { .. }));
    let stats = h.orchestrator.stats();
    assert_eq!(stats.cache.fetch_failures, 1);
    assert!(!stats.cache.has_pending);
    assert_eq!(stats.infrastructure_marker_count, 0);

    h.source.set_failing(false);
    let decision = h.orchestrator.on_viewport_idle(bounds(0.0, 10.0), 14.0).await;
    assert!(matches!(decision, IdleDecision::Fetch { .. }));
    assert_eq!(h.source.call_count(), 2);
    assert_eq!(h.orchestrator.stats().infrastructure_marker_count, 5);
}

#[tokio::test]
async fn test_layer_toggle_hides_and_restores_markers() {
    let h = harness(five_towers());
    h.orchestrator.on_viewport_idle(bounds(0.0, 10.0), 14.0).await;
    h.renderer.take();

    h.orchestrator.set_infrastructure_enabled(false);
    assert_eq!(removes(&h.renderer.commands_for(MarkerLayer::Infrastructure)), 5);
    h.renderer.take();

    let skipped = h.orchestrator.on_viewport_idle(bounds(0.0, 10.0), 14.0).await;
    assert_eq!(
        skipped,
        IdleDecision::Skip {
            reason: SkipReason::LayerDisabled
        }
    );
    assert!(h.renderer.take().is_empty());

    h.orchestrator.set_infrastructure_enabled(true);
    let decision = h.orchestrator.reevaluate_viewport().await;
    assert_eq!(decision, Some(IdleDecision::Reuse));
    assert_eq!(adds(&h.renderer.commands_for(MarkerLayer::Infrastructure)), 5);
    assert_eq!(h.source.call_count(), 1);
}

#[tokio::test]
async fn test_selecting_infrastructure_clears_sample_selection() {
    let h = harness(five_towers());
    h.store.set_case(
        "c",
        vec![LocationSample::new("w", Coordinate::new(1.0, 1.0), LocationType::Work)],
    );
    h.orchestrator.load_case("c").unwrap();
    h.orchestrator.on_viewport_idle(bounds(0.0, 10.0), 14.0).await;

    h.orchestrator.select_marker(MarkerLayer::Samples, "pin:w");
    h.orchestrator.select_marker(MarkerLayer::Infrastructure, "infra:t3");

    assert_eq!(
        h.orchestrator.selected_marker(),
        Some((MarkerLayer::Infrastructure, "infra:t3".to_string()))
    );
}

// ============================================================================
// Concurrency
// ============================================================================

/// Source whose first fetch waits until released.
struct GatedSource {
    markers: Vec<InfrastructureMarker>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    calls: AtomicU32,
}

impl MarkerSource for GatedSource {
    fn fetch<'a>(
        &'a self,
        _bounds: GeoBounds,
    ) -> BoxFuture<'a, casemap::Result<Vec<InfrastructureMarker>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        Box::pin(async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(self.markers.clone())
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_during_pending_fetch_is_deduplicated() {
    init_logging();
    let (release, gate) = oneshot::channel();
    let source = Arc::new(GatedSource {
        markers: five_towers(),
        gate: Mutex::new(Some(gate)),
        calls: AtomicU32::new(0),
    });
    let renderer = Arc::new(RecordingRenderer::new());
    let orchestrator = Arc::new(AggregationOrchestrator::new(
        Arc::new(MemorySampleStore::new()),
        source.clone(),
        renderer.clone(),
    ));

    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.on_viewport_idle(bounds(0.0, 10.0), 14.0).await })
    };
    while source.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    let second = orchestrator.on_viewport_idle(bounds(20.0, 30.0), 14.0).await;
    assert_eq!(
        second,
        IdleDecision::Skip {
            reason: SkipReason::FetchPending
        }
    );
    assert!(orchestrator.stats().cache.has_pending);

    release.send(()).unwrap();
    let first = first.await.unwrap();
    assert!(matches!(first, IdleDecision::Fetch { .. }));

    let stats = orchestrator.stats();
    assert!(!stats.cache.has_pending);
    assert_eq!(stats.cache.entry_count, 5);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    // Rendered against the last reported viewport, which holds none of the towers
    assert_eq!(stats.infrastructure_marker_count, 0);
}
