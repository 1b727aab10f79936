//! # Viewport Cache
//!
//! Bounds-indexed cache of infrastructure markers (cell towers, CCTV) fetched from an
//! external source, so panning inside an already covered region costs no network call.
//!
//! ## State machine
//!
//! | Event | Effect |
//! |-------|--------|
//! | idle, layer off or zoom too low | skip |
//! | idle, cached bounds contain viewport | reuse cache |
//! | idle, fetch pending | skip (de-duplicated) |
//! | idle, otherwise | mark pending, return a [`FetchTicket`] |
//! | success | union or replace cached bounds, merge, evict oldest, clear own ticket |
//! | failure | clear own ticket, record status, no retry |
//!
//! The caller performs the fetch. A completion only clears the pending ticket it was
//! issued with, so a stale result can still be merged without releasing a newer fetch.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::fifo_cache::FifoCache;
use crate::{CaseMapError, Coordinate, GeoBounds, Result};

// ============================================================================
// Types
// ============================================================================

/// Kind of infrastructure a marker represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InfrastructureKind {
    CellTower,
    Cctv,
}

impl InfrastructureKind {
    /// Image asset name the renderer uses for this kind.
    pub fn image_name(&self) -> &'static str {
        match self {
            InfrastructureKind::CellTower => "cell_tower",
            InfrastructureKind::Cctv => "cctv_camera",
        }
    }
}

/// A marker returned by the network collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureMarker {
    pub id: String,
    pub coordinate: Coordinate,
    pub kind: InfrastructureKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl InfrastructureMarker {
    pub fn new(id: impl Into<String>, coordinate: Coordinate, kind: InfrastructureKind) -> Self {
        Self {
            id: id.into(),
            coordinate,
            kind,
            name: String::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Configuration for the viewport cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum markers kept before the oldest-inserted are evicted.
    /// Default: 500
    pub capacity: usize,

    /// Viewports below this zoom level never fetch.
    /// Default: 13.0
    pub min_zoom: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            min_zoom: 13.0,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(CaseMapError::InvalidConfig {
                message: "cache capacity must be at least 1".to_string(),
            });
        }
        if !self.min_zoom.is_finite() {
            return Err(CaseMapError::InvalidConfig {
                message: "min_zoom must be finite".to_string(),
            });
        }
        Ok(())
    }
}

/// Handle for one issued fetch. Completion must present the same ticket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FetchTicket {
    pub sequence: u64,
    pub bounds: GeoBounds,
}

/// Why an idle event did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    LayerDisabled,
    ZoomTooLow,
    FetchPending,
}

/// Outcome of a viewport-idle evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "decision")]
pub enum IdleDecision {
    Skip { reason: SkipReason },
    /// Cache hit: cached bounds cover the viewport
    Reuse,
    /// Cache miss: caller must fetch and report back with the ticket
    Fetch { ticket: FetchTicket },
}

/// Status of the most recent fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum FetchStatus {
    Idle,
    InFlight,
    Succeeded { count: usize },
    Failed { message: String },
}

/// What a successful merge did.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Ids evicted by a disjoint jump or by the capacity limit
    pub evicted: Vec<String>,
    /// False when the result belonged to a stale ticket
    pub cleared_pending: bool,
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entry_count: u32,
    pub fetches_issued: u32,
    pub cache_hits: u32,
    pub fetch_failures: u32,
    pub has_pending: bool,
    pub cached_bounds: Option<GeoBounds>,
}

/// Marker position wrapper for R-tree spatial indexing.
#[derive(Debug, Clone)]
struct IndexedMarker {
    id: String,
    lat: f64,
    lon: f64,
}

impl RTreeObject for IndexedMarker {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lon, self.lat])
    }
}

// ============================================================================
// Viewport Cache
// ============================================================================

/// Marker cache keyed by id, covering `cached_bounds`.
///
/// Not internally synchronized: fetch completions race with new idle events, so the
/// owner must serialize access (the orchestrator keeps it behind a mutex).
#[derive(Debug)]
pub struct ViewportCache {
    config: CacheConfig,
    entries: FifoCache<String, InfrastructureMarker>,
    cached_bounds: Option<GeoBounds>,
    pending: Option<FetchTicket>,
    status: FetchStatus,
    enabled: bool,
    next_sequence: u64,

    // Spatial index for viewport queries
    spatial_index: RTree<IndexedMarker>,
    spatial_dirty: bool,

    fetches_issued: u32,
    cache_hits: u32,
    fetch_failures: u32,
}

impl ViewportCache {
    /// Create an enabled cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: FifoCache::new(config.capacity),
            config,
            cached_bounds: None,
            pending: None,
            status: FetchStatus::Idle,
            enabled: true,
            next_sequence: 0,
            spatial_index: RTree::new(),
            spatial_dirty: false,
            fetches_issued: 0,
            cache_hits: 0,
            fetch_failures: 0,
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Decide what to do when the map settles on `bounds` at `zoom`.
    pub fn on_viewport_idle(&mut self, bounds: GeoBounds, zoom: f64) -> IdleDecision {
        if !self.enabled {
            return IdleDecision::Skip {
                reason: SkipReason::LayerDisabled,
            };
        }
        if zoom < self.config.min_zoom {
            debug!(
                "[ViewportCache] Zoom {:.1} below {:.1}, skipping",
                zoom, self.config.min_zoom
            );
            return IdleDecision::Skip {
                reason: SkipReason::ZoomTooLow,
            };
        }

        if let Some(cached) = self.cached_bounds {
            if cached.contains(&bounds) && !self.entries.is_empty() {
                self.cache_hits += 1;
                debug!(
                    "[ViewportCache] Hit: {} markers cover viewport",
                    self.entries.len()
                );
                return IdleDecision::Reuse;
            }
        }

        if let Some(pending) = self.pending {
            debug!(
                "[ViewportCache] Fetch #{} still pending, skipping",
                pending.sequence
            );
            return IdleDecision::Skip {
                reason: SkipReason::FetchPending,
            };
        }

        self.next_sequence += 1;
        let ticket = FetchTicket {
            sequence: self.next_sequence,
            bounds,
        };
        self.pending = Some(ticket);
        self.status = FetchStatus::InFlight;
        self.fetches_issued += 1;
        info!("[ViewportCache] Miss: issuing fetch #{}", ticket.sequence);

        IdleDecision::Fetch { ticket }
    }

    /// Merge a successful fetch result.
    pub fn on_fetch_success(
        &mut self,
        ticket: &FetchTicket,
        markers: Vec<InfrastructureMarker>,
    ) -> MergeOutcome {
        let mut evicted = Vec::new();
        let fetched = ticket.bounds;

        match self.cached_bounds {
            Some(cached) if cached.intersects(&fetched) => {
                self.cached_bounds = Some(cached.union(&fetched));
            }
            _ => {
                if !self.entries.is_empty() {
                    debug!(
                        "[ViewportCache] Disjoint region, dropping {} markers",
                        self.entries.len()
                    );
                }
                evicted.extend(self.entries.keys().cloned());
                self.entries.clear();
                self.cached_bounds = Some(fetched);
            }
        }

        let count = markers.len();
        for marker in markers {
            self.entries.insert(marker.id.clone(), marker);
        }
        let overflow = self.entries.evict_overflow();
        if !overflow.is_empty() {
            debug!(
                "[ViewportCache] Evicted {} oldest markers (capacity {})",
                overflow.len(),
                self.entries.capacity()
            );
        }
        evicted.extend(overflow);
        self.spatial_dirty = true;

        let cleared_pending = self.release(ticket);
        if cleared_pending {
            self.status = FetchStatus::Succeeded { count };
        } else {
            debug!(
                "[ViewportCache] Merged stale fetch #{} ({} markers)",
                ticket.sequence, count
            );
        }

        MergeOutcome {
            evicted,
            cleared_pending,
        }
    }

    /// Record a failed fetch. Nothing is retried; the next idle event re-evaluates.
    pub fn on_fetch_failure(&mut self, ticket: &FetchTicket, error: &CaseMapError) -> bool {
        self.fetch_failures += 1;
        warn!("[ViewportCache] Fetch #{} failed: {}", ticket.sequence, error);
        let cleared = self.release(ticket);
        if cleared {
            self.status = FetchStatus::Failed {
                message: error.to_string(),
            };
        }
        cleared
    }

    /// Clear the pending ticket if it is `ticket`.
    fn release(&mut self, ticket: &FetchTicket) -> bool {
        match self.pending {
            Some(pending) if pending.sequence == ticket.sequence => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Enable or disable the infrastructure layer. Entries survive a toggle.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(
                "[ViewportCache] Layer {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.enabled = enabled;
    }

    /// Drop all markers and the covered region. A pending ticket stays pending.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cached_bounds = None;
        self.spatial_index = RTree::new();
        self.spatial_dirty = false;
    }

    /// Replace the configuration, evicting immediately if capacity shrank.
    pub fn set_config(&mut self, config: CacheConfig) -> Vec<String> {
        let evicted = self.entries.set_capacity(config.capacity);
        self.config = config;
        if !evicted.is_empty() {
            self.spatial_dirty = true;
        }
        evicted
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cached_bounds(&self) -> Option<GeoBounds> {
        self.cached_bounds
    }

    pub fn pending(&self) -> Option<FetchTicket> {
        self.pending
    }

    pub fn status(&self) -> &FetchStatus {
        &self.status
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains(&id.to_string())
    }

    pub fn get(&self, id: &str) -> Option<&InfrastructureMarker> {
        self.entries.get(&id.to_string())
    }

    /// All markers, oldest insertion first.
    pub fn markers(&self) -> Vec<&InfrastructureMarker> {
        self.entries.values().collect()
    }

    /// Ensure spatial index is built.
    fn ensure_spatial_index(&mut self) {
        if !self.spatial_dirty {
            return;
        }

        let indexed: Vec<IndexedMarker> = self
            .entries
            .values()
            .map(|m| IndexedMarker {
                id: m.id.clone(),
                lat: m.coordinate.latitude,
                lon: m.coordinate.longitude,
            })
            .collect();

        self.spatial_index = RTree::bulk_load(indexed);
        self.spatial_dirty = false;
    }

    /// Cached markers located inside `bounds`, oldest insertion first.
    pub fn markers_in(&mut self, bounds: &GeoBounds) -> Vec<&InfrastructureMarker> {
        self.ensure_spatial_index();

        let mut hits: Vec<&InfrastructureMarker> = self
            .spatial_index
            .locate_in_envelope(&bounds.envelope())
            .filter_map(|m| self.entries.get(&m.id))
            .collect();
        hits.sort_by_key(|m| self.entries.insertion_order(&m.id));
        hits
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.entries.len() as u32,
            fetches_issued: self.fetches_issued,
            cache_hits: self.cache_hits,
            fetch_failures: self.fetch_failures,
            has_pending: self.pending.is_some(),
            cached_bounds: self.cached_bounds,
        }
    }
}

impl Default for ViewportCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ZOOM: f64 = 15.0;

    fn b(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> GeoBounds {
        GeoBounds::new(min_lat, min_lon, max_lat, max_lon).unwrap()
    }

    fn tower(id: &str, lat: f64, lon: f64) -> InfrastructureMarker {
        InfrastructureMarker::new(id, Coordinate::new(lat, lon), InfrastructureKind::CellTower)
    }

    fn fetch_ticket(decision: IdleDecision) -> FetchTicket {
        match decision {
            IdleDecision::Fetch { ticket } => ticket,
            other => panic!("expected fetch, got {:?}", other),
        }
    }

    /// Cache holding bounds [0,0]-[10,10] with 5 entries.
    fn primed_cache() -> ViewportCache {
        let mut cache = ViewportCache::default();
        let ticket = fetch_ticket(cache.on_viewport_idle(b(0.0, 0.0, 10.0, 10.0), ZOOM));
        let markers = (0..5).map(|i| tower(&format!("t{}", i), i as f64, i as f64)).collect();
        cache.on_fetch_success(&ticket, markers);
        cache
    }

    #[test]
    fn test_contained_viewport_reuses_cache() {
        let mut cache = primed_cache();
        assert_eq!(cache.stats().fetches_issued, 1);

        let decision = cache.on_viewport_idle(b(2.0, 2.0, 5.0, 5.0), ZOOM);
        assert_eq!(decision, IdleDecision::Reuse);
        assert_eq!(cache.stats().fetches_issued, 1);
        assert_eq!(cache.len(), 5);

        // Equal bounds also hit
        assert_eq!(
            cache.on_viewport_idle(b(0.0, 0.0, 10.0, 10.0), ZOOM),
            IdleDecision::Reuse
        );
    }

    #[test]
    fn test_disabled_layer_and_low_zoom_skip() {
        let mut cache = ViewportCache::default();
        assert_eq!(
            cache.on_viewport_idle(b(0.0, 0.0, 1.0, 1.0), 5.0),
            IdleDecision::Skip {
                reason: SkipReason::ZoomTooLow
            }
        );

        cache.set_enabled(false);
        assert_eq!(
            cache.on_viewport_idle(b(0.0, 0.0, 1.0, 1.0), ZOOM),
            IdleDecision::Skip {
                reason: SkipReason::LayerDisabled
            }
        );
        assert!(cache.pending().is_none());
        assert_eq!(cache.stats().fetches_issued, 0);
    }

    #[test]
    fn test_pending_fetch_deduplicates() {
        let mut cache = ViewportCache::default();
        let ticket = fetch_ticket(cache.on_viewport_idle(b(0.0, 0.0, 1.0, 1.0), ZOOM));
        assert_eq!(cache.status(), &FetchStatus::InFlight);

        assert_eq!(
            cache.on_viewport_idle(b(5.0, 5.0, 6.0, 6.0), ZOOM),
            IdleDecision::Skip {
                reason: SkipReason::FetchPending
            }
        );

        cache.on_fetch_success(&ticket, vec![tower("a", 0.5, 0.5)]);
        assert!(cache.pending().is_none());
        assert_eq!(cache.status(), &FetchStatus::Succeeded { count: 1 });

        // Next miss issues a new fetch
        let next = fetch_ticket(cache.on_viewport_idle(b(5.0, 5.0, 6.0, 6.0), ZOOM));
        assert!(next.sequence > ticket.sequence);
    }

    #[test]
    fn test_empty_cache_with_bounds_still_fetches() {
        let mut cache = ViewportCache::default();
        let ticket = fetch_ticket(cache.on_viewport_idle(b(0.0, 0.0, 10.0, 10.0), ZOOM));
        cache.on_fetch_success(&ticket, vec![]);

        let decision = cache.on_viewport_idle(b(1.0, 1.0, 2.0, 2.0), ZOOM);
        assert!(matches!(decision, IdleDecision::Fetch { .. }));
    }

    #[test]
    fn test_overlapping_fetch_unions_bounds() {
        let mut cache = primed_cache();
        let ticket = fetch_ticket(cache.on_viewport_idle(b(8.0, 8.0, 12.0, 12.0), ZOOM));
        let outcome = cache.on_fetch_success(&ticket, vec![tower("far", 11.0, 11.0)]);

        assert!(outcome.evicted.is_empty());
        assert_eq!(cache.cached_bounds(), Some(b(0.0, 0.0, 12.0, 12.0)));
        assert_eq!(cache.len(), 6);
    }

    #[test]
    fn test_disjoint_fetch_replaces_cache() {
        let mut cache = primed_cache();
        let ticket = fetch_ticket(cache.on_viewport_idle(b(40.0, 40.0, 41.0, 41.0), ZOOM));
        let outcome = cache.on_fetch_success(&ticket, vec![tower("x", 40.5, 40.5)]);

        assert_eq!(outcome.evicted.len(), 5);
        assert_eq!(cache.cached_bounds(), Some(b(40.0, 40.0, 41.0, 41.0)));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("x"));
    }

    #[test]
    fn test_capacity_evicts_exactly_oldest() {
        let mut cache = ViewportCache::new(CacheConfig {
            capacity: 4,
            ..Default::default()
        });
        let ticket = fetch_ticket(cache.on_viewport_idle(b(0.0, 0.0, 10.0, 10.0), ZOOM));
        let markers = (0..7).map(|i| tower(&format!("m{}", i), 1.0, 1.0)).collect();
        let outcome = cache.on_fetch_success(&ticket, markers);

        assert_eq!(outcome.evicted, vec!["m0", "m1", "m2"]);
        assert_eq!(cache.len(), 4);
        for i in 3..7 {
            assert!(cache.contains(&format!("m{}", i)));
        }
    }

    #[test]
    fn test_refetched_ids_move_to_back() {
        let mut cache = ViewportCache::new(CacheConfig {
            capacity: 3,
            ..Default::default()
        });
        let first = fetch_ticket(cache.on_viewport_idle(b(0.0, 0.0, 5.0, 5.0), ZOOM));
        cache.on_fetch_success(
            &first,
            vec![tower("a", 1.0, 1.0), tower("b", 1.0, 1.0), tower("c", 1.0, 1.0)],
        );

        let second = fetch_ticket(cache.on_viewport_idle(b(4.0, 4.0, 9.0, 9.0), ZOOM));
        let mut refreshed = tower("a", 1.5, 1.5);
        refreshed.name = "updated".to_string();
        let outcome = cache.on_fetch_success(&second, vec![refreshed, tower("d", 6.0, 6.0)]);

        // "a" was refreshed, so "b" is now the oldest
        assert_eq!(outcome.evicted, vec!["b"]);
        assert_eq!(cache.get("a").unwrap().name, "updated");
    }

    #[test]
    fn test_failure_clears_pending_without_retry() {
        let mut cache = ViewportCache::default();
        let ticket = fetch_ticket(cache.on_viewport_idle(b(0.0, 0.0, 1.0, 1.0), ZOOM));

        assert!(cache.on_fetch_failure(&ticket, &CaseMapError::fetch("offline")));
        assert!(cache.pending().is_none());
        assert!(matches!(cache.status(), FetchStatus::Failed { .. }));
        assert_eq!(cache.stats().fetch_failures, 1);
        assert_eq!(cache.stats().fetches_issued, 1);

        // Re-evaluation happens on the next idle event
        assert!(matches!(
            cache.on_viewport_idle(b(0.0, 0.0, 1.0, 1.0), ZOOM),
            IdleDecision::Fetch { .. }
        ));
    }

    #[test]
    fn test_stale_completion_keeps_newer_pending() {
        let mut cache = ViewportCache::default();
        let first = fetch_ticket(cache.on_viewport_idle(b(0.0, 0.0, 1.0, 1.0), ZOOM));
        cache.on_fetch_failure(&first, &CaseMapError::fetch("timeout"));
        let second = fetch_ticket(cache.on_viewport_idle(b(0.0, 0.0, 2.0, 2.0), ZOOM));

        // The first request's data arrives late anyway
        let outcome = cache.on_fetch_success(&first, vec![tower("late", 0.5, 0.5)]);
        assert!(!outcome.cleared_pending);
        assert_eq!(cache.pending(), Some(second));
        assert!(cache.contains("late"));

        let outcome = cache.on_fetch_success(&second, vec![]);
        assert!(outcome.cleared_pending);
        assert!(cache.pending().is_none());
    }

    #[test]
    fn test_markers_in_viewport() {
        let mut cache = primed_cache();
        let visible: Vec<&str> = cache
            .markers_in(&b(1.0, 1.0, 3.0, 3.0))
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(visible, vec!["t1", "t2", "t3"]);

        cache.clear();
        assert!(cache.markers_in(&b(0.0, 0.0, 10.0, 10.0)).is_empty());
        assert!(cache.cached_bounds().is_none());
    }

    #[test]
    fn test_toggle_keeps_entries() {
        let mut cache = primed_cache();
        cache.set_enabled(false);
        assert_eq!(cache.len(), 5);
        cache.set_enabled(true);
        assert_eq!(
            cache.on_viewport_idle(b(1.0, 1.0, 2.0, 2.0), ZOOM),
            IdleDecision::Reuse
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig {
            capacity: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
