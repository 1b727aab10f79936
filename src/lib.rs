//! # Casemap
//!
//! Aggregation and cache engine for a field-investigation map.
//!
//! This library provides:
//! - Stay grouping of time-stamped positional samples
//! - Run-based and raw visit frequencies keyed by rounded coordinate or address
//! - Dense hour-by-weekday time series and top-N rankings for charting
//! - A viewport-bounds-indexed cache of fetched infrastructure markers
//! - Marker reconciliation into minimal add/update/remove render commands
//!
//! ## Features
//!
//! - **`parallel`** - Build per-address grids in parallel with rayon
//! - **`http`** - Enable the Overpass HTTP marker source
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use casemap::{group_stays, Coordinate, LocationSample, LocationType};
//! use chrono::{TimeZone, Utc};
//!
//! let at = |h| Utc.with_ymd_and_hms(2024, 3, 4, h, 0, 0).unwrap();
//! let samples = vec![
//!     LocationSample::new("1", Coordinate::new(51.5, -0.12), LocationType::CellTower)
//!         .with_address("Main St 1")
//!         .with_time(at(9)),
//!     LocationSample::new("2", Coordinate::new(51.5, -0.12), LocationType::CellTower)
//!         .with_address("Main St 1")
//!         .with_time(at(10)),
//! ];
//!
//! let stays = group_stays(&samples);
//! assert_eq!(stays.len(), 1);
//! assert_eq!(stays[0].duration().num_hours(), 1);
//! ```

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{CaseMapError, OptionExt, Result};

// Lat/lon rectangles
pub mod bounds;
pub use bounds::GeoBounds;

// Injectable time source
pub mod clock;
pub use clock::{Clock, FixedClock, SystemClock};

// Stay grouping
pub mod stays;
pub use stays::{group_stays, Stay};

// Visit frequency counting
pub mod frequency;
pub use frequency::{
    filter_by_type, normalize_address, raw_frequency_by_address, raw_frequency_by_coordinate,
    run_frequency_by_address, run_frequency_by_coordinate, CoordinateFrequency, CoordinateKey,
    UNKNOWN_ADDRESS,
};

// Rankings and hourly grids
pub mod timeseries;
pub use timeseries::{
    analyze, build_hourly_grid, build_hourly_grids, rank_addresses, summarize_grid,
    AddressRanking, HourlyBucket, RankingMetric, TimeSeriesReport,
};

// FIFO cache for marker payloads
pub mod fifo_cache;
pub use fifo_cache::FifoCache;

// Viewport marker cache
pub mod viewport_cache;
pub use viewport_cache::{
    CacheConfig, CacheStats, FetchStatus, FetchTicket, IdleDecision, InfrastructureKind,
    InfrastructureMarker, SkipReason, ViewportCache,
};

// Marker diffing
pub mod reconciler;
pub use reconciler::{
    MarkerColor, MarkerKind, MarkerModel, MarkerPatch, MarkerRecord, MarkerReconciler,
    RenderCommand, VisualState,
};

// External collaborator seams
pub mod collaborators;
pub use collaborators::{
    MarkerLayer, MarkerRenderer, MarkerSource, MemorySampleStore, RecordingRenderer,
    SampleStore, StaticMarkerSource,
};

// Event wiring and the global singleton
pub mod orchestrator;
pub use orchestrator::{
    build_case_analysis, install_orchestrator, with_orchestrator, AggregationOrchestrator,
    CaseAnalysis, OrchestratorConfig, OrchestratorStats, ORCHESTRATOR,
};

// HTTP marker source
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::OverpassMarkerSource;

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("CasemapRust"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use casemap::Coordinate;
/// let point = Coordinate::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Create a new coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Where a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocationType {
    /// Ping resolved from a cell-tower record
    CellTower,
    /// User-placed home pin
    Home,
    /// User-placed work pin
    Work,
    /// Any other user-placed pin
    Custom,
}

impl LocationType {
    /// Symbol name the renderer uses for a pin of this type.
    pub fn symbol_name(&self) -> &'static str {
        match self {
            LocationType::CellTower => "antenna",
            LocationType::Home => "house",
            LocationType::Work => "briefcase",
            LocationType::Custom => "mappin",
        }
    }
}

/// A single positional sample belonging to a case.
///
/// Owned by the persistence collaborator; every pass in this crate only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub id: String,
    pub coordinate: Coordinate,
    /// Reverse-geocoded or user-entered address
    pub address: Option<String>,
    pub location_type: LocationType,
    /// When the ping was received (pins may not have one)
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub note: String,
    pub color_tag: Option<String>,
}

impl LocationSample {
    /// Create a sample with no address, timestamp or annotations.
    pub fn new(id: impl Into<String>, coordinate: Coordinate, location_type: LocationType) -> Self {
        Self {
            id: id.into(),
            coordinate,
            address: None,
            location_type,
            received_at: None,
            title: String::new(),
            note: String::new(),
            color_tag: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_time(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_color(mut self, color_tag: impl Into<String>) -> Self {
        self.color_tag = Some(color_tag.into());
        self
    }

    /// The address if present and not blank.
    pub fn usable_address(&self) -> Option<&str> {
        self.address.as_deref().filter(|a| !a.trim().is_empty())
    }
}

/// Configuration for the aggregation passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Decimal places kept when keying by coordinate.
    /// Default: 6 (~0.11 m at the equator)
    pub coordinate_precision: u32,

    /// Assumed minutes represented by one sample when ranking by duration.
    /// Default: 5
    pub interval_minutes: u32,

    /// Number of addresses kept by the rankings.
    /// Default: 3
    pub top_n: usize,

    /// Maximum number of calendar weeks in an hourly grid.
    /// Default: 4
    pub max_weeks: u32,

    /// A stay is ongoing while its last sample is younger than this.
    /// Default: 10 minutes
    pub ongoing_threshold_minutes: i64,

    /// Location type counted by the coordinate-keyed frequency tables.
    /// Default: CellTower
    pub trackable_type: LocationType,

    /// First day of a calendar week.
    /// Default: Monday
    pub week_start: Weekday,

    /// Fixed offset used to place samples on local weekdays and hours.
    /// Default: 0 (UTC)
    pub utc_offset_seconds: i32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            coordinate_precision: 6,
            interval_minutes: 5,
            top_n: 3,
            max_weeks: 4,
            ongoing_threshold_minutes: 10,
            trackable_type: LocationType::CellTower,
            week_start: Weekday::Mon,
            utc_offset_seconds: 0,
        }
    }
}

impl AggregationConfig {
    /// How recent a stay's last sample must be for the stay to count as ongoing.
    pub fn ongoing_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ongoing_threshold_minutes)
    }

    /// Reject values the aggregation passes cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.coordinate_precision > frequency::MAX_PRECISION {
            return Err(CaseMapError::InvalidConfig {
                message: format!(
                    "coordinate_precision {} exceeds {}",
                    self.coordinate_precision,
                    frequency::MAX_PRECISION
                ),
            });
        }
        if self.max_weeks == 0 {
            return Err(CaseMapError::InvalidConfig {
                message: "max_weeks must be at least 1".to_string(),
            });
        }
        if self.ongoing_threshold_minutes < 0 {
            return Err(CaseMapError::InvalidConfig {
                message: "ongoing_threshold_minutes must not be negative".to_string(),
            });
        }
        self.local_offset()
            .ok_or_config("utc_offset_seconds must be within one day")?;
        Ok(())
    }

    /// The configured fixed offset, if in range.
    pub fn local_offset(&self) -> Option<chrono::FixedOffset> {
        chrono::FixedOffset::east_opt(self.utc_offset_seconds)
    }
}

// ============================================================================
// Tests
// ============================================================================
