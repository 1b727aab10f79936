//! Visit frequency counting.
//!
//! Two families of counts are computed over the same time-sorted sample set:
//!
//! | Family | Counts | Used for |
//! |--------|--------|----------|
//! | run-based | transitions *into* a key (repeats ignored) | visit counts |
//! | raw | every sample | stay counts |
//!
//! Each family can be keyed by rounded coordinate or by normalized address. The two
//! keyings are separate partitions of "the same place" and are not reconciled: map
//! markers show coordinate-keyed counts while rankings use address-keyed ones.
//!
//! Samples without a timestamp are still counted. They sort ahead of every timed sample,
//! keeping their input order, so run-based counts stay deterministic.

use std::collections::HashMap;
use std::hash::Hash;

use serde::Serialize;

use crate::{Coordinate, LocationSample, LocationType};

/// Label used for samples whose address is missing or blank.
pub const UNKNOWN_ADDRESS: &str = "Unknown Location";

/// Highest supported rounding precision (keeps scaled values inside i64).
pub const MAX_PRECISION: u32 = 9;

/// Coordinate rounded to a fixed number of decimal places.
///
/// Stored as scaled integers so keys hash and compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CoordinateKey {
    lat_e: i64,
    lon_e: i64,
    precision: u32,
}

impl CoordinateKey {
    pub fn new(coordinate: &Coordinate, precision: u32) -> Self {
        let precision = precision.min(MAX_PRECISION);
        let scale = 10f64.powi(precision as i32);
        Self {
            lat_e: (coordinate.latitude * scale).round() as i64,
            lon_e: (coordinate.longitude * scale).round() as i64,
            precision,
        }
    }

    /// The rounded coordinate.
    pub fn coordinate(&self) -> Coordinate {
        let scale = 10f64.powi(self.precision as i32);
        Coordinate::new(self.lat_e as f64 / scale, self.lon_e as f64 / scale)
    }

    /// `"lat,lon"` with the key's precision.
    pub fn label(&self) -> String {
        let c = self.coordinate();
        let p = self.precision as usize;
        format!("{:.p$},{:.p$}", c.latitude, c.longitude, p = p)
    }
}

/// Count for one rounded coordinate plus the mean position of its samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinateFrequency {
    pub key: CoordinateKey,
    pub count: u32,
    /// Mean lat/lon over every sample that mapped to this key
    pub centroid: Coordinate,
    pub sample_count: u32,
}

/// Trim an address; blank or missing becomes [`UNKNOWN_ADDRESS`].
pub fn normalize_address(address: Option<&str>) -> String {
    match address.map(str::trim) {
        Some(a) if !a.is_empty() => a.to_string(),
        _ => UNKNOWN_ADDRESS.to_string(),
    }
}

/// Keep only samples of one location type.
pub fn filter_by_type(
    samples: &[LocationSample],
    location_type: LocationType,
) -> Vec<LocationSample> {
    samples
        .iter()
        .filter(|s| s.location_type == location_type)
        .cloned()
        .collect()
}

/// All samples, stable-sorted ascending by timestamp. Untimed samples come first, in input
/// order.
pub(crate) fn time_sorted(samples: &[LocationSample]) -> Vec<&LocationSample> {
    let mut sorted: Vec<&LocationSample> = samples.iter().collect();
    sorted.sort_by_key(|s| s.received_at);
    sorted
}

/// Ordered tally: keys keep first-seen order.
struct Tally<K> {
    index: HashMap<K, usize>,
    entries: Vec<(K, u32)>,
}

impl<K: Eq + Hash + Clone> Tally<K> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Slot for `key`, created with a zero count on first sight.
    fn slot(&mut self, key: &K) -> usize {
        if let Some(&i) = self.index.get(key) {
            return i;
        }
        let i = self.entries.len();
        self.entries.push((key.clone(), 0));
        self.index.insert(key.clone(), i);
        i
    }

    fn into_entries(self) -> Vec<(K, u32)> {
        self.entries
    }
}

fn count_runs<K: Eq + Hash + Clone>(keys: impl Iterator<Item = K>) -> Vec<(K, u32)> {
    let mut tally = Tally::new();
    let mut previous: Option<K> = None;
    for key in keys {
        let slot = tally.slot(&key);
        if previous.as_ref() != Some(&key) {
            tally.entries[slot].1 += 1;
        }
        previous = Some(key);
    }
    tally.into_entries()
}

fn count_raw<K: Eq + Hash + Clone>(keys: impl Iterator<Item = K>) -> Vec<(K, u32)> {
    let mut tally = Tally::new();
    for key in keys {
        let slot = tally.slot(&key);
        tally.entries[slot].1 += 1;
    }
    tally.into_entries()
}

/// Attach running centroids to coordinate-keyed counts.
fn with_centroids(
    counts: Vec<(CoordinateKey, u32)>,
    sorted: &[&LocationSample],
    precision: u32,
) -> Vec<CoordinateFrequency> {
    let mut sums: HashMap<CoordinateKey, (f64, f64, u32)> = HashMap::new();
    for sample in sorted {
        let key = CoordinateKey::new(&sample.coordinate, precision);
        let entry = sums.entry(key).or_insert((0.0, 0.0, 0));
        entry.0 += sample.coordinate.latitude;
        entry.1 += sample.coordinate.longitude;
        entry.2 += 1;
    }

    counts
        .into_iter()
        .map(|(key, count)| {
            let (lat_sum, lon_sum, n) = sums.get(&key).copied().unwrap_or((0.0, 0.0, 0));
            let centroid = if n > 0 {
                Coordinate::new(lat_sum / n as f64, lon_sum / n as f64)
            } else {
                key.coordinate()
            };
            CoordinateFrequency {
                key,
                count,
                centroid,
                sample_count: n,
            }
        })
        .collect()
}

/// Visits per rounded coordinate: consecutive samples at the same key count once.
pub fn run_frequency_by_coordinate(
    samples: &[LocationSample],
    precision: u32,
) -> Vec<CoordinateFrequency> {
    let sorted = time_sorted(samples);
    let counts = count_runs(
        sorted
            .iter()
            .map(|s| CoordinateKey::new(&s.coordinate, precision)),
    );
    with_centroids(counts, &sorted, precision)
}

/// Samples per rounded coordinate.
pub fn raw_frequency_by_coordinate(
    samples: &[LocationSample],
    precision: u32,
) -> Vec<CoordinateFrequency> {
    let sorted = time_sorted(samples);
    let counts = count_raw(
        sorted
            .iter()
            .map(|s| CoordinateKey::new(&s.coordinate, precision)),
    );
    with_centroids(counts, &sorted, precision)
}

/// Visits per normalized address, in first-seen chronological order.
pub fn run_frequency_by_address(samples: &[LocationSample]) -> Vec<(String, u32)> {
    count_runs(
        time_sorted(samples)
            .into_iter()
            .map(|s| normalize_address(s.address.as_deref())),
    )
}

/// Samples per normalized address, in first-seen chronological order.
pub fn raw_frequency_by_address(samples: &[LocationSample]) -> Vec<(String, u32)> {
    count_raw(
        time_sorted(samples)
            .into_iter()
            .map(|s| normalize_address(s.address.as_deref())),
    )
}
