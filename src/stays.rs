//! Stay grouping.
//!
//! A stay is a maximal run of chronologically adjacent samples that share one address
//! string. Samples without an address cannot be placed and are skipped. Samples without a
//! timestamp sort ahead of the timed ones, keeping their input order.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::Serialize;

use crate::clock::Clock;
use crate::{AggregationConfig, LocationSample};

/// Contiguous run of samples at one address.
///
/// `start_time` and `end_time` are the first and last member timestamps; both are `None`
/// for a stay made only of untimed samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stay {
    pub address: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Members in chronological order
    pub samples: Vec<LocationSample>,
}

impl Stay {
    /// `end - start`, zero when either end is unknown.
    pub fn duration(&self) -> Duration {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => end - start,
            _ => Duration::zero(),
        }
    }

    /// True while the last sample is younger than `config.ongoing_threshold_minutes`.
    pub fn is_ongoing(&self, clock: &dyn Clock, config: &AggregationConfig) -> bool {
        self.is_ongoing_within(clock, config.ongoing_threshold())
    }

    pub fn is_ongoing_within(&self, clock: &dyn Clock, threshold: Duration) -> bool {
        self.end_time.is_some_and(|end| clock.now() - end < threshold)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn extend(&mut self, sample: &LocationSample) {
        if let Some(time) = sample.received_at {
            self.start_time.get_or_insert(time);
            self.end_time = Some(time);
        }
        self.samples.push(sample.clone());
    }
}

/// Group samples into stays.
///
/// Input order does not matter; samples are stable-sorted by timestamp so equal
/// timestamps keep their relative order.
pub fn group_stays(samples: &[LocationSample]) -> Vec<Stay> {
    let mut placed: Vec<(&LocationSample, &str)> = samples
        .iter()
        .filter_map(|s| Some((s, s.usable_address()?)))
        .collect();

    let skipped = samples.len() - placed.len();
    if skipped > 0 {
        debug!("[StayGrouper] Skipped {} samples without address", skipped);
    }

    placed.sort_by_key(|(sample, _)| sample.received_at);

    let mut stays: Vec<Stay> = Vec::new();
    let mut open: Option<Stay> = None;

    for (sample, address) in placed {
        match open.as_mut() {
            Some(stay) if stay.address == address => stay.extend(sample),
            _ => {
                if let Some(done) = open.take() {
                    stays.push(done);
                }
                let mut stay = Stay {
                    address: address.to_string(),
                    start_time: None,
                    end_time: None,
                    samples: Vec::new(),
                };
                stay.extend(sample);
                open = Some(stay);
            }
        }
    }

    if let Some(done) = open {
        stays.push(done);
    }

    stays
}
