//! Address rankings and hour-by-weekday time series.
//!
//! Charts downstream expect fixed-length series, so every grid produced here is dense:
//! `weeks × 7 × 24` buckets per address, zero-filled where nothing was seen.
//!
//! ## Example
//! ```rust
//! use casemap::{analyze, AggregationConfig, Coordinate, LocationSample, LocationType};
//! use chrono::{TimeZone, Utc};
//!
//! let samples: Vec<LocationSample> = (0..6)
//!     .map(|i| {
//!         let point = Coordinate::new(51.5, -0.12);
//!         LocationSample::new(i.to_string(), point, LocationType::CellTower)
//!             .with_address("Main St 1")
//!             .with_time(Utc.with_ymd_and_hms(2024, 3, 5, 14, i * 5, 0).unwrap())
//!     })
//!     .collect();
//!
//! let report = analyze(&samples, &AggregationConfig::default());
//! assert_eq!(report.grids[0].buckets.len(), 7 * 24);
//! println!("{}", report.grids[0].summary.as_deref().unwrap_or("no data"));
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike, Utc, Weekday};
use serde::Serialize;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::frequency::{normalize_address, run_frequency_by_address, time_sorted};
use crate::{AggregationConfig, Coordinate, LocationSample};

const HOURS_PER_DAY: usize = 24;
const DAYS_PER_WEEK: usize = 7;

/// What a ranking orders by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RankingMetric {
    /// `sample_count × interval_minutes`
    Duration,
    /// Run-based visit count
    Frequency,
}

/// One ranked address.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRanking {
    pub address: String,
    pub sample_count: u32,
    pub total_minutes: u64,
    pub centroid: Coordinate,
    pub visit_count: u32,
}

/// Count of samples at one address in one hour of one week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyBucket {
    /// 1-based week number within the analysis window
    pub week_index: u32,
    pub weekday: Weekday,
    /// 0-23, local to the configured offset
    pub hour: u32,
    pub count: u32,
}

/// Grid and summary for one address.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressGrid {
    pub address: String,
    pub buckets: Vec<HourlyBucket>,
    pub summary: Option<String>,
}

/// Everything the charts need for one case.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesReport {
    pub by_duration: Vec<AddressRanking>,
    pub by_frequency: Vec<AddressRanking>,
    /// Number of weeks covered by every grid
    pub weeks: u32,
    /// Grids for the duration top-N, in ranking order
    pub grids: Vec<AddressGrid>,
}

/// Rank addresses by total time or by visit count and keep the top `config.top_n`.
///
/// Ties keep the order in which addresses first appear chronologically.
pub fn rank_addresses(
    samples: &[LocationSample],
    metric: RankingMetric,
    config: &AggregationConfig,
) -> Vec<AddressRanking> {
    let sorted = time_sorted(samples);

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut rankings: Vec<AddressRanking> = Vec::new();
    let mut sums: Vec<(f64, f64)> = Vec::new();

    for sample in &sorted {
        let address = normalize_address(sample.address.as_deref());
        let i = *index.entry(address.clone()).or_insert_with(|| {
            rankings.push(AddressRanking {
                address,
                sample_count: 0,
                total_minutes: 0,
                centroid: sample.coordinate,
                visit_count: 0,
            });
            sums.push((0.0, 0.0));
            rankings.len() - 1
        });
        rankings[i].sample_count += 1;
        sums[i].0 += sample.coordinate.latitude;
        sums[i].1 += sample.coordinate.longitude;
    }

    let visits: HashMap<String, u32> = run_frequency_by_address(samples).into_iter().collect();

    for (ranking, (lat_sum, lon_sum)) in rankings.iter_mut().zip(sums) {
        let n = ranking.sample_count as f64;
        ranking.centroid = Coordinate::new(lat_sum / n, lon_sum / n);
        ranking.total_minutes = ranking.sample_count as u64 * config.interval_minutes as u64;
        ranking.visit_count = visits.get(&ranking.address).copied().unwrap_or(0);
    }

    // sort_by is stable, so equal keys keep first-seen order
    match metric {
        RankingMetric::Duration => rankings.sort_by(|a, b| b.total_minutes.cmp(&a.total_minutes)),
        RankingMetric::Frequency => rankings.sort_by(|a, b| b.visit_count.cmp(&a.visit_count)),
    }
    rankings.truncate(config.top_n);
    rankings
}

/// Calendar window shared by every grid of one analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AnalysisWindow {
    base_week_start: NaiveDate,
    weeks: u32,
    offset: FixedOffset,
    week_start: Weekday,
}

impl AnalysisWindow {
    /// Window starting at the week of the earliest sample. `None` without timed samples.
    fn from_samples(samples: &[LocationSample], config: &AggregationConfig) -> Option<Self> {
        let offset = config.local_offset()?;
        let times = samples.iter().filter_map(|s| s.received_at);
        let earliest = times.clone().min()?;
        let latest = times.max()?;

        let first_day = earliest.with_timezone(&offset).date_naive();
        let back = days_into_week(first_day.weekday(), config.week_start);
        let base_week_start = first_day - chrono::Duration::days(back as i64);

        let last_day = latest.with_timezone(&offset).date_naive();
        let spanned = ((last_day - base_week_start).num_days() / DAYS_PER_WEEK as i64) as u32 + 1;

        Some(Self {
            base_week_start,
            weeks: spanned.min(config.max_weeks.max(1)),
            offset,
            week_start: config.week_start,
        })
    }

    fn bucket_count(&self) -> usize {
        self.weeks as usize * DAYS_PER_WEEK * HOURS_PER_DAY
    }

    /// Flat grid index for a timestamp, `None` if past the last week.
    fn cell(&self, time: DateTime<Utc>) -> Option<usize> {
        let local = time.with_timezone(&self.offset);
        let days = (local.date_naive() - self.base_week_start).num_days();
        if days < 0 {
            return None;
        }
        let week_index = (days / DAYS_PER_WEEK as i64) as u32 + 1;
        if week_index > self.weeks {
            return None;
        }
        let day = days_into_week(local.weekday(), self.week_start) as usize;
        let hour = local.hour() as usize;
        Some(((week_index as usize - 1) * DAYS_PER_WEEK + day) * HOURS_PER_DAY + hour)
    }

    fn empty_grid(&self) -> Vec<HourlyBucket> {
        let mut buckets = Vec::with_capacity(self.bucket_count());
        for week_index in 1..=self.weeks {
            let mut weekday = self.week_start;
            for _ in 0..DAYS_PER_WEEK {
                for hour in 0..HOURS_PER_DAY as u32 {
                    buckets.push(HourlyBucket {
                        week_index,
                        weekday,
                        hour,
                        count: 0,
                    });
                }
                weekday = weekday.succ();
            }
        }
        buckets
    }
}

/// Days from `week_start` to `day`, 0..=6.
fn days_into_week(day: Weekday, week_start: Weekday) -> u32 {
    (day.num_days_from_monday() + 7 - week_start.num_days_from_monday()) % 7
}

fn fill_grid(
    window: &AnalysisWindow,
    cells: &[(String, usize)],
    address: &str,
) -> Vec<HourlyBucket> {
    let mut grid = window.empty_grid();
    for (_, cell) in cells.iter().filter(|(a, _)| a == address) {
        grid[*cell].count += 1;
    }
    grid
}

fn locate_samples(samples: &[LocationSample], window: &AnalysisWindow) -> Vec<(String, usize)> {
    samples
        .iter()
        .filter_map(|s| {
            let cell = window.cell(s.received_at?)?;
            Some((normalize_address(s.address.as_deref()), cell))
        })
        .collect()
}

/// Dense grid for one address. The window is derived from all `samples`, so grids for
/// different addresses of the same case line up.
pub fn build_hourly_grid(
    samples: &[LocationSample],
    address: &str,
    config: &AggregationConfig,
) -> Vec<HourlyBucket> {
    match AnalysisWindow::from_samples(samples, config) {
        Some(window) => {
            let cells = locate_samples(samples, &window);
            fill_grid(&window, &cells, &normalize_address(Some(address)))
        }
        None => Vec::new(),
    }
}

/// Dense grids for several addresses over one shared window, in the given order.
pub fn build_hourly_grids(
    samples: &[LocationSample],
    addresses: &[String],
    config: &AggregationConfig,
) -> Vec<(String, Vec<HourlyBucket>)> {
    let Some(window) = AnalysisWindow::from_samples(samples, config) else {
        return Vec::new();
    };
    let cells = locate_samples(samples, &window);

    #[cfg(feature = "parallel")]
    let grids = addresses
        .par_iter()
        .map(|a| (a.clone(), fill_grid(&window, &cells, &normalize_address(Some(a)))))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let grids = addresses
        .iter()
        .map(|a| (a.clone(), fill_grid(&window, &cells, &normalize_address(Some(a)))))
        .collect();

    grids
}

/// One sentence describing the busiest hour of the most recent active week.
///
/// Ties resolve to the first maximum in grid order. `None` if the grid is all zeros.
pub fn summarize_grid(address: &str, grid: &[HourlyBucket]) -> Option<String> {
    let latest_week = grid
        .iter()
        .filter(|b| b.count > 0)
        .map(|b| b.week_index)
        .max()?;

    let mut best: Option<&HourlyBucket> = None;
    for bucket in grid.iter().filter(|b| b.week_index == latest_week) {
        if best.map_or(true, |current| bucket.count > current.count) {
            best = Some(bucket);
        }
    }
    let best = best?;

    Some(format!(
        "{} is most active on {} between {:02}:00 and {:02}:00 (week {})",
        address,
        weekday_name(best.weekday),
        best.hour,
        (best.hour + 1) % 24,
        best.week_index
    ))
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Rankings, grids for the duration top-N and their summaries.
pub fn analyze(samples: &[LocationSample], config: &AggregationConfig) -> TimeSeriesReport {
    let by_duration = rank_addresses(samples, RankingMetric::Duration, config);
    let by_frequency = rank_addresses(samples, RankingMetric::Frequency, config);

    let addresses: Vec<String> = by_duration.iter().map(|r| r.address.clone()).collect();
    let grids: Vec<AddressGrid> = build_hourly_grids(samples, &addresses, config)
        .into_iter()
        .map(|(address, buckets)| {
            let summary = summarize_grid(&address, &buckets);
            AddressGrid {
                address,
                buckets,
                summary,
            }
        })
        .collect();

    let weeks = AnalysisWindow::from_samples(samples, config)
        .map(|w| w.weeks)
        .unwrap_or(0);

    TimeSeriesReport {
        by_duration,
        by_frequency,
        weeks,
        grids,
    }
}
