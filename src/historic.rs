//! Rolling hourly consumption/production history and its monthly aggregates.

use crate::data_source::{execute_or_none, home_field, DataSource, HISTORIC_QUERY_TIMEOUT};
use crate::price_cache::round_to;
use crate::queries::{self, Direction, Resolution};
use chrono::{DateTime, Datelike, Duration, FixedOffset, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde_derive::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Hours of history kept per direction
pub const RETENTION_HOURS: u32 = 30 * 24;
/// Extra slack before the retained history counts as stale
pub const STALE_BUFFER_HOURS: i64 = 24;
pub const MIN_INCREMENTAL_HOURS: u32 = 2;

/// One node of the historic connection.
///
/// `energy` and `money` accept the direction specific field names, so the same
/// type serves consumption (`consumption`/`cost`) and production (`production`/`profit`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricNode {
    pub from: DateTime<FixedOffset>,
    #[serde(default)]
    pub to: Option<DateTime<FixedOffset>>,
    #[serde(default, alias = "consumption", alias = "production")]
    pub energy: Option<f64>,
    #[serde(default, alias = "cost", alias = "profit")]
    pub money: Option<f64>,
    #[serde(default)]
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default, rename = "unitPriceVAT")]
    pub unit_price_vat: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HourlyDataSet {
    pub direction: Direction,
    /// Deduplicated, not sorted
    pub data: Vec<HistoricNode>,
    pub month_energy: Option<f64>,
    pub month_money: Option<f64>,
    pub peak_hour: Option<f64>,
    pub peak_hour_time: Option<DateTime<FixedOffset>>,
    /// Exclusive end of the newest hour included in the aggregates. Never moves back.
    pub last_data_timestamp: Option<DateTime<FixedOffset>>,
}

impl HourlyDataSet {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            data: Vec::new(),
            month_energy: None,
            month_money: None,
            peak_hour: None,
            peak_hour_time: None,
            last_data_timestamp: None,
        }
    }

    fn oldest(&self) -> Option<DateTime<FixedOffset>> {
        self.data.iter().map(|n| n.from).min()
    }

    /// Decides how much history the next refresh needs, `None` when it can be skipped
    pub fn plan_fetch(&self, now: DateTime<Utc>) -> Option<FetchPlan> {
        let stale_before =
            now - Duration::hours(i64::from(RETENTION_HOURS) + STALE_BUFFER_HOURS);
        let watermark = match (self.last_data_timestamp, self.oldest()) {
            (Some(watermark), Some(oldest)) if oldest >= stale_before => watermark,
            _ => return Some(FetchPlan::Full(RETENTION_HOURS)),
        };

        let elapsed_hours = (now - watermark.with_timezone(&Utc)).num_seconds() / 3600;
        if elapsed_hours < 1 {
            return None;
        }
        let hours = u32::try_from(elapsed_hours).unwrap_or(RETENTION_HOURS);
        Some(FetchPlan::Incremental(hours.max(MIN_INCREMENTAL_HOURS)))
    }

    /// Merges freshly fetched nodes and recomputes the month aggregates.
    /// An empty fetch leaves everything untouched and returns false.
    pub fn apply(&mut self, plan: FetchPlan, fetched: Vec<HistoricNode>, now: DateTime<Utc>, tz: Tz) -> bool {
        if fetched.is_empty() {
            error!("Could not find {} data.", self.direction);
            return false;
        }

        match plan {
            FetchPlan::Full(_) => self.data = fetched,
            FetchPlan::Incremental(_) if self.data.is_empty() => self.data = fetched,
            FetchPlan::Incremental(_) => {
                self.data.retain(|node| !fetched.contains(node));
                self.data.extend(fetched);
            }
        }
        self.aggregate(now, tz);
        true
    }

    fn aggregate(&mut self, now: DateTime<Utc>, tz: Tz) {
        let local_now = now.with_timezone(&tz);
        let mut month_energy = 0.0;
        let mut month_money = 0.0;
        let mut peak = 0.0;
        let mut peak_time = None;

        for node in &self.data {
            let local = node.from.with_timezone(&tz);
            if local.month() != local_now.month() || local.year() != local_now.year() {
                continue;
            }
            let Some(energy) = node.energy else {
                continue;
            };

            let hour_end = node.from + Duration::hours(1);
            if self.last_data_timestamp.map_or(true, |last| hour_end > last) {
                self.last_data_timestamp = Some(hour_end);
            }
            if energy > peak {
                peak = energy;
                peak_time = Some(node.from);
            }
            month_energy += energy;
            if let Some(money) = node.money {
                month_money += money;
            }
        }

        self.month_energy = Some(round_to(month_energy, 2));
        self.month_money = Some(round_to(month_money, 2));
        self.peak_hour = Some(round_to(peak, 2));
        self.peak_hour_time = peak_time;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPlan {
    /// Drop what is held and load the whole retention window
    Full(u32),
    /// Fetch the last n hours and merge them in
    Incremental(u32),
}

impl FetchPlan {
    pub fn hours(self) -> u32 {
        match self {
            FetchPlan::Full(n) | FetchPlan::Incremental(n) => n,
        }
    }
}

/// Fetches history for one home and folds it into its datasets
#[derive(Clone)]
pub struct HistoricMerger {
    home_id: String,
    source: Arc<dyn DataSource>,
    time_zone: Tz,
}

impl HistoricMerger {
    pub fn new(home_id: impl Into<String>, source: Arc<dyn DataSource>, time_zone: Tz) -> Self {
        Self {
            home_id: home_id.into(),
            source,
            time_zone,
        }
    }

    pub async fn refresh(&self, dataset: &Mutex<HourlyDataSet>) {
        self.refresh_at(dataset, Utc::now()).await;
    }

    /// The lock is only held while planning and while merging, never across the fetch.
    pub async fn refresh_at(&self, dataset: &Mutex<HourlyDataSet>, now: DateTime<Utc>) {
        let (plan, direction) = {
            let data = dataset.lock();
            (data.plan_fetch(now), data.direction)
        };
        let Some(plan) = plan else {
            debug!("{direction} data for {} is less than an hour old", self.home_id);
            return;
        };

        let fetched = self
            .get_historic_data(plan.hours(), Resolution::Hourly, direction)
            .await;
        let fetched_len = fetched.len();
        if dataset.lock().apply(plan, fetched, now, self.time_zone) {
            info!(
                "Merged {fetched_len} {direction} nodes for {} ({plan:?})",
                self.home_id
            );
        }
    }

    /// The last `n` nodes of history; empty on any failure
    pub async fn get_historic_data(
        &self,
        n: u32,
        resolution: Resolution,
        direction: Direction,
    ) -> Vec<HistoricNode> {
        let query = queries::historic_data(&self.home_id, direction, resolution, n);
        let Some(data) = execute_or_none(self.source.as_ref(), &query, HISTORIC_QUERY_TIMEOUT).await
        else {
            error!("Could not get the data.");
            return Vec::new();
        };
        let Some(nodes) = home_field(&data, &[direction.energy_field(), "nodes"]).and_then(Value::as_array)
        else {
            return Vec::new();
        };
        nodes
            .iter()
            .filter_map(|node| match serde_json::from_value::<HistoricNode>(node.clone()) {
                Ok(node) => Some(node),
                Err(e) => {
                    error!("Skipping malformed {direction} node: {e}");
                    None
                }
            })
            .collect()
    }

    /// Price rating entries at the given resolution
    pub async fn get_historic_price_data(&self, resolution: Resolution) -> Option<Vec<Value>> {
        let query = queries::historic_price(&self.home_id, resolution);
        let Some(data) = execute_or_none(self.source.as_ref(), &query, HISTORIC_QUERY_TIMEOUT).await
        else {
            error!("Could not get the price data.");
            return None;
        };
        let res = resolution.as_str().to_lowercase();
        home_field(&data, &["currentSubscription", "priceRating", &res, "entries"])
            .and_then(Value::as_array)
            .cloned()
    }
}
