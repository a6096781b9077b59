//! Relative cheapness of the current hour, normalized to `[0, 1]`.
//!
//! 0 is the cheapest slot among its peers and 1 the most expensive. The two
//! entry points deliberately disagree on what "no answer" looks like: window
//! ranks fall back to 1.0 (assume the worst), while [`current_price_rank`]
//! returns `None`.

use crate::price_cache::{round_to, PriceCache};
use chrono::{DateTime, TimeZone, Timelike, Utc};
use tracing::warn;

/// Rank used when a window has nothing to compare against
pub const WORST_RANK: f64 = 1.0;
/// Rank of the only entry in a window
pub const SINGLE_ENTRY_RANK: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HourPrice {
    pub hour: u32,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankWindow {
    FullDay,
    /// 00:00 - 08:00
    Night,
    /// 08:00 - 18:00
    Day,
    /// 18:00 - 00:00
    Evening,
}

impl RankWindow {
    /// Inclusive first and last hour
    pub fn hours(self) -> (u32, u32) {
        match self {
            RankWindow::FullDay => (0, 23),
            RankWindow::Night => (0, 7),
            RankWindow::Day => (8, 17),
            RankWindow::Evening => (18, 23),
        }
    }
}

/// Price of the running hour together with its rank among today's prices
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentPriceData {
    pub price: Option<f64>,
    pub starts_at: DateTime<chrono_tz::Tz>,
    pub rank: Option<f64>,
}

/// Sorts ascending and returns the normalized position of the first entry for `hour`
fn rank_of_hour(mut prices: Vec<HourPrice>, hour: u32) -> Option<f64> {
    prices.sort_by(|a, b| a.price.total_cmp(&b.price));
    let index = prices.iter().position(|p| p.hour == hour)?;
    if prices.len() > 1 {
        Some(index as f64 / (prices.len() - 1) as f64)
    } else {
        Some(SINGLE_ENTRY_RANK)
    }
}

/// Rank of the hour of `at` within `prices`.
///
/// `None` when there is no timestamp, no prices or no entry for that hour.
pub fn current_price_rank<Tz: TimeZone>(prices: &[HourPrice], at: Option<&DateTime<Tz>>) -> Option<f64> {
    let at = at?;
    if prices.is_empty() {
        return None;
    }
    if prices.iter().any(|p| p.price.is_nan()) {
        warn!("Could not calculate price rank");
        return None;
    }
    rank_of_hour(prices.to_vec(), at.hour())
}

/// Read-only ranking view over a price cache
#[derive(Debug, Clone, Copy)]
pub struct RankingEngine<'a> {
    cache: &'a PriceCache,
}

impl<'a> RankingEngine<'a> {
    pub fn new(cache: &'a PriceCache) -> Self {
        Self { cache }
    }

    /// Rank of the current hour among today's hours in `[hour_start, hour_end]`,
    /// compared on the compensation and tax adjusted energy price.
    pub fn rank_within_window_at(&self, hour_start: u32, hour_end: u32, now: DateTime<Utc>) -> f64 {
        let tz = self.cache.settings().time_zone;
        let prices: Vec<HourPrice> = self
            .cache
            .entries_on_day(now, 0)
            .into_iter()
            .map(|e| HourPrice {
                hour: e.starts_at.with_timezone(&tz).hour(),
                price: e.energy_with_compensation_and_tax,
            })
            .filter(|p| (hour_start..=hour_end).contains(&p.hour))
            .collect();

        rank_of_hour(prices, now.with_timezone(&tz).hour()).unwrap_or(WORST_RANK)
    }

    pub fn rank_at(&self, window: RankWindow, now: DateTime<Utc>) -> f64 {
        let (start, end) = window.hours();
        self.rank_within_window_at(start, end, now)
    }

    pub fn rank(&self, window: RankWindow) -> f64 {
        self.rank_at(window, Utc::now())
    }

    /// The first entry that started within the last hour, with its total price
    /// (3 decimals) and its rank among today's total prices.
    pub fn current_price_data_at(&self, now: DateTime<Utc>) -> Option<CurrentPriceData> {
        let tz = self.cache.settings().time_zone;
        let today: Vec<HourPrice> = self
            .cache
            .entries_on_day(now, 0)
            .into_iter()
            .map(|e| HourPrice {
                hour: e.starts_at.with_timezone(&tz).hour(),
                price: e.total.unwrap_or(0.0),
            })
            .collect();

        let entry = self.cache.entries().find(|e| {
            let minutes = (now - e.starts_at.with_timezone(&Utc)).num_seconds() as f64 / 60.0;
            (0.0..60.0).contains(&minutes)
        })?;
        let starts_at = entry.starts_at.with_timezone(&tz);
        Some(CurrentPriceData {
            price: entry.total.map(|p| round_to(p, 3)),
            rank: current_price_rank(&today, Some(&starts_at)),
            starts_at,
        })
    }

    pub fn current_price_data(&self) -> Option<CurrentPriceData> {
        self.current_price_data_at(Utc::now())
    }
}
