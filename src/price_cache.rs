//! Normalized price table built from `priceInfo` responses.

use crate::config::Settings;
use crate::data_source::home_field;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use serde_derive::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Length of one billing interval
pub const PRICE_INTERVAL_MINUTES: i64 = 15;

/// One price as delivered by the API, before normalization
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPrice {
    pub total: Option<f64>,
    pub energy: Option<f64>,
    pub tax: Option<f64>,
    pub starts_at: Option<String>,
    pub level: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceEntry {
    pub starts_at: DateTime<FixedOffset>,
    pub total: Option<f64>,
    /// Spot price
    pub energy: f64,
    /// `energy + purchasing_compensation`
    pub energy_with_compensation: f64,
    /// `energy_with_compensation * tax_rate`
    pub energy_with_compensation_and_tax: f64,
    pub tax: Option<f64>,
    pub level: Option<String>,
}

impl PriceEntry {
    fn contains(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && at < self.starts_at + Duration::minutes(PRICE_INTERVAL_MINUTES)
    }
}

/// Everything one ingest produces. Replaced as a whole on every ingest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceTable {
    /// Keyed by the instant the interval starts
    pub entries: BTreeMap<DateTime<FixedOffset>, PriceEntry>,
    pub current: Option<RawPrice>,
}

/// Which data `electricity_price` answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    QuarterHour,
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Today's spot price summary split into tariff blocks
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriceAttributes {
    pub max_price: f64,
    pub min_price: f64,
    pub avg_price: f64,
    /// Before 08:00
    pub off_peak_1: f64,
    /// 08:00 - 20:00
    pub peak: f64,
    /// From 20:00
    pub off_peak_2: f64,
}

#[derive(Debug, Clone)]
pub struct PriceCache {
    settings: Settings,
    table: PriceTable,
    last_price_update: Option<DateTime<Utc>>,
    last_price_timestamp: Option<DateTime<FixedOffset>>,
}

impl PriceCache {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            table: PriceTable::default(),
            last_price_update: None,
            last_price_timestamp: None,
        }
    }

    /// Replaces the table with the `current`, `today` and `tomorrow` sections of a
    /// price info response. Sections that are missing or malformed are logged and
    /// skipped; the remaining sections are still ingested.
    pub fn ingest(&mut self, response: &Value) {
        self.ingest_at(response, Utc::now());
    }

    pub fn ingest_at(&mut self, response: &Value, now: DateTime<Utc>) {
        if response.is_null() || response.as_object().is_some_and(|o| o.is_empty()) {
            error!("Could not find price info.");
            return;
        }
        let mut table = PriceTable::default();
        let mut total_entries = 0usize;
        let mut non_quarter_entries = 0usize;

        for key in ["current", "today", "tomorrow"] {
            let Some(section) =
                home_field(response, &["currentSubscription", "priceInfo", key])
            else {
                error!("Could not find price info for {key}.");
                continue;
            };

            if key == "current" {
                match serde_json::from_value::<RawPrice>(section.clone()) {
                    Ok(current) => {
                        debug!(
                            "Current price received: total={:?} startsAt={:?}",
                            current.total, current.starts_at
                        );
                        table.current = Some(current);
                    }
                    Err(e) => error!("Could not parse current price info: {e}"),
                }
                continue;
            }

            let Some(items) = section.as_array() else {
                error!("Price info for {key} is not a list.");
                continue;
            };
            for item in items {
                total_entries += 1;
                let Some(entry) = self.normalize(item) else {
                    continue;
                };
                if entry.starts_at.minute() % PRICE_INTERVAL_MINUTES as u32 != 0 {
                    non_quarter_entries += 1;
                    debug!(
                        "Non-quarter timestamp in priceInfo: {} (minute={})",
                        entry.starts_at,
                        entry.starts_at.minute()
                    );
                }
                if self.last_price_timestamp.map_or(true, |last| entry.starts_at > last) {
                    self.last_price_timestamp = Some(entry.starts_at);
                }
                table.entries.insert(entry.starts_at, entry);
            }
        }

        debug!("Processed priceInfo: total_entries={total_entries} non_quarter_entries={non_quarter_entries}");
        self.table = table;
        self.last_price_update = Some(now);
    }

    /// Replaces only the fallback snapshot, as returned by a current-price query
    pub fn set_current(&mut self, response: &Value) {
        let current = home_field(response, &["currentSubscription", "priceInfo", "current"])
            .and_then(|v| serde_json::from_value::<RawPrice>(v.clone()).ok());
        match current {
            Some(current) => self.table.current = Some(current),
            None => error!("Could not find current price info."),
        }
    }

    fn normalize(&self, item: &Value) -> Option<PriceEntry> {
        let raw: RawPrice = match serde_json::from_value(item.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Skipping malformed price entry: {e}");
                return None;
            }
        };
        let Some(starts_at) = raw
            .starts_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        else {
            error!("Could not parse startsAt: {:?}", raw.starts_at);
            return None;
        };
        let Some(energy) = raw.energy else {
            error!("Price entry {starts_at} has no energy price");
            return None;
        };
        let energy_with_compensation = energy + self.settings.purchasing_compensation;
        Some(PriceEntry {
            starts_at,
            total: raw.total,
            energy,
            energy_with_compensation,
            energy_with_compensation_and_tax: energy_with_compensation * self.settings.tax_rate,
            tax: raw.tax,
            level: raw.level,
        })
    }

    pub fn table(&self) -> &PriceTable {
        &self.table
    }

    pub fn entries(&self) -> impl Iterator<Item = &PriceEntry> {
        self.table.entries.values()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn current(&self) -> Option<&RawPrice> {
        self.table.current.as_ref()
    }

    pub fn last_price_update(&self) -> Option<DateTime<Utc>> {
        self.last_price_update
    }

    /// Latest interval start seen in any ingest
    pub fn last_price_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.last_price_timestamp
    }

    pub fn current_total(&self) -> Option<f64> {
        self.table.current.as_ref()?.total
    }

    pub fn currency(&self) -> Option<&str> {
        self.table.current.as_ref()?.currency.as_deref()
    }

    pub fn total_by_timestamp(&self) -> BTreeMap<String, f64> {
        self.by_timestamp(|e| e.total)
    }

    pub fn energy_by_timestamp(&self) -> BTreeMap<String, f64> {
        self.by_timestamp(|e| Some(e.energy))
    }

    pub fn level_by_timestamp(&self) -> BTreeMap<String, String> {
        self.table
            .entries
            .values()
            .filter_map(|e| Some((e.starts_at.to_rfc3339(), e.level.clone()?)))
            .collect()
    }

    fn by_timestamp(&self, field: impl Fn(&PriceEntry) -> Option<f64>) -> BTreeMap<String, f64> {
        self.table
            .entries
            .values()
            .filter_map(|e| Some((e.starts_at.to_rfc3339(), field(e)?)))
            .collect()
    }

    fn entry_at(&self, at: DateTime<Utc>) -> Option<&PriceEntry> {
        self.table.entries.values().find(|e| e.contains(at))
    }

    /// Total price of the quarter-hour containing `now`, else the current snapshot's total
    pub fn electricity_price(&self) -> Option<f64> {
        self.electricity_price_at(Utc::now())
    }

    pub fn electricity_price_at(&self, now: DateTime<Utc>) -> Option<f64> {
        match self.entry_at(now) {
            Some(entry) => entry.total,
            None => self.current_total(),
        }
    }

    pub fn price_source_at(&self, now: DateTime<Utc>) -> PriceSource {
        if self.entry_at(now).is_some() {
            PriceSource::QuarterHour
        } else {
            PriceSource::Current
        }
    }

    /// Spot price without compensation or tax
    pub fn electricity_price_excl_base_at(&self, now: DateTime<Utc>) -> Option<f64> {
        match self.entry_at(now) {
            Some(entry) => Some(entry.energy),
            None => self.table.current.as_ref()?.energy,
        }
    }

    /// Spot price plus purchasing compensation, excluding tax
    pub fn electricity_price_excl_at(&self, now: DateTime<Utc>) -> Option<f64> {
        Some(self.electricity_price_excl_base_at(now)? + self.settings.purchasing_compensation)
    }

    pub fn electricity_price_excl_cent_at(&self, now: DateTime<Utc>) -> Option<f64> {
        Some(self.electricity_price_excl_at(now)? * 100.0)
    }

    /// `(spot + compensation + energy tax) * tax_rate`, all components excl VAT
    pub fn electricity_price_calc_at(&self, now: DateTime<Utc>) -> Option<f64> {
        let spot = self.electricity_price_excl_base_at(now)?;
        let subtotal =
            spot + self.settings.purchasing_compensation + self.settings.energy_tax_excl;
        Some(subtotal * self.settings.tax_rate)
    }

    pub fn purchasing_compensation_excl(&self) -> f64 {
        self.settings.purchasing_compensation
    }

    pub fn purchasing_compensation_incl(&self) -> f64 {
        self.settings.purchasing_compensation * self.settings.tax_rate
    }

    pub fn energy_tax_excl(&self) -> f64 {
        self.settings.energy_tax_excl
    }

    pub fn energy_tax_incl(&self) -> f64 {
        self.settings.energy_tax_incl
    }

    pub fn tax_rate_percent(&self) -> f64 {
        self.settings.tax_rate_percent()
    }

    fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.settings.time_zone).date_naive()
    }

    /// Entries starting on the local calendar day `now + day_offset`
    pub fn entries_on_day(&self, now: DateTime<Utc>, day_offset: i64) -> Vec<&PriceEntry> {
        let day = self.local_date(now) + Duration::days(day_offset);
        self.table
            .entries
            .values()
            .filter(|e| self.local_date(e.starts_at.with_timezone(&Utc)) == day)
            .collect()
    }

    fn day_stats(&self, now: DateTime<Utc>, day_offset: i64) -> Option<PriceStats> {
        let totals: Vec<f64> = self
            .entries_on_day(now, day_offset)
            .into_iter()
            .filter_map(|e| e.total)
            .collect();
        if totals.is_empty() {
            return None;
        }
        let min = totals.iter().copied().fold(f64::INFINITY, f64::min);
        let max = totals.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = totals.iter().sum::<f64>() / totals.len() as f64;
        Some(PriceStats { min, max, avg })
    }

    /// Min/max/avg of today's total prices, `None` when there are none
    pub fn today_stats_at(&self, now: DateTime<Utc>) -> Option<PriceStats> {
        self.day_stats(now, 0)
    }

    pub fn tomorrow_stats_at(&self, now: DateTime<Utc>) -> Option<PriceStats> {
        self.day_stats(now, 1)
    }

    pub fn today_min(&self) -> Option<f64> {
        Some(self.today_stats_at(Utc::now())?.min)
    }

    pub fn today_max(&self) -> Option<f64> {
        Some(self.today_stats_at(Utc::now())?.max)
    }

    pub fn today_avg(&self) -> Option<f64> {
        Some(self.today_stats_at(Utc::now())?.avg)
    }

    pub fn tomorrow_min(&self) -> Option<f64> {
        Some(self.tomorrow_stats_at(Utc::now())?.min)
    }

    pub fn tomorrow_max(&self) -> Option<f64> {
        Some(self.tomorrow_stats_at(Utc::now())?.max)
    }

    pub fn tomorrow_avg(&self) -> Option<f64> {
        Some(self.tomorrow_stats_at(Utc::now())?.avg)
    }

    pub fn daily_attributes_at(&self, now: DateTime<Utc>) -> PriceAttributes {
        let tz = self.settings.time_zone;
        let mut attr = PriceAttributes {
            min_price: 10000.0,
            ..Default::default()
        };
        let (mut sum, mut num) = (0.0, 0u32);
        let mut blocks = [(0.0, 0u32); 3];

        for entry in self.entries_on_day(now, 0) {
            let price = round_to(entry.energy, 3);
            let block = match entry.starts_at.with_timezone(&tz).hour() {
                h if h < 8 => 0,
                h if h < 20 => 1,
                _ => 2,
            };
            blocks[block].0 += price;
            blocks[block].1 += 1;
            attr.max_price = attr.max_price.max(price);
            attr.min_price = attr.min_price.min(price);
            sum += price;
            num += 1;
        }

        let avg = |(total, n): (f64, u32)| if n > 0 { round_to(total / n as f64, 3) } else { 0.0 };
        attr.avg_price = avg((sum, num));
        attr.off_peak_1 = avg(blocks[0]);
        attr.peak = avg(blocks[1]);
        attr.off_peak_2 = avg(blocks[2]);
        attr
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
