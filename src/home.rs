use crate::config::Settings;
use crate::data_source::{execute_or_none, home_field, DataSource, DEFAULT_QUERY_TIMEOUT};
use crate::historic::{HistoricMerger, HistoricNode, HourlyDataSet};
use crate::price_cache::PriceCache;
use crate::queries::{self, Direction};
use crate::ranking::{CurrentPriceData, RankWindow, RankingEngine};
use crate::realtime::{ConnectionRegistry, FeedStatus, LiveCallback, RealtimeFeed};
use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

const ACTIVE_SUBSCRIPTION_STATUSES: [&str; 4] = [
    "running",
    "awaiting market",
    "awaiting time restriction",
    "awaiting termination",
];
const CONSUMPTION_UNIT: &str = "kWh";

/// One home: its info, prices, hourly history and optional live feed.
///
/// Methods take `&mut self`; callers serialize access per home.
pub struct Home {
    home_id: String,
    source: Arc<dyn DataSource>,
    info: Option<Value>,
    prices: PriceCache,
    historic: HistoricMerger,
    consumption: Arc<Mutex<HourlyDataSet>>,
    production: Arc<Mutex<HourlyDataSet>>,
    realtime: Option<RealtimeFeed>,
}

impl Home {
    pub fn new(home_id: impl Into<String>, source: Arc<dyn DataSource>, settings: Settings) -> Self {
        let home_id = home_id.into();
        Self {
            historic: HistoricMerger::new(home_id.clone(), source.clone(), settings.time_zone),
            prices: PriceCache::new(settings),
            home_id,
            source,
            info: None,
            consumption: Arc::new(Mutex::new(HourlyDataSet::new(Direction::Consumption))),
            production: Arc::new(Mutex::new(HourlyDataSet::new(Direction::Production))),
            realtime: None,
        }
    }

    pub fn home_id(&self) -> &str {
        &self.home_id
    }

    pub fn info(&self) -> Option<&Value> {
        self.info.as_ref()
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }

    pub fn historic(&self) -> &HistoricMerger {
        &self.historic
    }

    pub fn ranking(&self) -> RankingEngine<'_> {
        RankingEngine::new(&self.prices)
    }

    async fn query(&self, query: &str) -> Option<Value> {
        execute_or_none(self.source.as_ref(), query, DEFAULT_QUERY_TIMEOUT).await
    }

    pub async fn update_info(&mut self) {
        match self.query(&queries::update_info(&self.home_id)).await {
            Some(data) => self.info = Some(data),
            None => warn!("No info received for home {}", self.home_id),
        }
    }

    /// Info and the full price table in one query
    pub async fn update_info_and_price_info(&mut self) {
        if let Some(data) = self.query(&queries::update_info_price(&self.home_id)).await {
            self.prices.ingest(&data);
            self.info = Some(data);
        }
    }

    pub async fn update_price_info(&mut self) {
        match self.query(&queries::price_info(&self.home_id)).await {
            Some(data) => self.prices.ingest(&data),
            None => error!("Could not find price info."),
        }
    }

    /// Refreshes only the fallback snapshot; keeps the old one on failure
    pub async fn update_current_price_info(&mut self) {
        match self.query(&queries::current_price(&self.home_id)).await {
            Some(data) => self.prices.set_current(&data),
            None => error!("Could not find current price info."),
        }
    }

    pub async fn fetch_consumption_data(&self) {
        self.historic.refresh(&self.consumption).await;
    }

    pub async fn fetch_production_data(&self) {
        self.historic.refresh(&self.production).await;
    }

    pub fn consumption(&self) -> Arc<Mutex<HourlyDataSet>> {
        self.consumption.clone()
    }

    pub fn production(&self) -> Arc<Mutex<HourlyDataSet>> {
        self.production.clone()
    }

    pub fn hourly_consumption_data(&self) -> Vec<HistoricNode> {
        self.consumption.lock().data.clone()
    }

    pub fn hourly_production_data(&self) -> Vec<HistoricNode> {
        self.production.lock().data.clone()
    }

    pub fn month_cons(&self) -> Option<f64> {
        self.consumption.lock().month_energy
    }

    pub fn month_cost(&self) -> Option<f64> {
        self.consumption.lock().month_money
    }

    pub fn month_production(&self) -> Option<f64> {
        self.production.lock().month_energy
    }

    pub fn month_profit(&self) -> Option<f64> {
        self.production.lock().month_money
    }

    pub fn peak_hour(&self) -> Option<f64> {
        self.consumption.lock().peak_hour
    }

    pub fn peak_hour_time(&self) -> Option<DateTime<FixedOffset>> {
        self.consumption.lock().peak_hour_time
    }

    pub fn last_cons_data_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.consumption.lock().last_data_timestamp
    }

    fn info_field(&self, path: &[&str]) -> Option<&Value> {
        home_field(self.info.as_ref()?, path)
    }

    fn info_str(&self, path: &[&str]) -> Option<&str> {
        self.info_field(path).and_then(Value::as_str)
    }

    pub fn has_active_subscription(&self) -> bool {
        self.info_str(&["currentSubscription", "status"])
            .is_some_and(|status| ACTIVE_SUBSCRIPTION_STATUSES.contains(&status))
    }

    /// `None` when the home info does not say
    pub fn has_real_time_consumption(&self) -> Option<bool> {
        self.info_field(&["features", "realTimeConsumptionEnabled"])
            .and_then(Value::as_bool)
    }

    pub fn has_production(&self) -> bool {
        self.info_str(&["meteringPointData", "productionEan"])
            .is_some_and(|ean| !ean.is_empty())
    }

    pub fn address1(&self) -> String {
        match self.info_str(&["address", "address1"]) {
            Some(address) => address.to_string(),
            None => {
                error!("Could not find address1.");
                String::new()
            }
        }
    }

    pub fn country(&self) -> String {
        match self.info_str(&["address", "country"]) {
            Some(country) => country.to_string(),
            None => {
                error!("Could not find country.");
                String::new()
            }
        }
    }

    /// App nickname, or the first address line
    pub fn name(&self) -> String {
        match self.info_str(&["appNickname"]) {
            Some(nickname) => nickname.to_string(),
            None => self
                .info_str(&["address", "address1"])
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn currency(&self) -> Option<&str> {
        let currency = self
            .info_str(&["currentSubscription", "priceInfo", "current", "currency"])
            .or_else(|| self.prices.currency());
        if currency.is_none() {
            debug!("Could not find currency in home info.");
        }
        currency
    }

    /// e.g. `EUR/kWh`; empty when the currency is unknown
    pub fn price_unit(&self) -> String {
        match self.currency() {
            Some(currency) if !currency.is_empty() => format!("{currency}/{CONSUMPTION_UNIT}"),
            _ => {
                error!("Could not find price_unit.");
                String::new()
            }
        }
    }

    pub fn price_rank(&self, window: RankWindow) -> f64 {
        self.ranking().rank(window)
    }

    pub fn current_price_data(&self) -> Option<CurrentPriceData> {
        self.ranking().current_price_data()
    }

    /// Creates the live feed on the shared connection. An existing feed is
    /// unsubscribed first.
    pub async fn attach_realtime(&mut self, registry: Arc<ConnectionRegistry>) {
        if let Some(mut old) = self.realtime.take() {
            old.unsubscribe().await;
        }
        self.realtime = Some(RealtimeFeed::new(
            self.home_id.clone(),
            registry,
            self.consumption.clone(),
            self.prices.settings().time_zone,
        ));
    }

    pub fn realtime(&self) -> Option<&RealtimeFeed> {
        self.realtime.as_ref()
    }

    pub async fn rt_subscribe(&mut self, callback: LiveCallback) {
        match self.realtime.as_mut() {
            Some(feed) => feed.subscribe(callback).await,
            None => warn!("No realtime connection attached to home {}", self.home_id),
        }
    }

    pub async fn rt_unsubscribe(&mut self) {
        if let Some(feed) = self.realtime.as_mut() {
            feed.unsubscribe().await;
        }
    }

    /// Unsubscribes, refreshes home and account info, then subscribes again
    /// with the previous callback if the home still has a live device.
    pub async fn rt_resubscribe(&mut self) {
        let Some(feed) = self.realtime.as_mut() else {
            warn!("No realtime connection attached to home {}", self.home_id);
            return;
        };
        feed.unsubscribe().await;

        let info_query = queries::update_info(&self.home_id);
        let (info, account) = tokio::join!(
            execute_or_none(self.source.as_ref(), &info_query, DEFAULT_QUERY_TIMEOUT),
            self.source.update_account_info(),
        );
        if let Some(info) = info {
            self.info = Some(info);
        }
        if let Err(e) = account {
            warn!("Could not refresh account info: {e}");
        }

        let capability = self.has_real_time_consumption();
        if let Some(feed) = self.realtime.as_mut() {
            feed.resubscribe(capability).await;
        }
    }

    pub fn rt_subscription_running(&self) -> bool {
        self.realtime
            .as_ref()
            .is_some_and(RealtimeFeed::subscription_running)
    }

    pub fn rt_status(&self) -> FeedStatus {
        self.realtime
            .as_ref()
            .map_or(FeedStatus::Stopped, |feed| feed.status_at(Utc::now()))
    }
}
