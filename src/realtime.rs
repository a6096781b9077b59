//! Live measurement subscription for one home.
//!
//! Every home registers with a shared [`ConnectionRegistry`]; one physical
//! transport connection serves all of them. Each subscribed feed runs two tasks:
//! a listener that waits for the transport, pulls the stream and forwards
//! payloads over a bounded channel, and a consumer that smooths the power
//! readings, projects the running hour and calls the user callback. The
//! consumer is the only place the callback runs, so at most one callback per
//! home is in flight.

use crate::error::TransportError;
use crate::historic::HourlyDataSet;
use crate::power_window::PowerWindow;
use crate::price_cache::round_to;
use crate::queries;
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use chrono_tz::Tz;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Readiness checks before giving up on the shared connection
pub const READY_POLL_ATTEMPTS: u32 = 30;
pub const READY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
/// A feed without a measurement for longer than this is not running
pub const WATCHDOG_SECONDS: i64 = 60;
const MEASUREMENT_BUFFER: usize = 32;

pub type MeasurementStream = BoxStream<'static, Result<Value, TransportError>>;
pub type LiveCallback = Arc<dyn Fn(LiveUpdate) + Send + Sync>;

/// Streaming connection shared by all homes of an account
#[async_trait]
pub trait StreamingTransport: Send + Sync {
    /// Opens the connection; calling it on an open connection is a no-op
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn add_home(&self, home_id: &str);

    fn subscription_running(&self) -> bool;

    /// Starts a subscription. Items are the `data` objects of the subscription messages.
    async fn subscribe(&self, query: &str) -> Result<MeasurementStream, TransportError>;
}

/// Reference counted registrations on one shared transport
pub struct ConnectionRegistry {
    transport: Arc<dyn StreamingTransport>,
    homes: Mutex<HashMap<String, usize>>,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn StreamingTransport>) -> Self {
        Self {
            transport,
            homes: Mutex::new(HashMap::new()),
        }
    }

    /// Makes sure the connection is open and the home is known to it
    pub async fn register(&self, home_id: &str) -> Result<(), TransportError> {
        self.transport.connect().await?;
        self.transport.add_home(home_id);
        *self.homes.lock().entry(home_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Drops one registration, closing the connection after the last one
    pub async fn release(&self, home_id: &str) {
        let now_idle = {
            let mut homes = self.homes.lock();
            if let Some(count) = homes.get_mut(home_id) {
                *count -= 1;
                if *count == 0 {
                    homes.remove(home_id);
                }
            }
            homes.is_empty()
        };
        if now_idle {
            info!("Last realtime home released, disconnecting");
            self.transport.disconnect().await;
        }
    }

    pub fn registered_homes(&self) -> usize {
        self.homes.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.transport.subscription_running()
    }

    pub fn transport(&self) -> Arc<dyn StreamingTransport> {
        self.transport.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMeasurement {
    pub timestamp: DateTime<FixedOffset>,
    /// Watts
    pub power: f64,
    #[serde(default)]
    pub power_production: Option<f64>,
    #[serde(default)]
    pub accumulated_consumption: Option<f64>,
    /// kWh used so far in the current clock hour
    #[serde(default)]
    pub accumulated_consumption_last_hour: Option<f64>,
    #[serde(default)]
    pub accumulated_production_last_hour: Option<f64>,
    #[serde(default)]
    pub accumulated_cost: Option<f64>,
}

/// What the callback receives for every message
#[derive(Debug, Clone)]
pub struct LiveUpdate {
    pub home_id: String,
    /// The message as received, with `estimatedHourConsumption` added when known
    pub payload: Value,
    /// `None` when the message did not carry a readable measurement
    pub measurement: Option<LiveMeasurement>,
    pub estimated_hour_consumption: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Stopped,
    Starting,
    Running,
    /// Transport closed, listener failed or watchdog expired; needs a resubscribe
    Stalled,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionState {
    /// The listener is consuming the stream
    pub running: bool,
    pub last_measurement_at: Option<DateTime<Utc>>,
    pub stop_requested: bool,
    pub subscribed_at: Option<DateTime<Utc>>,
    /// The listener ended without being asked to
    pub ended: bool,
}

impl SubscriptionState {
    fn stopped() -> Self {
        Self {
            stop_requested: true,
            ..Default::default()
        }
    }
}

/// State of one subscription. Every subscribe gets a fresh one, so tasks of an
/// earlier subscription only ever touch their own.
struct Shared {
    state: Mutex<SubscriptionState>,
    window: Mutex<PowerWindow>,
}

impl Shared {
    fn new(state: SubscriptionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            window: Mutex::new(PowerWindow::new()),
        })
    }
}

pub struct RealtimeFeed {
    home_id: String,
    registry: Arc<ConnectionRegistry>,
    consumption: Arc<Mutex<HourlyDataSet>>,
    time_zone: Tz,
    shared: Arc<Shared>,
    callback: Option<LiveCallback>,
    stop_tx: Option<watch::Sender<bool>>,
}

impl RealtimeFeed {
    /// `consumption` is the home's consumption dataset; live readings may raise its peak hour.
    pub fn new(
        home_id: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        consumption: Arc<Mutex<HourlyDataSet>>,
        time_zone: Tz,
    ) -> Self {
        Self {
            home_id: home_id.into(),
            registry,
            consumption,
            time_zone,
            shared: Shared::new(SubscriptionState::stopped()),
            callback: None,
            stop_tx: None,
        }
    }

    /// Registers with the shared connection and starts listening.
    ///
    /// Failures are logged only; a subscription that never gets going shows up
    /// as a feed that is not running.
    pub async fn subscribe(&mut self, callback: LiveCallback) {
        if self.stop_listener() {
            self.registry.release(&self.home_id).await;
        }
        self.callback = Some(callback.clone());
        self.shared = Shared::new(SubscriptionState {
            subscribed_at: Some(Utc::now()),
            ..Default::default()
        });

        if let Err(e) = self.registry.register(&self.home_id).await {
            error!("Could not connect realtime transport for {}: {e}", self.home_id);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(MEASUREMENT_BUFFER);
        tokio::spawn(listen(
            self.registry.transport(),
            self.home_id.clone(),
            tx,
            stop_rx,
            self.shared.clone(),
        ));
        tokio::spawn(consume(
            rx,
            self.home_id.clone(),
            self.shared.clone(),
            self.consumption.clone(),
            callback,
            self.time_zone,
        ));
        self.stop_tx = Some(stop_tx);
    }

    /// Signals the tasks to stop and drops this home's registration
    pub async fn unsubscribe(&mut self) {
        debug!("Unsubscribe, {}", self.home_id);
        if self.stop_listener() {
            self.registry.release(&self.home_id).await;
        }
    }

    /// Returns whether a subscription was active
    fn stop_listener(&mut self) -> bool {
        self.shared.state.lock().stop_requested = true;
        match self.stop_tx.take() {
            Some(stop_tx) => {
                let _ = stop_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Subscribes again with the last callback. Expects the caller to have
    /// unsubscribed and refreshed the home info that `has_real_time_consumption` comes from.
    pub async fn resubscribe(&mut self, has_real_time_consumption: Option<bool>) {
        let Some(callback) = self.callback.clone() else {
            warn!("No callback set for rt_resubscribe");
            return;
        };
        if has_real_time_consumption == Some(false) {
            warn!("No real time device for {}", self.home_id);
            return;
        }
        debug!("Resubscribe, {}", self.home_id);
        self.subscribe(callback).await;
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state.lock().clone()
    }

    /// Transport up and a measurement seen within the watchdog period
    pub fn subscription_running(&self) -> bool {
        self.subscription_running_at(Utc::now())
    }

    pub fn subscription_running_at(&self, now: DateTime<Utc>) -> bool {
        if !self.registry.is_running() {
            return false;
        }
        let state = self.shared.state.lock();
        if state.stop_requested {
            return false;
        }
        state
            .last_measurement_at
            .or(state.subscribed_at)
            .is_some_and(|last| now - last <= Duration::seconds(WATCHDOG_SECONDS))
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> FeedStatus {
        let (stop_requested, ended, seen) = {
            let state = self.shared.state.lock();
            (state.stop_requested, state.ended, state.last_measurement_at.is_some())
        };
        if stop_requested {
            FeedStatus::Stopped
        } else if ended {
            FeedStatus::Stalled
        } else if self.subscription_running_at(now) {
            if seen {
                FeedStatus::Running
            } else {
                FeedStatus::Starting
            }
        } else if !seen && !self.registry.is_running() && self.within_startup(now) {
            FeedStatus::Starting
        } else {
            FeedStatus::Stalled
        }
    }

    fn within_startup(&self, now: DateTime<Utc>) -> bool {
        let startup = READY_POLL_INTERVAL.as_secs() as i64 * i64::from(READY_POLL_ATTEMPTS);
        self.shared
            .state
            .lock()
            .subscribed_at
            .is_some_and(|at| now - at <= Duration::seconds(startup))
    }
}

impl Drop for RealtimeFeed {
    fn drop(&mut self) {
        if !self.stop_listener() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                let home_id = std::mem::take(&mut self.home_id);
                handle.spawn(async move { registry.release(&home_id).await });
            }
            Err(_) => warn!("Realtime feed for {} dropped outside a runtime", self.home_id),
        }
    }
}

async fn wait_until_ready(
    transport: &dyn StreamingTransport,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool {
    for _ in 0..READY_POLL_ATTEMPTS {
        if *stop_rx.borrow() {
            debug!("Stopping rt_subscribe");
            return false;
        }
        if transport.subscription_running() {
            return true;
        }
        debug!("Waiting for rt_connect");
        tokio::select! {
            _ = sleep(READY_POLL_INTERVAL) => {}
            _ = stop_rx.changed() => return false,
        }
    }
    error!("rt not running");
    false
}

async fn listen(
    transport: Arc<dyn StreamingTransport>,
    home_id: String,
    tx: mpsc::Sender<Value>,
    mut stop_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    if !wait_until_ready(transport.as_ref(), &mut stop_rx).await {
        return;
    }

    let mut stream = match transport.subscribe(&queries::live_subscribe(&home_id)).await {
        Ok(stream) => stream,
        Err(e) => {
            report_stream_error(&home_id, &e);
            shared.state.lock().ended = true;
            return;
        }
    };
    shared.state.lock().running = true;

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = stop_rx.changed() => break,
        };
        match item {
            Some(Ok(payload)) => {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                report_stream_error(&home_id, &e);
                break;
            }
            None => {
                debug!("Realtime stream for {home_id} ended");
                break;
            }
        }
        if *stop_rx.borrow() || !transport.subscription_running() {
            debug!("Stopping rt_subscribe loop");
            break;
        }
    }

    let mut state = shared.state.lock();
    state.running = false;
    state.ended = !state.stop_requested;
}

fn report_stream_error(home_id: &str, e: &TransportError) {
    if e.is_recoverable() {
        warn!("Realtime connection for {home_id} closed, will be retried: {e}");
    } else {
        error!(error = ?e, "Error receiving realtime data for {home_id}: {e}");
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Value>,
    home_id: String,
    shared: Arc<Shared>,
    consumption: Arc<Mutex<HourlyDataSet>>,
    callback: LiveCallback,
    time_zone: Tz,
) {
    while let Some(payload) = rx.recv().await {
        if shared.state.lock().stop_requested {
            break;
        }
        let update = {
            let mut window = shared.window.lock();
            build_update(&home_id, payload, &mut window, &consumption, time_zone)
        };
        debug!("Data received for {home_id}: {:?}", update.payload);
        callback(update);
        shared.state.lock().last_measurement_at = Some(Utc::now());
    }
}

fn build_update(
    home_id: &str,
    mut payload: Value,
    window: &mut PowerWindow,
    consumption: &Mutex<HourlyDataSet>,
    time_zone: Tz,
) -> LiveUpdate {
    let measurement = payload
        .get("liveMeasurement")
        .and_then(|m| serde_json::from_value::<LiveMeasurement>(m.clone()).ok());
    let estimated = measurement
        .as_ref()
        .and_then(|m| process_measurement(m, window, consumption, time_zone));

    if let (Some(estimate), Some(live)) = (
        estimated,
        payload.get_mut("liveMeasurement").and_then(Value::as_object_mut),
    ) {
        live.insert("estimatedHourConsumption".to_string(), json!(estimate));
    }
    LiveUpdate {
        home_id: home_id.to_string(),
        payload,
        measurement,
        estimated_hour_consumption: estimated,
    }
}

/// Adds the reading to the window and projects consumption for the running clock hour:
/// what has been used so far plus the window's average power over the rest of the hour.
/// Also raises the month peak when this hour already used more than the recorded peak.
pub fn process_measurement(
    measurement: &LiveMeasurement,
    window: &mut PowerWindow,
    consumption: &Mutex<HourlyDataSet>,
    time_zone: Tz,
) -> Option<f64> {
    let local = measurement.timestamp.with_timezone(&time_zone);
    window.add(measurement.timestamp, measurement.power / 1000.0);

    let used = measurement.accumulated_consumption_last_hour?;
    let average_kw = window.average()?;
    let seconds_into_hour = f64::from(local.minute() * 60 + local.second());
    let estimate = round_to(used + average_kw * (3600.0 - seconds_into_hour) / 3600.0, 3);

    let mut data = consumption.lock();
    if data.peak_hour.is_some_and(|peak| peak > 0.0 && used > peak) {
        data.peak_hour = Some(round_to(used, 2));
        data.peak_hour_time = Some(measurement.timestamp);
    }
    Some(estimate)
}


#[cfg(test)]
mod tests {
    use super::testing::{measurement, MockTransport};
    use super::*;
    use crate::queries::Direction;
    use std::sync::atomic::Ordering;
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const TZ: Tz = chrono_tz::Europe::Amsterdam;

    fn dataset(peak: Option<f64>) -> Arc<Mutex<HourlyDataSet>> {
        let mut data = HourlyDataSet::new(Direction::Consumption);
        data.peak_hour = peak;
        Arc::new(Mutex::new(data))
    }

    fn collector() -> (LiveCallback, UnboundedReceiver<LiveUpdate>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let callback: LiveCallback = Arc::new(move |update| {
            let _ = tx.send(update);
        });
        (callback, rx)
    }

    async fn next(rx: &mut UnboundedReceiver<LiveUpdate>) -> LiveUpdate {
        timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .expect("Should receive update")
            .expect("Channel open")
    }

    fn parse(value: Value) -> LiveMeasurement {
        serde_json::from_value(value["liveMeasurement"].clone()).unwrap()
    }

    #[test]
    fn test_estimate_projects_rest_of_hour() {
        let data = dataset(None);
        let mut window = PowerWindow::new();

        let first = parse(measurement("2024-01-01T12:29:50+01:00", 1000.0, None));
        assert_eq!(process_measurement(&first, &mut window, &data, TZ), None);

        let second = parse(measurement("2024-01-01T12:30:00+01:00", 2000.0, Some(0.5)));
        let estimate = process_measurement(&second, &mut window, &data, TZ).unwrap();
        let expected = round_to(0.5 + 1.5 * (3600.0 - 1800.0) / 3600.0, 3);
        assert_eq!(estimate, expected);
        assert_eq!(estimate, 1.25);
    }

    #[test]
    fn test_estimate_uses_only_last_five_minutes() {
        let data = dataset(None);
        let mut window = PowerWindow::new();
        let old = parse(measurement("2024-01-01T12:00:00+01:00", 9000.0, None));
        process_measurement(&old, &mut window, &data, TZ);

        let now = parse(measurement("2024-01-01T12:45:00+01:00", 1200.0, Some(0.3)));
        let estimate = process_measurement(&now, &mut window, &data, TZ).unwrap();
        assert_eq!(estimate, 0.6);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_live_reading_raises_peak() {
        let data = dataset(Some(1.0));
        let mut window = PowerWindow::new();
        let m = parse(measurement("2024-01-01T18:40:00+01:00", 3000.0, Some(1.234)));
        process_measurement(&m, &mut window, &data, TZ);

        let data = data.lock();
        assert_eq!(data.peak_hour, Some(1.23));
        assert_eq!(data.peak_hour_time, Some(m.timestamp));
    }

    #[test]
    fn test_peak_untouched_without_recorded_peak_or_when_lower() {
        let none = dataset(None);
        let higher = dataset(Some(2.0));
        let mut window = PowerWindow::new();
        let m = parse(measurement("2024-01-01T18:40:00+01:00", 3000.0, Some(1.5)));
        process_measurement(&m, &mut window, &none, TZ);
        process_measurement(&m, &mut window, &higher, TZ);

        assert_eq!(none.lock().peak_hour, None);
        assert_eq!(higher.lock().peak_hour, Some(2.0));
        assert_eq!(higher.lock().peak_hour_time, None);
    }

    #[test]
    fn test_unreadable_payload_is_forwarded() {
        let data = dataset(None);
        let mut window = PowerWindow::new();
        let update = build_update("h", json!({"other": 1}), &mut window, &data, TZ);
        assert!(update.measurement.is_none());
        assert!(update.estimated_hour_consumption.is_none());
        assert_eq!(update.payload, json!({"other": 1}));
    }

    #[tokio::test]
    async fn test_subscription_delivers_enriched_updates() {
        let transport = MockTransport::running();
        transport.script(vec![
            Ok(measurement("2024-01-01T12:29:50+01:00", 1000.0, None)),
            Ok(measurement("2024-01-01T12:30:00+01:00", 2000.0, Some(0.5))),
        ]);
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry, dataset(None), TZ);
        let (callback, mut rx) = collector();

        feed.subscribe(callback).await;

        let first = next(&mut rx).await;
        assert_eq!(first.home_id, "home-1");
        assert_eq!(first.estimated_hour_consumption, None);
        let second = next(&mut rx).await;
        assert_eq!(second.estimated_hour_consumption, Some(1.25));
        assert_eq!(
            second.payload["liveMeasurement"]["estimatedHourConsumption"],
            json!(1.25)
        );
        assert_eq!(transport.homes.lock().as_slice(), ["home-1".to_string()]);

        assert!(feed.subscription_running_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_watchdog_expires_while_transport_runs() {
        let transport = MockTransport::running();
        transport.script(vec![Ok(measurement("2024-01-01T12:00:00+01:00", 500.0, None))]);
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry, dataset(None), TZ);
        let (callback, mut rx) = collector();
        feed.subscribe(callback).await;
        next(&mut rx).await;
        tokio::task::yield_now().await;

        let last = feed.state().last_measurement_at.unwrap();
        assert!(feed.subscription_running_at(last + Duration::seconds(60)));
        assert!(!feed.subscription_running_at(last + Duration::seconds(61)));

        transport.running.store(false, Ordering::SeqCst);
        assert!(!feed.subscription_running_at(last));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_transport_never_ready() {
        let transport = Arc::new(MockTransport::default());
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry, dataset(None), TZ);
        let (callback, mut rx) = collector();
        feed.subscribe(callback).await;

        tokio::time::sleep(StdDuration::from_secs(29)).await;
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 0);
        tokio::time::sleep(StdDuration::from_secs(5)).await;

        // Becoming ready after the 30 attempts does not revive the listener
        transport.running.store(true, Ordering::SeqCst);
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
        assert!(!feed.state().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_transport_to_become_ready() {
        let transport = Arc::new(MockTransport::default());
        transport.script(vec![Ok(measurement("2024-01-01T12:00:00+01:00", 500.0, None))]);
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry, dataset(None), TZ);
        let (callback, mut rx) = collector();
        feed.subscribe(callback).await;

        tokio::time::sleep(StdDuration::from_secs(5)).await;
        transport.running.store(true, Ordering::SeqCst);
        let update = next(&mut rx).await;
        assert!(update.measurement.is_some());
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_stalls_feed_without_error() {
        let transport = MockTransport::running();
        transport.script(vec![
            Ok(measurement("2024-01-01T12:00:00+01:00", 500.0, None)),
            Err(TransportError::ConnectionClosed("going away".to_string())),
            Ok(measurement("2024-01-01T12:00:02+01:00", 500.0, None)),
        ]);
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry, dataset(None), TZ);
        let (callback, mut rx) = collector();
        feed.subscribe(callback).await;

        next(&mut rx).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(feed.state().ended);
        assert_eq!(feed.status_at(Utc::now()), FeedStatus::Stalled);
    }

    #[tokio::test]
    async fn test_protocol_error_ends_listener_quietly() {
        let transport = MockTransport::running();
        transport.script(vec![Err(TransportError::Protocol("bad frame".to_string()))]);
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry, dataset(None), TZ);
        let (callback, _rx) = collector();
        feed.subscribe(callback).await;

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!feed.state().running);
        assert_eq!(feed.status_at(Utc::now()), FeedStatus::Stalled);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_idle_listener() {
        let transport = MockTransport::running();
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry.clone(), dataset(None), TZ);
        let (callback, _rx) = collector();
        feed.subscribe(callback).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(feed.state().running);
        assert_eq!(feed.status_at(Utc::now()), FeedStatus::Starting);

        feed.unsubscribe().await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let state = feed.state();
        assert!(!state.running);
        assert!(!state.ended);
        assert_eq!(feed.status_at(Utc::now()), FeedStatus::Stopped);
        assert!(!feed.subscription_running());
        assert_eq!(registry.registered_homes(), 0);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_connection_fans_out_to_homes() {
        let transport = MockTransport::running();
        transport.script(vec![Ok(measurement("2024-01-01T12:00:00+01:00", 100.0, None))]);
        transport.script(vec![Ok(measurement("2024-01-01T12:00:00+01:00", 200.0, None))]);
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut a = RealtimeFeed::new("a", registry.clone(), dataset(None), TZ);
        let mut b = RealtimeFeed::new("b", registry.clone(), dataset(None), TZ);
        let (cb_a, mut rx_a) = collector();
        let (cb_b, mut rx_b) = collector();

        a.subscribe(cb_a).await;
        b.subscribe(cb_b).await;
        assert_eq!(next(&mut rx_a).await.home_id, "a");
        assert_eq!(next(&mut rx_b).await.home_id, "b");
        assert_eq!(registry.registered_homes(), 2);

        a.unsubscribe().await;
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 0);
        b.unsubscribe().await;
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_requirements() {
        let transport = MockTransport::running();
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry, dataset(None), TZ);

        feed.resubscribe(Some(true)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);

        let (callback, mut rx) = collector();
        feed.subscribe(callback).await;
        feed.unsubscribe().await;
        feed.resubscribe(Some(false)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

        transport.script(vec![Ok(measurement("2024-01-01T12:00:00+01:00", 100.0, None))]);
        feed.resubscribe(None).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert!(next(&mut rx).await.measurement.is_some());
    }

    #[tokio::test]
    async fn test_resubscribed_feed_runs_again() {
        let transport = MockTransport::running();
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry, dataset(None), TZ);
        let (callback, mut rx) = collector();
        feed.subscribe(callback).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(feed.state().running);

        feed.unsubscribe().await;
        transport.script(vec![Ok(measurement("2024-01-01T12:00:00+01:00", 100.0, None))]);
        feed.resubscribe(None).await;
        assert!(next(&mut rx).await.measurement.is_some());

        // Give the first listener time to wind down
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let state = feed.state();
        assert!(!state.ended);
        assert!(state.last_measurement_at.is_some());
        assert_eq!(feed.status_at(Utc::now()), FeedStatus::Running);
        assert!(feed.subscription_running());
    }

    #[tokio::test]
    async fn test_subscribing_twice_keeps_one_registration() {
        let transport = MockTransport::running();
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        let mut feed = RealtimeFeed::new("home-1", registry.clone(), dataset(None), TZ);
        let (callback, _rx) = collector();
        feed.subscribe(callback.clone()).await;
        feed.subscribe(callback).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(feed.status_at(Utc::now()), FeedStatus::Starting);

        feed.unsubscribe().await;
        assert_eq!(registry.registered_homes(), 0);
    }

    #[tokio::test]
    async fn test_dropped_feed_releases_registration() {
        let transport = MockTransport::running();
        let registry = Arc::new(ConnectionRegistry::new(transport.clone()));
        {
            let mut feed = RealtimeFeed::new("home-1", registry.clone(), dataset(None), TZ);
            let (callback, _rx) = collector();
            feed.subscribe(callback).await;
            assert_eq!(registry.registered_homes(), 1);
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(registry.registered_homes(), 0);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);

        // A feed that never subscribed releases nothing
        drop(RealtimeFeed::new("home-2", registry.clone(), dataset(None), TZ));
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }
}
