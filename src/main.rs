use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tibber_home::{GraphQlClient, Home, RankWindow, Settings};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();
    if settings.home_id.is_empty() {
        anyhow::bail!("TIBBER_HOME_ID is not set");
    }
    let refresh = Duration::from_secs(settings.refresh_secs.max(1));
    let client = GraphQlClient::new(settings.api_url.clone(), settings.api_token.clone());
    let mut home = Home::new(settings.home_id.clone(), Arc::new(client), settings);

    info!("Starting Tibber price refresher for home {}", home.home_id());
    let mut interval = tokio::time::interval(refresh);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("Could not listen for shutdown signal")?;
                info!("Shutting down");
                return Ok(());
            }
        }

        home.update_info_and_price_info().await;
        home.fetch_consumption_data().await;
        if home.has_production() {
            home.fetch_production_data().await;
        }
        log_metrics(&home);
    }
}

fn log_metrics(home: &Home) {
    let prices = home.prices();
    if prices.table().entries.is_empty() {
        warn!("No price data for {}", home.name());
        return;
    }
    info!(
        home = %home.name(),
        price = ?prices.electricity_price(),
        unit = %home.price_unit(),
        today_min = ?prices.today_min(),
        today_max = ?prices.today_max(),
        today_avg = ?prices.today_avg(),
        rank = home.price_rank(RankWindow::FullDay),
        "Prices"
    );
    info!(
        month_consumption = ?home.month_cons(),
        month_cost = ?home.month_cost(),
        peak_hour = ?home.peak_hour(),
        peak_hour_time = ?home.peak_hour_time(),
        month_production = ?home.month_production(),
        "Usage"
    );
}
