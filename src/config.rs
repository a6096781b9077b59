use chrono_tz::Tz;
use std::env;
use tracing::{info, warn};

pub const DEFAULT_TIME_ZONE: &str = "Europe/Amsterdam";
pub const DEFAULT_API_URL: &str = "https://api.tibber.com/v1-beta/gql";
/// VAT percentage applied on top of excl-VAT components
pub const DEFAULT_BTW_PERCENTAGE: f64 = 21.0;
/// Purchasing compensation excl VAT, per kWh
pub const DEFAULT_PURCHASING_COMPENSATION: f64 = 0.0205;
/// Energy tax incl VAT, per kWh
pub const DEFAULT_ENERGY_TAX_INCL: f64 = 0.1228;
pub const DEFAULT_REFRESH_SECS: u64 = 300;

/// Pricing and connection settings for one account.
///
/// The price related fields are what the core needs; the API fields are only
/// read by the binary when it builds its GraphQL client.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub time_zone: Tz,
    /// Multiplier applied to excl-VAT prices, e.g. 1.21 for 21% VAT
    pub tax_rate: f64,
    pub purchasing_compensation: f64,
    pub energy_tax_excl: f64,
    pub energy_tax_incl: f64,
    pub api_url: String,
    pub api_token: String,
    pub home_id: String,
    pub refresh_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(
            chrono_tz::Europe::Amsterdam,
            DEFAULT_BTW_PERCENTAGE,
            DEFAULT_PURCHASING_COMPENSATION,
            DEFAULT_ENERGY_TAX_INCL,
        )
    }
}

impl Settings {
    /// Builds pricing settings from a VAT percentage; the excl-VAT energy tax is derived.
    pub fn new(
        time_zone: Tz,
        btw_percentage: f64,
        purchasing_compensation: f64,
        energy_tax_incl: f64,
    ) -> Self {
        let tax_rate = tax_multiplier(btw_percentage);
        Self {
            time_zone,
            tax_rate,
            purchasing_compensation,
            energy_tax_excl: energy_tax_incl / tax_rate,
            energy_tax_incl,
            api_url: DEFAULT_API_URL.to_string(),
            api_token: String::new(),
            home_id: String::new(),
            refresh_secs: DEFAULT_REFRESH_SECS,
        }
    }

    /// Reads settings from `TIBBER_*` environment variables, using defaults for anything unset
    pub fn from_env() -> Self {
        let time_zone = parse_time_zone(env::var("TIBBER_TIME_ZONE").ok());
        let btw = parse_f64_or(
            "TIBBER_BTW_PERCENTAGE",
            env::var("TIBBER_BTW_PERCENTAGE").ok(),
            DEFAULT_BTW_PERCENTAGE,
        );
        let compensation = parse_f64_or(
            "TIBBER_PURCHASING_COMPENSATION",
            env::var("TIBBER_PURCHASING_COMPENSATION").ok(),
            DEFAULT_PURCHASING_COMPENSATION,
        );
        let energy_tax_incl = parse_f64_or(
            "TIBBER_ENERGY_TAX_INCL",
            env::var("TIBBER_ENERGY_TAX_INCL").ok(),
            DEFAULT_ENERGY_TAX_INCL,
        );

        let mut settings = Self::new(time_zone, btw, compensation, energy_tax_incl);
        settings.api_url = env::var("TIBBER_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        settings.api_token = env::var("TIBBER_TOKEN").unwrap_or_default();
        settings.home_id = env::var("TIBBER_HOME_ID").unwrap_or_default();
        settings.refresh_secs = env::var("TIBBER_REFRESH_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REFRESH_SECS);

        info!(
            time_zone = %settings.time_zone,
            tax_rate = settings.tax_rate,
            purchasing_compensation = settings.purchasing_compensation,
            energy_tax_incl = settings.energy_tax_incl,
            "Loaded pricing settings"
        );
        settings
    }

    /// VAT as a percentage, e.g. 21.0
    pub fn tax_rate_percent(&self) -> f64 {
        (self.tax_rate - 1.0) * 100.0
    }
}

fn tax_multiplier(btw_percentage: f64) -> f64 {
    1.0 + btw_percentage / 100.0
}

fn parse_time_zone(val: Option<String>) -> Tz {
    match val {
        None => chrono_tz::Europe::Amsterdam,
        Some(name) => name.parse().unwrap_or_else(|_| {
            warn!("Unknown time zone `{name}`, using {DEFAULT_TIME_ZONE}");
            chrono_tz::Europe::Amsterdam
        }),
    }
}

/// Parses a float setting, falling back to the default on missing or bad input
fn parse_f64_or(name: &str, val: Option<String>, default: f64) -> f64 {
    match val {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value `{raw}` for {name}, using {default}");
            default
        }),
    }
}
