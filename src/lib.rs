//! Tibber Home Library
//!
//! Keeps a per-home view of electricity prices, hourly consumption and production
//! history and live power measurements, and derives the metrics a dashboard needs:
//! current price, price rank within the day, monthly totals and the peak hour.

pub mod config;
pub mod data_source;
pub mod error;
pub mod graphql_client;
pub mod historic;
pub mod home;
pub mod power_window;
pub mod price_cache;
pub mod queries;
pub mod ranking;
pub mod realtime;

// Re-export commonly used types for easier access
pub use config::Settings;
pub use data_source::DataSource;
pub use error::{ApiError, TransportError};
pub use graphql_client::GraphQlClient;
pub use historic::{HistoricMerger, HourlyDataSet};
pub use home::Home;
pub use price_cache::PriceCache;
pub use ranking::{current_price_rank, RankWindow, RankingEngine};
pub use realtime::{ConnectionRegistry, LiveUpdate, RealtimeFeed, StreamingTransport};
