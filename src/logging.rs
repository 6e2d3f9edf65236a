use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Transport crates are capped at ERROR; everything else logs at `default_level`.
pub fn get_trace_filter(default_level: Level) -> filter::Targets {
    filter::Targets::new()
        .with_target("hyper", Level::ERROR)
        .with_target("reqwest", Level::ERROR)
        .with_target("rustls", Level::ERROR)
        .with_target("h2", Level::ERROR)
        .with_target("ethers_providers", Level::WARN)
        .with_default(default_level)
}

/// `info` when `level` is not a tracing level name.
pub fn parse_level(level: &str) -> Level {
    Level::from_str(level).unwrap_or(Level::INFO)
}

pub fn init(level: &str) {
    tracing_subscriber::registry()
        .with(get_trace_filter(parse_level(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
