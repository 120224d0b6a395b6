pub mod bus;
pub mod config;
pub mod http;
pub mod services;
pub mod ws;

use crate::bus::EventBus;
use crate::config::Config;
use crate::ws::{CandleSource, MultiOhlcSettings};
use exchanges::ExchangeRegistry;
use std::sync::Arc;

/// Shared dependencies for the websocket endpoint handlers. Everything is
/// injected (no process-wide singletons) so tests can run each endpoint
/// against a fresh bus and scripted candle sources.
pub struct AppContext {
	pub config: Config,
	pub bus: Arc<EventBus>,
	pub registry: Arc<ExchangeRegistry>,
	pub candles: Arc<dyn CandleSource>,
	pub multi_ohlc: MultiOhlcSettings,
}
