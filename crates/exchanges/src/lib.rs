pub mod backoff;
pub mod error;
pub mod feed;
pub mod interval;
pub mod registry;
pub mod rest;
pub mod symbol;
pub mod time;
pub mod types;
mod ws;

pub mod binance;
pub mod bybit;
pub mod hyperliquid;
pub mod okx;

pub use binance::BinanceExchange;
pub use bybit::BybitExchange;
pub use error::FeedError;
pub use feed::FeedHandle;
pub use hyperliquid::HyperliquidExchange;
pub use okx::OkxExchange;
pub use registry::ExchangeRegistry;
pub use types::{Candle, FundingRate, LargeTrade, Liquidation, OpenInterest, Side, SpikeAlert};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Features a venue connector may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
	Ohlc,
	FundingRate,
	OpenInterest,
	Liquidations,
	LargeTrades,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Capabilities {
	pub ohlc: bool,
	pub funding_rate: bool,
	pub open_interest: bool,
	pub liquidations: bool,
	pub large_trades: bool,
}

impl Capabilities {
	#[must_use]
	pub const fn all() -> Self {
		Self { ohlc: true, funding_rate: true, open_interest: true, liquidations: true, large_trades: true }
	}

	#[must_use]
	pub const fn none() -> Self {
		Self { ohlc: false, funding_rate: false, open_interest: false, liquidations: false, large_trades: false }
	}

	#[must_use]
	pub const fn supports(&self, feature: Feature) -> bool {
		match feature {
			Feature::Ohlc => self.ohlc,
			Feature::FundingRate => self.funding_rate,
			Feature::OpenInterest => self.open_interest,
			Feature::Liquidations => self.liquidations,
			Feature::LargeTrades => self.large_trades,
		}
	}
}

/// Common contract for venue connectors.
///
/// REST methods take snapshots; `stream_*` methods spawn a feed task that
/// owns one websocket, reconnects transparently with capped exponential
/// backoff, and ends when the returned handle is dropped. Connectors override
/// only what their venue supports; the defaults refuse with an error so the
/// registry can route capability checks before ever calling in.
#[async_trait]
pub trait Exchange: Send + Sync {
	fn name(&self) -> &'static str;

	fn capabilities(&self) -> Capabilities;

	fn supports(&self, feature: Feature) -> bool {
		self.capabilities().supports(feature)
	}

	async fn initialize(&self) -> Result<()> {
		Ok(())
	}

	async fn shutdown(&self) -> Result<()> {
		Ok(())
	}

	async fn health_check(&self) -> bool {
		true
	}

	async fn get_ohlc(&self, _symbol: &str, _interval: &str, _limit: u32) -> Result<Vec<Candle>> {
		anyhow::bail!("{} does not provide OHLC history", self.name())
	}

	async fn get_open_interest(&self, _symbol: &str) -> Result<OpenInterest> {
		anyhow::bail!("{} does not provide open interest", self.name())
	}

	async fn get_funding_rate(&self, _symbol: &str) -> Result<FundingRate> {
		anyhow::bail!("{} does not provide funding rates", self.name())
	}

	fn stream_ohlc(&self, _symbol: &str, _interval: &str) -> Result<FeedHandle<Candle>> {
		anyhow::bail!("{} does not stream OHLC", self.name())
	}

	fn stream_liquidations(&self, _symbol: &str) -> Result<FeedHandle<Liquidation>> {
		anyhow::bail!("{} does not stream liquidations", self.name())
	}

	fn stream_large_trades(&self, _symbol: &str, _min_value_usd: f64) -> Result<FeedHandle<LargeTrade>> {
		anyhow::bail!("{} does not stream trades", self.name())
	}
}
