use super::{FeedStatus, SUPERVISOR_RESTART_DELAY};
use crate::bus::{BusEvent, EventBus, TOPIC_LARGE_TRADE};
use anyhow::{Context, Result};
use exchanges::backoff::ReconnectPolicy;
use exchanges::{BinanceExchange, BybitExchange, Exchange, HyperliquidExchange, symbol};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

/// Multi-venue large-trade aggregator for the configured symbol set.
///
/// Binance runs one aggTrade socket per symbol; Bybit and Hyperliquid batch
/// all symbols onto one connection each. Only trades at or above the USD
/// threshold reach the `large_trade` topic.
pub struct LargeTradesService {
	bus: Arc<EventBus>,
	binance: Arc<BinanceExchange>,
	bybit: Arc<BybitExchange>,
	hyperliquid: Arc<HyperliquidExchange>,
	symbols: Vec<String>,
	threshold_usd: f64,
	reconnect_cap: u64,
	status: Arc<FeedStatus>,
	running: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LargeTradesService {
	pub fn new(bus: Arc<EventBus>, symbols: Vec<String>, threshold_usd: f64, reconnect_cap: u64) -> Result<Self> {
		Ok(Self {
			bus,
			binance: Arc::new(
				BinanceExchange::with_reconnect_cap(reconnect_cap).context("large trades: Binance connector")?,
			),
			bybit: Arc::new(
				BybitExchange::with_reconnect_cap(reconnect_cap).context("large trades: Bybit connector")?,
			),
			hyperliquid: Arc::new(
				HyperliquidExchange::with_reconnect_cap(reconnect_cap).context("large trades: Hyperliquid connector")?,
			),
			symbols,
			threshold_usd,
			reconnect_cap,
			status: Arc::new(FeedStatus::default()),
			running: AtomicBool::new(false),
			tasks: Mutex::new(Vec::new()),
		})
	}

	#[must_use]
	pub fn status(&self) -> Arc<FeedStatus> {
		self.status.clone()
	}

	pub async fn start(&self) {
		if self.running.swap(true, Ordering::SeqCst) {
			return;
		}
		info!(
			symbols = self.symbols.join(","),
			threshold_usd = self.threshold_usd,
			"starting large trades aggregator"
		);

		let mut tasks = self.tasks.lock().await;

		for sym in &self.symbols {
			tasks.push(tokio::spawn(binance_symbol_loop(
				self.binance.clone(),
				self.bus.clone(),
				sym.clone(),
				self.threshold_usd,
				self.status.clone(),
			)));
		}

		tasks.push(tokio::spawn(bybit_loop(
			self.bybit.clone(),
			self.bus.clone(),
			self.symbols.clone(),
			self.threshold_usd,
			self.reconnect_cap,
			self.status.clone(),
		)));

		tasks.push(tokio::spawn(hyperliquid_loop(
			self.hyperliquid.clone(),
			self.bus.clone(),
			self.symbols.iter().map(|s| symbol::to_coin(s)).collect(),
			self.threshold_usd,
			self.reconnect_cap,
			self.status.clone(),
		)));
	}

	pub async fn stop(&self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}
		info!("stopping large trades aggregator");

		let mut tasks = self.tasks.lock().await;
		for task in tasks.drain(..) {
			task.abort();
			let _ = task.await;
		}
	}
}

/// The per-symbol Binance feed reconnects internally; this loop only restarts
/// it if the feed task itself dies.
async fn binance_symbol_loop(
	exchange: Arc<BinanceExchange>,
	bus: Arc<EventBus>,
	sym: String,
	threshold_usd: f64,
	status: Arc<FeedStatus>,
) {
	loop {
		let mut feed = match exchange.stream_large_trades(&sym, threshold_usd) {
			Ok(feed) => feed,
			Err(e) => {
				warn!(venue = "binance", symbol = %sym, error = %e, "failed to open trade stream");
				sleep(SUPERVISOR_RESTART_DELAY).await;
				continue;
			},
		};

		status.set_degraded("binance", false);
		while let Some(trade) = feed.recv().await {
			if trade.value < threshold_usd {
				continue;
			}
			bus.publish(TOPIC_LARGE_TRADE, BusEvent::LargeTrade(trade)).await;
		}

		status.set_degraded("binance", true);
		warn!(venue = "binance", symbol = %sym, "trade feed task ended, restarting");
		sleep(SUPERVISOR_RESTART_DELAY).await;
	}
}

async fn bybit_loop(
	exchange: Arc<BybitExchange>,
	bus: Arc<EventBus>,
	symbols: Vec<String>,
	threshold_usd: f64,
	reconnect_cap: u64,
	status: Arc<FeedStatus>,
) {
	let mut policy = ReconnectPolicy::new(reconnect_cap);

	loop {
		info!(venue = "bybit", topics = symbols.len(), "subscribing trade topics");
		let mut feed = exchange.trades_session(&symbols);
		let mut received_any = false;

		while let Some(trade) = feed.recv().await {
			if !received_any {
				received_any = true;
				policy.reset();
				status.set_degraded("bybit", false);
			}
			if trade.value < threshold_usd {
				continue;
			}
			bus.publish(TOPIC_LARGE_TRADE, BusEvent::LargeTrade(trade)).await;
		}

		let delay = policy.next_delay();
		if policy.is_degraded() {
			status.set_degraded("bybit", true);
		}
		warn!(venue = "bybit", delay_secs = delay.as_secs_f64(), "trade stream ended, reconnecting");
		sleep(delay).await;
	}
}

async fn hyperliquid_loop(
	exchange: Arc<HyperliquidExchange>,
	bus: Arc<EventBus>,
	coins: Vec<String>,
	threshold_usd: f64,
	reconnect_cap: u64,
	status: Arc<FeedStatus>,
) {
	let mut policy = ReconnectPolicy::new(reconnect_cap);

	loop {
		info!(venue = "hyperliquid", coins = coins.len(), "subscribing trade streams");
		let mut feed = exchange.trades_session(&coins);
		let mut received_any = false;

		while let Some(trade) = feed.recv().await {
			if !received_any {
				received_any = true;
				policy.reset();
				status.set_degraded("hyperliquid", false);
			}
			if trade.value < threshold_usd {
				continue;
			}
			bus.publish(TOPIC_LARGE_TRADE, BusEvent::LargeTrade(trade)).await;
		}

		let delay = policy.next_delay();
		if policy.is_degraded() {
			status.set_degraded("hyperliquid", true);
		}
		warn!(venue = "hyperliquid", delay_secs = delay.as_secs_f64(), "trade stream ended, reconnecting");
		sleep(delay).await;
	}
}
