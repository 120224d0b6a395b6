use super::FeedStatus;
use crate::bus::{BusEvent, EventBus, TOPIC_LIQUIDATION};
use anyhow::{Context, Result};
use exchanges::backoff::ReconnectPolicy;
use exchanges::{BinanceExchange, BybitExchange, OkxExchange};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff when the Bybit instrument listing comes back empty.
const SYMBOL_DISCOVERY_RETRY: Duration = Duration::from_secs(30);

/// Multi-venue liquidation aggregator.
///
/// One supervisor task per venue: Binance all-market force orders, OKX SWAP
/// liquidation orders, and Bybit per-symbol topics over the discovered USDT
/// perpetual listing. Venues fail independently; events at or above the
/// configured notional floor are published on the `liquidation` topic.
pub struct LiquidationsService {
	bus: Arc<EventBus>,
	binance: Arc<BinanceExchange>,
	okx: Arc<OkxExchange>,
	bybit: Arc<BybitExchange>,
	min_value_usd: f64,
	reconnect_cap: u64,
	status: Arc<FeedStatus>,
	running: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiquidationsService {
	pub fn new(bus: Arc<EventBus>, min_value_usd: f64, reconnect_cap: u64) -> Result<Self> {
		Ok(Self {
			bus,
			binance: Arc::new(
				BinanceExchange::with_reconnect_cap(reconnect_cap).context("liquidations: Binance connector")?,
			),
			okx: Arc::new(OkxExchange::with_reconnect_cap(reconnect_cap)),
			bybit: Arc::new(
				BybitExchange::with_reconnect_cap(reconnect_cap).context("liquidations: Bybit connector")?,
			),
			min_value_usd,
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
		info!(min_value_usd = self.min_value_usd, "starting liquidations aggregator");

		let mut tasks = self.tasks.lock().await;
		tasks.push(tokio::spawn(binance_loop(
			self.binance.clone(),
			self.bus.clone(),
			self.min_value_usd,
			self.reconnect_cap,
			self.status.clone(),
		)));
		tasks.push(tokio::spawn(okx_loop(
			self.okx.clone(),
			self.bus.clone(),
			self.min_value_usd,
			self.reconnect_cap,
			self.status.clone(),
		)));
		tasks.push(tokio::spawn(bybit_loop(
			self.bybit.clone(),
			self.bus.clone(),
			self.min_value_usd,
			self.reconnect_cap,
			self.status.clone(),
		)));
	}

	pub async fn stop(&self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}
		info!("stopping liquidations aggregator");

		let mut tasks = self.tasks.lock().await;
		for task in tasks.drain(..) {
			task.abort();
			let _ = task.await;
		}
	}
}

async fn binance_loop(
	exchange: Arc<BinanceExchange>,
	bus: Arc<EventBus>,
	min_value_usd: f64,
	reconnect_cap: u64,
	status: Arc<FeedStatus>,
) {
	let mut policy = ReconnectPolicy::new(reconnect_cap);

	loop {
		let mut feed = exchange.all_liquidations_session();
		let mut received_any = false;

		while let Some(liquidation) = feed.recv().await {
			if !received_any {
				received_any = true;
				policy.reset();
				status.set_degraded("binance", false);
			}
			if liquidation.value < min_value_usd {
				continue;
			}
			bus.publish(TOPIC_LIQUIDATION, BusEvent::Liquidation(liquidation)).await;
		}

		let delay = policy.next_delay();
		if policy.is_degraded() {
			status.set_degraded("binance", true);
		}
		warn!(venue = "binance", delay_secs = delay.as_secs_f64(), "liquidation stream ended, reconnecting");
		sleep(delay).await;
	}
}

async fn okx_loop(
	exchange: Arc<OkxExchange>,
	bus: Arc<EventBus>,
	min_value_usd: f64,
	reconnect_cap: u64,
	status: Arc<FeedStatus>,
) {
	let mut policy = ReconnectPolicy::new(reconnect_cap);

	loop {
		let mut feed = exchange.all_liquidations_session();
		let mut received_any = false;

		while let Some(liquidation) = feed.recv().await {
			if !received_any {
				received_any = true;
				policy.reset();
				status.set_degraded("okx", false);
			}
			if liquidation.value < min_value_usd {
				continue;
			}
			bus.publish(TOPIC_LIQUIDATION, BusEvent::Liquidation(liquidation)).await;
		}

		let delay = policy.next_delay();
		if policy.is_degraded() {
			status.set_degraded("okx", true);
		}
		warn!(venue = "okx", delay_secs = delay.as_secs_f64(), "liquidation stream ended, reconnecting");
		sleep(delay).await;
	}
}

/// Bybit needs explicit per-symbol topics, so the listing is fetched before
/// every connection; an empty listing backs off and retries.
async fn bybit_loop(
	exchange: Arc<BybitExchange>,
	bus: Arc<EventBus>,
	min_value_usd: f64,
	reconnect_cap: u64,
	status: Arc<FeedStatus>,
) {
	let mut policy = ReconnectPolicy::new(reconnect_cap);

	loop {
		let symbols = match exchange.usdt_perpetuals().await {
			Ok(symbols) => symbols,
			Err(e) => {
				warn!(venue = "bybit", error = %e, "instrument discovery failed");
				Vec::new()
			},
		};

		if symbols.is_empty() {
			status.set_degraded("bybit", true);
			warn!(venue = "bybit", "no instruments discovered, retrying in 30s");
			sleep(SYMBOL_DISCOVERY_RETRY).await;
			continue;
		}

		info!(venue = "bybit", instruments = symbols.len(), "subscribing liquidation topics");
		let mut feed = exchange.liquidations_session(&symbols);
		let mut received_any = false;

		while let Some(liquidation) = feed.recv().await {
			if !received_any {
				received_any = true;
				policy.reset();
				status.set_degraded("bybit", false);
			}
			if liquidation.value < min_value_usd {
				continue;
			}
			bus.publish(TOPIC_LIQUIDATION, BusEvent::Liquidation(liquidation)).await;
		}

		let delay = policy.next_delay();
		if policy.is_degraded() {
			status.set_degraded("bybit", true);
		}
		warn!(venue = "bybit", delay_secs = delay.as_secs_f64(), "liquidation stream ended, reconnecting");
		sleep(delay).await;
	}
}
