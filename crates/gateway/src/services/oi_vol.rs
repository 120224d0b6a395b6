use super::FeedStatus;
use crate::bus::{BusEvent, EventBus, TOPIC_OI_SPIKE};
use crate::config::OiVolConfig;
use anyhow::{Context, Result};
use chrono::Utc;
use exchanges::{BinanceExchange, Exchange, SpikeAlert};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

pub const TIMEFRAMES: [&str; 3] = ["5m", "15m", "1h"];

/// Observations kept per (symbol, timeframe) window.
const WINDOW_CAP: usize = 100;
/// Below this many samples the z-score is defined as 0.
const MIN_SAMPLES: usize = 5;
/// Rows fetched per cycle from the OI-history and kline endpoints.
const FETCH_LIMIT: u32 = 50;
/// Pause between per-symbol fetch rounds to stay inside venue rate limits.
const SYMBOL_PACING: Duration = Duration::from_millis(200);

const DISCOVERY_RETRY: Duration = Duration::from_secs(30);

/// Rolling window of the most recent observations, capped in length.
#[derive(Debug)]
pub struct RollingWindow {
	values: VecDeque<f64>,
	cap: usize,
}

impl RollingWindow {
	#[must_use]
	pub fn new(cap: usize) -> Self {
		Self { values: VecDeque::with_capacity(cap), cap }
	}

	pub fn push(&mut self, value: f64) {
		self.values.push_back(value);
		while self.values.len() > self.cap {
			self.values.pop_front();
		}
	}

	pub fn extend(&mut self, values: impl IntoIterator<Item = f64>) {
		for value in values {
			self.push(value);
		}
	}

	#[must_use]
	pub fn last(&self) -> Option<f64> {
		self.values.back().copied()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.values.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	/// Z-score of the latest observation against the window:
	/// `(last - mean) / stdev` with the sample standard deviation, or 0 when
	/// the window is short or flat.
	#[must_use]
	pub fn z_score(&self) -> f64 {
		let n = self.values.len();
		if n < MIN_SAMPLES {
			return 0.0;
		}

		let mean = self.values.iter().sum::<f64>() / n as f64;
		let variance = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
		let stdev = variance.sqrt();
		if stdev > 0.0 {
			let Some(last) = self.last() else { return 0.0 };
			(last - mean) / stdev
		} else {
			0.0
		}
	}
}

struct SymbolWindows {
	oi: RollingWindow,
	vol: RollingWindow,
}

impl SymbolWindows {
	fn new() -> Self {
		Self { oi: RollingWindow::new(WINDOW_CAP), vol: RollingWindow::new(WINDOW_CAP) }
	}
}

/// Binance OI/volume spike monitor.
///
/// Every cycle it refreshes per-(symbol, timeframe) windows of open-interest
/// notional and quote volume, computes z-scores of the latest observation,
/// and publishes `oi_spike` events when either crosses the timeframe
/// threshold (confirmed when both do). Absolute OI and volume floors
/// suppress low-liquidity noise.
pub struct OiVolMonitor {
	bus: Arc<EventBus>,
	binance: Arc<BinanceExchange>,
	config: OiVolConfig,
	status: Arc<FeedStatus>,
	running: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl OiVolMonitor {
	pub fn new(bus: Arc<EventBus>, config: OiVolConfig, reconnect_cap: u64) -> Result<Self> {
		Ok(Self {
			bus,
			binance: Arc::new(
				BinanceExchange::with_reconnect_cap(reconnect_cap).context("oi/vol monitor: Binance connector")?,
			),
			config,
			status: Arc::new(FeedStatus::default()),
			running: AtomicBool::new(false),
			task: Mutex::new(None),
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
		info!(cycle_seconds = self.config.cycle_seconds, "starting OI/Vol monitor");

		let mut task = self.task.lock().await;
		*task = Some(tokio::spawn(run(
			self.binance.clone(),
			self.bus.clone(),
			self.config.clone(),
			self.status.clone(),
		)));
	}

	pub async fn stop(&self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}
		info!("stopping OI/Vol monitor");

		let mut task = self.task.lock().await;
		if let Some(task) = task.take() {
			task.abort();
			let _ = task.await;
		}
	}
}

async fn run(binance: Arc<BinanceExchange>, bus: Arc<EventBus>, config: OiVolConfig, status: Arc<FeedStatus>) {
	let symbols = loop {
		match binance.usdt_perpetuals().await {
			Ok(mut symbols) if !symbols.is_empty() => {
				symbols.truncate(config.symbols_limit);
				break symbols;
			},
			Ok(_) => warn!("symbol discovery returned nothing, retrying"),
			Err(e) => warn!(error = %e, "symbol discovery failed, retrying"),
		}
		status.set_degraded("binance", true);
		sleep(DISCOVERY_RETRY).await;
	};
	status.set_degraded("binance", false);
	info!(symbols = symbols.len(), "OI/Vol monitor tracking symbols");

	let mut windows: HashMap<(String, &'static str), SymbolWindows> = HashMap::new();

	loop {
		let cycle_start = Instant::now();

		for sym in &symbols {
			for tf in TIMEFRAMES {
				let Some(thresholds) = config.thresholds(tf) else {
					continue;
				};

				let oi_rows = binance.get_open_interest_hist(sym, tf, FETCH_LIMIT).await.unwrap_or_default();
				let candles = binance.get_ohlc(sym, tf, FETCH_LIMIT).await.unwrap_or_default();
				if oi_rows.is_empty() || candles.is_empty() {
					continue;
				}

				let entry = windows.entry((sym.clone(), tf)).or_insert_with(SymbolWindows::new);
				entry.oi.extend(oi_rows.into_iter().map(|(_, value)| value));
				entry.vol.extend(candles.into_iter().map(|c| c.quote_volume));

				let (Some(last_oi), Some(last_vol)) = (entry.oi.last(), entry.vol.last()) else {
					continue;
				};
				if last_oi < thresholds.min_oi_usd || last_vol < thresholds.min_vol_usd {
					continue;
				}

				let z_oi = entry.oi.z_score();
				let z_vol = entry.vol.z_score();
				let threshold = thresholds.z_threshold;

				if z_oi >= threshold || z_vol >= threshold {
					let alert = SpikeAlert {
						exchange: "binance".to_string(),
						symbol: sym.clone(),
						timeframe: tf.to_string(),
						z_oi: round2(z_oi),
						z_vol: round2(z_vol),
						confirmed: z_oi >= threshold && z_vol >= threshold,
						timestamp: Utc::now(),
					};
					info!(symbol = %sym, timeframe = tf, z_oi = alert.z_oi, z_vol = alert.z_vol, confirmed = alert.confirmed, "OI/volume spike");
					bus.publish(TOPIC_OI_SPIKE, BusEvent::OiSpike(alert)).await;
				}
			}

			sleep(SYMBOL_PACING).await;
		}

		let elapsed = cycle_start.elapsed();
		info!(
			elapsed_secs = elapsed.as_secs_f64(),
			next_in = config.cycle_seconds,
			"OI/Vol monitor cycle finished"
		);
		sleep(Duration::from_secs(config.cycle_seconds)).await;
	}
}

fn round2(value: f64) -> f64 {
	(value * 100.0).round() / 100.0
}
