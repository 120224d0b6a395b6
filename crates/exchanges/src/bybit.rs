use crate::backoff::DEFAULT_MAX_RECONNECT_SECONDS;
use crate::error::FeedError;
use crate::feed::{FeedHandle, spawn_feed};
use crate::rest::RestClient;
use crate::time::to_utc_datetime_or_epoch;
use crate::types::{Candle, FundingRate, LargeTrade, Liquidation, OpenInterest, Side};
use crate::ws::{Keepalive, run_feed, run_feed_once};
use crate::{Capabilities, Exchange, interval};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const API_BASE: &str = "https://api.bybit.com";
const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

/// Topics per subscribe frame; Bybit caps the args array size.
const SUBSCRIBE_BATCH_SIZE: usize = 100;
const SUBSCRIBE_PACING: Duration = Duration::from_millis(50);

/// Bybit expects an application-level ping on public streams.
const KEEPALIVE: Keepalive = Keepalive::Text(r#"{"op":"ping"}"#);

/// Bybit linear perpetuals connector.
pub struct BybitExchange {
	rest: RestClient,
	max_reconnect_seconds: u64,
}

impl BybitExchange {
	pub fn new() -> Result<Self> {
		Self::with_reconnect_cap(DEFAULT_MAX_RECONNECT_SECONDS)
	}

	pub fn with_reconnect_cap(max_reconnect_seconds: u64) -> Result<Self> {
		let rest = RestClient::new().context("failed to create Bybit REST session")?;
		Ok(Self { rest, max_reconnect_seconds })
	}

	/// USDT-quoted linear perpetuals currently trading.
	pub async fn usdt_perpetuals(&self) -> Result<Vec<String>> {
		let url = format!("{API_BASE}/v5/market/instruments-info");
		let query = [("category", "linear".to_string()), ("limit", "1000".to_string())];
		let response: InstrumentsResponse = self.rest.get_json(&url, &query).await?;

		if response.ret_code != 0 {
			anyhow::bail!("Bybit instruments API error: {}", response.ret_msg);
		}

		Ok(
			response
				.result
				.list
				.into_iter()
				.filter(|s| s.status == "Trading" && s.quote_coin == "USDT" && s.contract_type == "LinearPerpetual")
				.map(|s| s.symbol)
				.collect(),
		)
	}

	/// Liquidation stream over many `allLiquidation.*` topics. One connection
	/// per session; the handle ends on disconnect so callers can refresh the
	/// symbol universe before resubscribing.
	pub fn liquidations_session(&self, symbols: &[String]) -> FeedHandle<Liquidation> {
		let topics: Vec<String> = symbols.iter().map(|s| format!("allLiquidation.{}", s.to_uppercase())).collect();
		let frames = subscribe_frames(&topics);

		spawn_feed(move |tx| {
			run_feed_once(
				"bybit:all_liquidations",
				WS_URL.to_string(),
				frames,
				Some(SUBSCRIBE_PACING),
				KEEPALIVE,
				tx,
				parse_liquidation_frame,
			)
		})
	}

	/// Trade stream over many `publicTrade.*` topics; unfiltered, single
	/// session per call as with [`Self::liquidations_session`].
	pub fn trades_session(&self, symbols: &[String]) -> FeedHandle<LargeTrade> {
		let topics: Vec<String> = symbols.iter().map(|s| format!("publicTrade.{}", s.to_uppercase())).collect();
		let frames = subscribe_frames(&topics);

		spawn_feed(move |tx| {
			run_feed_once(
				"bybit:public_trades",
				WS_URL.to_string(),
				frames,
				Some(SUBSCRIBE_PACING),
				KEEPALIVE,
				tx,
				|text| parse_public_trade_frame(text, 0.0),
			)
		})
	}
}

#[async_trait]
impl Exchange for BybitExchange {
	fn name(&self) -> &'static str {
		"bybit"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities::all()
	}

	async fn health_check(&self) -> bool {
		self.rest.ping(&format!("{API_BASE}/v5/market/time")).await
	}

	async fn get_ohlc(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
		let url = format!("{API_BASE}/v5/market/kline");
		let query = [
			("category", "linear".to_string()),
			("symbol", symbol.to_uppercase()),
			("interval", interval::to_bybit(interval)),
			("limit", limit.to_string()),
		];
		let response: KlineResponse = self.rest.get_json(&url, &query).await?;

		if response.ret_code != 0 {
			anyhow::bail!("Bybit kline API error: {}", response.ret_msg);
		}

		// Bybit returns newest first; normalize to oldest first.
		let mut candles: Vec<Candle> = response
			.result
			.list
			.into_iter()
			.filter_map(|row| {
				Some(Candle {
					exchange: "bybit".to_string(),
					symbol: symbol.to_uppercase(),
					interval: interval.to_string(),
					timestamp: to_utc_datetime_or_epoch(row.0.parse().ok()?),
					open: row.1.parse().ok()?,
					high: row.2.parse().ok()?,
					low: row.3.parse().ok()?,
					close: row.4.parse().ok()?,
					volume: row.5.parse().ok()?,
					quote_volume: row.6.parse().ok()?,
					trades_count: 0,
					is_closed: true,
				})
			})
			.collect();
		candles.reverse();

		Ok(candles)
	}

	async fn get_open_interest(&self, symbol: &str) -> Result<OpenInterest> {
		let url = format!("{API_BASE}/v5/market/open-interest");
		let query = [
			("category", "linear".to_string()),
			("symbol", symbol.to_uppercase()),
			("intervalTime", "5min".to_string()),
			("limit", "1".to_string()),
		];
		let response: OpenInterestResponse = self.rest.get_json(&url, &query).await?;

		if response.ret_code != 0 {
			anyhow::bail!("Bybit open interest API error: {}", response.ret_msg);
		}

		let entry = response.result.list.first().context("Bybit returned no open interest data")?;
		let open_interest =
			entry.open_interest.parse::<f64>().with_context(|| format!("unparseable openInterest for {symbol}"))?;

		let tickers_url = format!("{API_BASE}/v5/market/tickers");
		let tickers_query = [("category", "linear".to_string()), ("symbol", symbol.to_uppercase())];
		let tickers: TickersResponse = self.rest.get_json(&tickers_url, &tickers_query).await?;
		let mark_price = tickers.result.list.first().and_then(|t| t.mark_price.parse::<f64>().ok());

		Ok(OpenInterest {
			exchange: "bybit".to_string(),
			symbol: symbol.to_uppercase(),
			timestamp: to_utc_datetime_or_epoch(entry.timestamp.parse().unwrap_or(0)),
			open_interest,
			open_interest_value: mark_price.map(|mark| open_interest * mark),
		})
	}

	async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate> {
		let url = format!("{API_BASE}/v5/market/funding/history");
		let query =
			[("category", "linear".to_string()), ("symbol", symbol.to_uppercase()), ("limit", "1".to_string())];
		let response: FundingHistoryResponse = self.rest.get_json(&url, &query).await?;

		if response.ret_code != 0 {
			anyhow::bail!("Bybit funding API error: {}", response.ret_msg);
		}

		let entry = response.result.list.first().context("Bybit returned no funding history")?;
		let funding_rate =
			entry.funding_rate.parse::<f64>().with_context(|| format!("unparseable fundingRate for {symbol}"))?;
		let funding_time = to_utc_datetime_or_epoch(entry.funding_rate_timestamp.parse().unwrap_or(0));

		Ok(FundingRate {
			exchange: "bybit".to_string(),
			symbol: symbol.to_uppercase(),
			timestamp: funding_time,
			funding_rate,
			funding_time,
			next_funding_rate: None,
			next_funding_time: None,
		})
	}

	fn stream_ohlc(&self, symbol: &str, interval: &str) -> Result<FeedHandle<Candle>> {
		let symbol_upper = symbol.to_uppercase();
		let canonical = interval.to_string();
		let topic = format!("kline.{}.{}", interval::to_bybit(interval), symbol_upper);
		let frames = subscribe_frames(std::slice::from_ref(&topic));
		let max_backoff = self.max_reconnect_seconds;

		Ok(spawn_feed(move |tx| {
			run_feed("bybit:kline", WS_URL.to_string(), frames, None, KEEPALIVE, max_backoff, tx, move |text| {
				parse_kline_frame(&topic, &symbol_upper, &canonical, text)
			})
		}))
	}

	fn stream_liquidations(&self, symbol: &str) -> Result<FeedHandle<Liquidation>> {
		let topic = format!("allLiquidation.{}", symbol.to_uppercase());
		let frames = subscribe_frames(std::slice::from_ref(&topic));
		let max_backoff = self.max_reconnect_seconds;

		Ok(spawn_feed(move |tx| {
			run_feed("bybit:liquidation", WS_URL.to_string(), frames, None, KEEPALIVE, max_backoff, tx, parse_liquidation_frame)
		}))
	}

	fn stream_large_trades(&self, symbol: &str, min_value_usd: f64) -> Result<FeedHandle<LargeTrade>> {
		let topic = format!("publicTrade.{}", symbol.to_uppercase());
		let frames = subscribe_frames(std::slice::from_ref(&topic));
		let max_backoff = self.max_reconnect_seconds;

		Ok(spawn_feed(move |tx| {
			run_feed("bybit:public_trade", WS_URL.to_string(), frames, None, KEEPALIVE, max_backoff, tx, move |text| {
				parse_public_trade_frame(text, min_value_usd)
			})
		}))
	}
}

/// `{op: subscribe, args: [...]}` frames, batched to the venue's topic cap.
fn subscribe_frames(topics: &[String]) -> Vec<String> {
	topics
		.chunks(SUBSCRIBE_BATCH_SIZE)
		.map(|batch| serde_json::json!({ "op": "subscribe", "args": batch }).to_string())
		.collect()
}

/// Shared control-frame handling: acks parse to empty batches, a failed ack
/// surfaces as a rejection. Returns None for data frames.
fn handle_control_frame(value: &Value) -> Option<Result<(), FeedError>> {
	let op = value.get("op").and_then(Value::as_str)?;
	if op == "subscribe" && value.get("success").and_then(Value::as_bool) == Some(false) {
		let reason = value.get("ret_msg").and_then(Value::as_str).unwrap_or("subscribe failed").to_string();
		return Some(Err(FeedError::SubscriptionRejected(reason)));
	}
	debug!(op, "bybit control frame");
	Some(Ok(()))
}

fn parse_kline_frame(topic: &str, symbol: &str, interval: &str, text: &str) -> Result<Vec<Candle>, FeedError> {
	let value: Value = serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("kline frame: {e}")))?;

	if let Some(control) = handle_control_frame(&value) {
		return control.map(|()| Vec::new());
	}

	if value.get("topic").and_then(Value::as_str) != Some(topic) {
		debug!(stream = "bybit:kline", "dropping frame for different topic");
		return Ok(Vec::new());
	}

	let entries: Vec<KlineEntry> = serde_json::from_value(value.get("data").cloned().unwrap_or_default())
		.map_err(|e| FeedError::Malformed(format!("kline frame: {e}")))?;

	let mut candles = Vec::new();
	for entry in entries {
		candles.push(Candle {
			exchange: "bybit".to_string(),
			symbol: symbol.to_string(),
			interval: interval.to_string(),
			timestamp: to_utc_datetime_or_epoch(entry.start),
			open: parse_f64(&entry.open, "open")?,
			high: parse_f64(&entry.high, "high")?,
			low: parse_f64(&entry.low, "low")?,
			close: parse_f64(&entry.close, "close")?,
			volume: parse_f64(&entry.volume, "volume")?,
			quote_volume: parse_f64(&entry.turnover, "turnover")?,
			trades_count: 0,
			is_closed: entry.confirm,
		});
	}

	Ok(candles)
}

fn parse_public_trade_frame(text: &str, min_value_usd: f64) -> Result<Vec<LargeTrade>, FeedError> {
	let value: Value = serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("trade frame: {e}")))?;

	if let Some(control) = handle_control_frame(&value) {
		return control.map(|()| Vec::new());
	}

	let Some(topic) = value.get("topic").and_then(Value::as_str) else {
		return Ok(Vec::new());
	};
	let Some(topic_symbol) = topic.strip_prefix("publicTrade.") else {
		debug!(stream = "bybit:public_trade", topic, "dropping frame for different topic");
		return Ok(Vec::new());
	};
	let topic_symbol = topic_symbol.to_string();

	let entries: Vec<TradeTick> = serde_json::from_value(value.get("data").cloned().unwrap_or_default())
		.map_err(|e| FeedError::Malformed(format!("trade frame: {e}")))?;

	let mut trades = Vec::new();
	for entry in entries {
		let price = parse_f64(&entry.price, "p")?;
		let quantity = parse_f64(&entry.quantity, "v")?;
		let value_usd = price * quantity;
		if value_usd < min_value_usd {
			continue;
		}

		trades.push(LargeTrade {
			exchange: "bybit".to_string(),
			symbol: entry.symbol.clone().unwrap_or_else(|| topic_symbol.clone()),
			side: Side::from_venue(&entry.side).unwrap_or(Side::Sell),
			price,
			quantity,
			value: value_usd,
			// Bybit does not expose the maker bit on public trades.
			is_buyer_maker: false,
			timestamp: to_utc_datetime_or_epoch(entry.time),
		});
	}

	Ok(trades)
}

fn parse_liquidation_frame(text: &str) -> Result<Vec<Liquidation>, FeedError> {
	let value: Value =
		serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("liquidation frame: {e}")))?;

	if let Some(control) = handle_control_frame(&value) {
		return control.map(|()| Vec::new());
	}

	let Some(topic) = value.get("topic").and_then(Value::as_str) else {
		return Ok(Vec::new());
	};
	let Some(topic_symbol) = topic.strip_prefix("allLiquidation.") else {
		debug!(stream = "bybit:all_liquidations", topic, "dropping frame for different topic");
		return Ok(Vec::new());
	};
	let topic_symbol = topic_symbol.to_string();

	let entries: Vec<TradeTick> = serde_json::from_value(value.get("data").cloned().unwrap_or_default())
		.map_err(|e| FeedError::Malformed(format!("liquidation frame: {e}")))?;

	let mut records = Vec::new();
	for entry in entries {
		let price = parse_f64(&entry.price, "p")?;
		let quantity = parse_f64(&entry.quantity, "v")?;

		records.push(Liquidation {
			exchange: "bybit".to_string(),
			symbol: entry.symbol.clone().unwrap_or_else(|| topic_symbol.clone()),
			side: Side::from_venue(&entry.side).unwrap_or(Side::Sell),
			price,
			quantity,
			value: price * quantity,
			timestamp: to_utc_datetime_or_epoch(entry.time),
		});
	}

	Ok(records)
}

fn parse_f64(raw: &str, field: &str) -> Result<f64, FeedError> {
	raw.parse::<f64>().map_err(|_| FeedError::Malformed(format!("unparseable {field}: {raw}")))
}

// Bybit REST response types.
// https://bybit-exchange.github.io/docs/v5/market/instrument

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentsResponse {
	ret_code: i32,
	ret_msg: String,
	result: InstrumentsResult,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResult {
	list: Vec<InstrumentInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentInfo {
	symbol: String,
	contract_type: String,
	status: String,
	quote_coin: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KlineResponse {
	ret_code: i32,
	ret_msg: String,
	result: KlineResult,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
	list: Vec<KlineRow>,
}

// [startTime, open, high, low, close, volume, turnover]
type KlineRow = (String, String, String, String, String, String, String);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenInterestResponse {
	ret_code: i32,
	ret_msg: String,
	result: OpenInterestResult,
}

#[derive(Debug, Deserialize)]
struct OpenInterestResult {
	list: Vec<OpenInterestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenInterestEntry {
	open_interest: String,
	timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickersResponse {
	#[allow(dead_code)]
	ret_code: i32,
	result: TickersResult,
}

#[derive(Debug, Deserialize)]
struct TickersResult {
	list: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
	mark_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingHistoryResponse {
	ret_code: i32,
	ret_msg: String,
	result: FundingHistoryResult,
}

#[derive(Debug, Deserialize)]
struct FundingHistoryResult {
	list: Vec<FundingHistoryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingHistoryEntry {
	funding_rate: String,
	funding_rate_timestamp: String,
}

// Bybit websocket payload entries.
// https://bybit-exchange.github.io/docs/v5/websocket/public/kline

#[derive(Debug, Deserialize)]
struct KlineEntry {
	start: i64,
	open: String,
	high: String,
	low: String,
	close: String,
	volume: String,
	turnover: String,
	confirm: bool,
}

// Shared shape of publicTrade and allLiquidation entries.
#[derive(Debug, Deserialize)]
struct TradeTick {
	#[serde(rename = "T")]
	time: i64,
	#[serde(rename = "s")]
	symbol: Option<String>,
	#[serde(rename = "S")]
	side: String,
	#[serde(rename = "v")]
	quantity: String,
	#[serde(rename = "p")]
	price: String,
}
