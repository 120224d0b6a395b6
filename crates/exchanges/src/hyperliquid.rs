use crate::backoff::DEFAULT_MAX_RECONNECT_SECONDS;
use crate::error::FeedError;
use crate::feed::{FeedHandle, spawn_feed};
use crate::rest::RestClient;
use crate::time::to_utc_datetime_or_epoch;
use crate::types::{Candle, FundingRate, LargeTrade, OpenInterest, Side};
use crate::ws::{Keepalive, run_feed, run_feed_once};
use crate::{Capabilities, Exchange, interval, symbol};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const API_URL: &str = "https://api.hyperliquid.xyz/info";
const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

const SUBSCRIBE_PACING: Duration = Duration::from_millis(50);

/// Hyperliquid answers `{"method":"ping"}` with a pong channel frame.
const KEEPALIVE: Keepalive = Keepalive::Text(r#"{"method":"ping"}"#);

/// Hyperliquid perpetuals connector. The venue addresses markets by coin
/// (`BTC`), so pair tags are reduced with the shared symbol mapper while
/// emitted records keep the tag the caller passed in.
pub struct HyperliquidExchange {
	rest: RestClient,
	max_reconnect_seconds: u64,
}

impl HyperliquidExchange {
	pub fn new() -> Result<Self> {
		Self::with_reconnect_cap(DEFAULT_MAX_RECONNECT_SECONDS)
	}

	pub fn with_reconnect_cap(max_reconnect_seconds: u64) -> Result<Self> {
		let rest = RestClient::new().context("failed to create Hyperliquid REST session")?;
		Ok(Self { rest, max_reconnect_seconds })
	}

	/// Trade stream over many coins on one connection. Single session per
	/// call; the handle ends when the venue disconnects.
	pub fn trades_session(&self, coins: &[String]) -> FeedHandle<LargeTrade> {
		let frames: Vec<String> = coins
			.iter()
			.map(|coin| {
				serde_json::json!({
					"method": "subscribe",
					"subscription": { "type": "trades", "coin": coin.to_uppercase() }
				})
				.to_string()
			})
			.collect();

		spawn_feed(move |tx| {
			run_feed_once("hyperliquid:trades", WS_URL.to_string(), frames, Some(SUBSCRIBE_PACING), KEEPALIVE, tx, |text| {
				parse_trades_frame(text, None, 0.0)
			})
		})
	}

	async fn asset_context(&self, coin: &str) -> Result<AssetCtx> {
		let body = serde_json::json!({ "type": "metaAndAssetCtxs" });
		let (meta, contexts): (Meta, Vec<AssetCtx>) = self.rest.post_json(API_URL, &body).await?;

		let index = meta
			.universe
			.iter()
			.position(|asset| asset.name.eq_ignore_ascii_case(coin))
			.with_context(|| format!("unknown Hyperliquid coin: {coin}"))?;

		contexts.into_iter().nth(index).with_context(|| format!("missing asset context for {coin}"))
	}
}

#[async_trait]
impl Exchange for HyperliquidExchange {
	fn name(&self) -> &'static str {
		"hyperliquid"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities { ohlc: true, funding_rate: true, open_interest: true, liquidations: false, large_trades: true }
	}

	async fn health_check(&self) -> bool {
		let body = serde_json::json!({ "type": "meta" });
		self.rest.post_json::<_, Value>(API_URL, &body).await.is_ok()
	}

	async fn get_ohlc(&self, symbol_tag: &str, candle_interval: &str, limit: u32) -> Result<Vec<Candle>> {
		let coin = symbol::to_coin(symbol_tag);
		let venue_interval = interval::to_hyperliquid(candle_interval);
		let span = interval::interval_to_millis(&venue_interval);
		let end_time = Utc::now().timestamp_millis();
		let start_time = end_time - span * i64::from(limit);

		let body = serde_json::json!({
			"type": "candleSnapshot",
			"req": { "coin": coin, "interval": venue_interval, "startTime": start_time, "endTime": end_time }
		});
		let rows: Vec<CandleSnapshotRow> = self.rest.post_json(API_URL, &body).await?;

		let candles = rows
			.into_iter()
			.filter_map(|row| {
				let close = row.close.parse::<f64>().ok()?;
				let volume = row.volume.parse::<f64>().ok()?;
				Some(Candle {
					exchange: "hyperliquid".to_string(),
					symbol: symbol_tag.to_uppercase(),
					interval: venue_interval.clone(),
					timestamp: to_utc_datetime_or_epoch(row.start_time),
					open: row.open.parse().ok()?,
					high: row.high.parse().ok()?,
					low: row.low.parse().ok()?,
					close,
					volume,
					// The venue reports base volume only; approximate notional at the close.
					quote_volume: volume * close,
					trades_count: row.trades,
					is_closed: true,
				})
			})
			.collect();

		Ok(candles)
	}

	async fn get_open_interest(&self, symbol_tag: &str) -> Result<OpenInterest> {
		let coin = symbol::to_coin(symbol_tag);
		let ctx = self.asset_context(&coin).await?;

		let open_interest =
			ctx.open_interest.parse::<f64>().with_context(|| format!("unparseable openInterest for {coin}"))?;
		let mark_price = ctx.mark_px.parse::<f64>().ok();

		Ok(OpenInterest {
			exchange: "hyperliquid".to_string(),
			symbol: symbol_tag.to_uppercase(),
			timestamp: Utc::now(),
			open_interest,
			open_interest_value: mark_price.map(|mark| open_interest * mark),
		})
	}

	async fn get_funding_rate(&self, symbol_tag: &str) -> Result<FundingRate> {
		let coin = symbol::to_coin(symbol_tag);
		let ctx = self.asset_context(&coin).await?;

		let funding_rate =
			ctx.funding.parse::<f64>().with_context(|| format!("unparseable funding for {coin}"))?;
		let now = Utc::now();

		Ok(FundingRate {
			exchange: "hyperliquid".to_string(),
			symbol: symbol_tag.to_uppercase(),
			timestamp: now,
			funding_rate,
			funding_time: now,
			next_funding_rate: None,
			next_funding_time: None,
		})
	}

	fn stream_ohlc(&self, symbol_tag: &str, candle_interval: &str) -> Result<FeedHandle<Candle>> {
		let coin = symbol::to_coin(symbol_tag);
		let symbol_upper = symbol_tag.to_uppercase();
		let venue_interval = interval::to_hyperliquid(candle_interval);
		let frame = serde_json::json!({
			"method": "subscribe",
			"subscription": { "type": "candle", "coin": coin, "interval": venue_interval }
		})
		.to_string();
		let max_backoff = self.max_reconnect_seconds;

		Ok(spawn_feed(move |tx| {
			run_feed("hyperliquid:candle", WS_URL.to_string(), vec![frame], None, KEEPALIVE, max_backoff, tx, move |text| {
				parse_candle_frame(&symbol_upper, &venue_interval, text)
			})
		}))
	}

	fn stream_large_trades(&self, symbol_tag: &str, min_value_usd: f64) -> Result<FeedHandle<LargeTrade>> {
		let coin = symbol::to_coin(symbol_tag);
		let symbol_upper = symbol_tag.to_uppercase();
		let frame = serde_json::json!({
			"method": "subscribe",
			"subscription": { "type": "trades", "coin": coin }
		})
		.to_string();
		let max_backoff = self.max_reconnect_seconds;

		Ok(spawn_feed(move |tx| {
			run_feed("hyperliquid:trades", WS_URL.to_string(), vec![frame], None, KEEPALIVE, max_backoff, tx, move |text| {
				parse_trades_frame(text, Some(&symbol_upper), min_value_usd)
			})
		}))
	}
}

/// Non-candle channels (subscription acks, pongs) parse to empty batches; the
/// error channel surfaces as a rejection.
fn channel_guard(value: &Value, expected: &str, stream: &str) -> Result<bool, FeedError> {
	match value.get("channel").and_then(Value::as_str) {
		Some(channel) if channel == expected => Ok(true),
		Some("error") => {
			let reason = value.get("data").and_then(Value::as_str).unwrap_or("subscription error").to_string();
			Err(FeedError::SubscriptionRejected(reason))
		},
		other => {
			debug!(stream, channel = ?other, "dropping non-data frame");
			Ok(false)
		},
	}
}

fn parse_candle_frame(symbol_tag: &str, interval_tag: &str, text: &str) -> Result<Vec<Candle>, FeedError> {
	let value: Value =
		serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("candle frame: {e}")))?;

	if !channel_guard(&value, "candle", "hyperliquid:candle")? {
		return Ok(Vec::new());
	}

	let data = value.get("data").cloned().unwrap_or_default();
	let candle: WsCandle =
		serde_json::from_value(data).map_err(|e| FeedError::Malformed(format!("candle frame: {e}")))?;

	let close = parse_f64(&candle.close, "c")?;
	let volume = parse_f64(&candle.volume, "v")?;

	Ok(vec![Candle {
		exchange: "hyperliquid".to_string(),
		symbol: symbol_tag.to_string(),
		interval: interval_tag.to_string(),
		timestamp: to_utc_datetime_or_epoch(candle.start_time),
		open: parse_f64(&candle.open, "o")?,
		high: parse_f64(&candle.high, "h")?,
		low: parse_f64(&candle.low, "l")?,
		close,
		volume,
		quote_volume: volume * close,
		trades_count: candle.trades,
		is_closed: candle.closed,
	}])
}

/// `symbol_override` pins the emitted tag for per-symbol streams; the
/// multi-coin session keeps the venue's coin tag.
fn parse_trades_frame(
	text: &str,
	symbol_override: Option<&str>,
	min_value_usd: f64,
) -> Result<Vec<LargeTrade>, FeedError> {
	let value: Value =
		serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("trades frame: {e}")))?;

	if !channel_guard(&value, "trades", "hyperliquid:trades")? {
		return Ok(Vec::new());
	}

	let entries: Vec<WsTrade> = serde_json::from_value(value.get("data").cloned().unwrap_or_default())
		.map_err(|e| FeedError::Malformed(format!("trades frame: {e}")))?;

	let mut trades = Vec::new();
	for entry in entries {
		let price = parse_f64(&entry.price, "px")?;
		let quantity = parse_f64(&entry.size, "sz")?;
		let value_usd = price * quantity;
		if value_usd < min_value_usd {
			continue;
		}

		// "B" is a taker buy, "A" a taker sell; the maker bit follows.
		let side = if entry.side == "B" { Side::Buy } else { Side::Sell };
		let is_buyer_maker = entry.side == "A";

		trades.push(LargeTrade {
			exchange: "hyperliquid".to_string(),
			symbol: symbol_override.map_or_else(|| entry.coin.to_uppercase(), ToString::to_string),
			side,
			price,
			quantity,
			value: value_usd,
			is_buyer_maker,
			timestamp: to_utc_datetime_or_epoch(entry.time),
		});
	}

	Ok(trades)
}

fn parse_f64(raw: &str, field: &str) -> Result<f64, FeedError> {
	raw.parse::<f64>().map_err(|_| FeedError::Malformed(format!("unparseable {field}: {raw}")))
}

// Hyperliquid info API payloads.
// https://hyperliquid.gitbook.io/hyperliquid-docs/for-developers/api/info-endpoint

#[derive(Debug, Deserialize)]
struct Meta {
	universe: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
	name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetCtx {
	funding: String,
	open_interest: String,
	mark_px: String,
}

#[derive(Debug, Deserialize)]
struct CandleSnapshotRow {
	#[serde(rename = "t")]
	start_time: i64,
	#[serde(rename = "o")]
	open: String,
	#[serde(rename = "h")]
	high: String,
	#[serde(rename = "l")]
	low: String,
	#[serde(rename = "c")]
	close: String,
	#[serde(rename = "v")]
	volume: String,
	#[serde(rename = "n")]
	trades: u64,
}

// https://hyperliquid.gitbook.io/hyperliquid-docs/for-developers/api/websocket
#[derive(Debug, Deserialize)]
struct WsCandle {
	#[serde(rename = "t")]
	start_time: i64,
	#[serde(rename = "o")]
	open: String,
	#[serde(rename = "h")]
	high: String,
	#[serde(rename = "l")]
	low: String,
	#[serde(rename = "c")]
	close: String,
	#[serde(rename = "v")]
	volume: String,
	#[serde(rename = "n", default)]
	trades: u64,
	#[serde(default)]
	closed: bool,
}

#[derive(Debug, Deserialize)]
struct WsTrade {
	coin: String,
	side: String,
	#[serde(rename = "px")]
	price: String,
	#[serde(rename = "sz")]
	size: String,
	time: i64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn candle_frame_parses_with_estimated_quote_volume() {
		let text = r#"{"channel":"candle","data":{"t":1704110400000,"T":1704110459999,"s":"BTC","i":"1m","o":"50000.0","h":"50500.0","l":"49500.0","c":"50250.0","v":"2.0","n":42,"closed":true}}"#;

		let candles = parse_candle_frame("BTCUSDT", "1m", text).unwrap();
		assert_eq!(candles.len(), 1);
		assert_eq!(candles[0].symbol, "BTCUSDT");
		assert_eq!(candles[0].quote_volume, 2.0 * 50_250.0);
		assert!(candles[0].is_closed);
	}

	#[test]
	fn subscription_ack_is_silent() {
		let ack = r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#;
		assert!(parse_candle_frame("BTCUSDT", "1m", ack).unwrap().is_empty());
		assert!(parse_trades_frame(ack, None, 0.0).unwrap().is_empty());
	}

	#[test]
	fn error_channel_is_a_rejection() {
		let error = r#"{"channel":"error","data":"Invalid subscription"}"#;
		assert!(matches!(parse_candle_frame("BTCUSDT", "1m", error), Err(FeedError::SubscriptionRejected(_))));
	}

	#[test]
	fn trade_sides_map_from_book_letters() {
		let text = r#"{"channel":"trades","data":[{"coin":"BTC","side":"B","px":"50000.0","sz":"3.0","time":1704110400000,"tid":1},{"coin":"BTC","side":"A","px":"50000.0","sz":"3.0","time":1704110400000,"tid":2}]}"#;

		let trades = parse_trades_frame(text, None, 0.0).unwrap();
		assert_eq!(trades.len(), 2);

		assert_eq!(trades[0].side, Side::Buy);
		assert!(!trades[0].is_buyer_maker);
		assert_eq!(trades[1].side, Side::Sell);
		assert!(trades[1].is_buyer_maker);
	}

	#[test]
	fn trades_below_threshold_are_dropped() {
		let text = r#"{"channel":"trades","data":[{"coin":"BTC","side":"B","px":"50000.0","sz":"0.1","time":1704110400000,"tid":1}]}"#;
		assert!(parse_trades_frame(text, None, 100_000.0).unwrap().is_empty());
	}

	#[test]
	fn symbol_override_pins_the_tag() {
		let text = r#"{"channel":"trades","data":[{"coin":"BTC","side":"B","px":"50000.0","sz":"3.0","time":1704110400000,"tid":1}]}"#;

		let pinned = parse_trades_frame(text, Some("BTCUSDT"), 0.0).unwrap();
		assert_eq!(pinned[0].symbol, "BTCUSDT");

		let coin_form = parse_trades_frame(text, None, 0.0).unwrap();
		assert_eq!(coin_form[0].symbol, "BTC");
	}
}
