use crate::backoff::DEFAULT_MAX_RECONNECT_SECONDS;
use crate::error::FeedError;
use crate::feed::{FeedHandle, spawn_feed};
use crate::rest::RestClient;
use crate::time::{to_utc_datetime, to_utc_datetime_or_epoch};
use crate::types::{Candle, FundingRate, LargeTrade, Liquidation, OpenInterest, Side};
use crate::ws::{Keepalive, run_feed, run_feed_once};
use crate::{Capabilities, Exchange, interval};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemes::{
	AggTradeFrame, ExchangeInfoResponse, ForceOrder, KlineFrame, KlineRow, OpenInterestHistResponse,
	OpenInterestResponse, PremiumIndexResponse,
};
use serde_json::Value;
use tracing::debug;

mod schemes;

const API_BASE: &str = "https://fapi.binance.com";
const WS_BASE: &str = "wss://fstream.binance.com/ws";

/// Binance USD-M futures connector.
pub struct BinanceExchange {
	rest: RestClient,
	max_reconnect_seconds: u64,
}

impl BinanceExchange {
	pub fn new() -> Result<Self> {
		Self::with_reconnect_cap(DEFAULT_MAX_RECONNECT_SECONDS)
	}

	pub fn with_reconnect_cap(max_reconnect_seconds: u64) -> Result<Self> {
		let rest = RestClient::new().context("failed to create Binance REST session")?;
		Ok(Self { rest, max_reconnect_seconds })
	}

	/// USDT-quoted perpetual symbols currently trading.
	pub async fn usdt_perpetuals(&self) -> Result<Vec<String>> {
		let url = format!("{API_BASE}/fapi/v1/exchangeInfo");
		let response: ExchangeInfoResponse = self.rest.get_json(&url, &[]).await?;

		Ok(
			response
				.symbols
				.into_iter()
				.filter(|s| s.status == "TRADING" && s.quote_asset == "USDT" && s.contract_type == "PERPETUAL")
				.map(|s| s.symbol)
				.collect(),
		)
	}

	/// Open interest history in USD terms (`sumOpenInterestValue`), oldest first.
	pub async fn get_open_interest_hist(
		&self,
		symbol: &str,
		period: &str,
		limit: u32,
	) -> Result<Vec<(DateTime<Utc>, f64)>> {
		let url = format!("{API_BASE}/futures/data/openInterestHist");
		let query =
			[("symbol", symbol.to_uppercase()), ("period", period.to_string()), ("limit", limit.to_string())];
		let rows: Vec<OpenInterestHistResponse> = self.rest.get_json(&url, &query).await?;

		Ok(
			rows
				.into_iter()
				.filter_map(|row| {
					let value = row.sum_open_interest_value.parse::<f64>().ok()?;
					Some((to_utc_datetime_or_epoch(row.timestamp), value))
				})
				.collect(),
		)
	}

	/// All-market liquidation stream (`!forceOrder@arr`). One connection per
	/// session; the handle ends when the venue disconnects so callers can
	/// supervise reconnects themselves.
	pub fn all_liquidations_session(&self) -> FeedHandle<Liquidation> {
		let url = format!("{WS_BASE}/!forceOrder@arr");
		spawn_feed(move |tx| {
			run_feed_once("binance:all_liquidations", url, Vec::new(), None, Keepalive::Frame, tx, parse_force_order_frame)
		})
	}
}

#[async_trait]
impl Exchange for BinanceExchange {
	fn name(&self) -> &'static str {
		"binance"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities::all()
	}

	async fn health_check(&self) -> bool {
		self.rest.ping(&format!("{API_BASE}/fapi/v1/ping")).await
	}

	async fn get_ohlc(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
		let venue_interval = interval::to_binance(interval);
		let url = format!("{API_BASE}/fapi/v1/klines");
		let query =
			[("symbol", symbol.to_uppercase()), ("interval", venue_interval.clone()), ("limit", limit.to_string())];
		let rows: Vec<KlineRow> = self.rest.get_json(&url, &query).await?;

		let candles = rows
			.into_iter()
			.filter_map(|row| {
				Some(Candle {
					exchange: "binance".to_string(),
					symbol: symbol.to_uppercase(),
					interval: venue_interval.clone(),
					timestamp: to_utc_datetime(row.0)?,
					open: row.1.parse().ok()?,
					high: row.2.parse().ok()?,
					low: row.3.parse().ok()?,
					close: row.4.parse().ok()?,
					volume: row.5.parse().ok()?,
					quote_volume: row.7.parse().ok()?,
					trades_count: row.8,
					is_closed: true,
				})
			})
			.collect();

		Ok(candles)
	}

	async fn get_open_interest(&self, symbol: &str) -> Result<OpenInterest> {
		let query = [("symbol", symbol.to_uppercase())];

		let url = format!("{API_BASE}/fapi/v1/openInterest");
		let oi: OpenInterestResponse = self.rest.get_json(&url, &query).await?;

		let premium_url = format!("{API_BASE}/fapi/v1/premiumIndex");
		let premium: PremiumIndexResponse = self.rest.get_json(&premium_url, &query).await?;

		let open_interest =
			oi.open_interest.parse::<f64>().with_context(|| format!("unparseable openInterest for {symbol}"))?;
		let open_interest_value = premium.mark_price.parse::<f64>().ok().map(|mark| open_interest * mark);

		Ok(OpenInterest {
			exchange: "binance".to_string(),
			symbol: symbol.to_uppercase(),
			timestamp: to_utc_datetime_or_epoch(oi.time),
			open_interest,
			open_interest_value,
		})
	}

	async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate> {
		let url = format!("{API_BASE}/fapi/v1/premiumIndex");
		let query = [("symbol", symbol.to_uppercase())];
		let premium: PremiumIndexResponse = self.rest.get_json(&url, &query).await?;

		let funding_rate = premium
			.last_funding_rate
			.parse::<f64>()
			.with_context(|| format!("unparseable lastFundingRate for {symbol}"))?;

		Ok(FundingRate {
			exchange: "binance".to_string(),
			symbol: symbol.to_uppercase(),
			timestamp: to_utc_datetime_or_epoch(premium.time),
			funding_rate,
			funding_time: to_utc_datetime_or_epoch(premium.time),
			next_funding_rate: None,
			next_funding_time: to_utc_datetime(premium.next_funding_time),
		})
	}

	fn stream_ohlc(&self, symbol: &str, interval: &str) -> Result<FeedHandle<Candle>> {
		let symbol_upper = symbol.to_uppercase();
		let venue_interval = interval::to_binance(interval);
		let url = format!("{WS_BASE}/{}@kline_{}", symbol_upper.to_lowercase(), venue_interval);
		let max_backoff = self.max_reconnect_seconds;

		Ok(spawn_feed(move |tx| {
			run_feed("binance:kline", url, Vec::new(), None, Keepalive::Frame, max_backoff, tx, move |text| {
				parse_kline_frame(&symbol_upper, &venue_interval, text)
			})
		}))
	}

	fn stream_liquidations(&self, symbol: &str) -> Result<FeedHandle<Liquidation>> {
		let url = format!("{WS_BASE}/{}@forceOrder", symbol.to_lowercase());
		let max_backoff = self.max_reconnect_seconds;

		Ok(spawn_feed(move |tx| {
			run_feed("binance:force_order", url, Vec::new(), None, Keepalive::Frame, max_backoff, tx, parse_force_order_frame)
		}))
	}

	fn stream_large_trades(&self, symbol: &str, min_value_usd: f64) -> Result<FeedHandle<LargeTrade>> {
		let url = format!("{WS_BASE}/{}@aggTrade", symbol.to_lowercase());
		let max_backoff = self.max_reconnect_seconds;

		Ok(spawn_feed(move |tx| {
			run_feed("binance:agg_trade", url, Vec::new(), None, Keepalive::Frame, max_backoff, tx, move |text| {
				parse_agg_trade_frame(min_value_usd, text)
			})
		}))
	}
}

fn parse_kline_frame(symbol: &str, interval: &str, text: &str) -> Result<Vec<Candle>, FeedError> {
	let value: Value = serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("kline frame: {e}")))?;

	if value.get("e").and_then(Value::as_str) != Some("kline") {
		debug!(stream = "binance:kline", "dropping non-kline frame");
		return Ok(Vec::new());
	}

	let frame: KlineFrame =
		serde_json::from_value(value).map_err(|e| FeedError::Malformed(format!("kline frame: {e}")))?;
	let k = frame.kline;

	Ok(vec![Candle {
		exchange: "binance".to_string(),
		symbol: symbol.to_string(),
		interval: interval.to_string(),
		timestamp: to_utc_datetime_or_epoch(k.start_time),
		open: parse_f64(&k.open, "k.o")?,
		high: parse_f64(&k.high, "k.h")?,
		low: parse_f64(&k.low, "k.l")?,
		close: parse_f64(&k.close, "k.c")?,
		volume: parse_f64(&k.volume, "k.v")?,
		quote_volume: parse_f64(&k.quote_volume, "k.q")?,
		trades_count: k.trades,
		is_closed: k.is_closed,
	}])
}

/// Handles both the per-symbol `@forceOrder` stream (single event) and the
/// all-market `!forceOrder@arr` stream (event array).
fn parse_force_order_frame(text: &str) -> Result<Vec<Liquidation>, FeedError> {
	let value: Value =
		serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("forceOrder frame: {e}")))?;

	let events = match value {
		Value::Array(events) => events,
		other => vec![other],
	};

	let mut records = Vec::new();
	for event in events {
		if event.get("e").and_then(Value::as_str) != Some("forceOrder") {
			debug!(stream = "binance:force_order", "dropping non-forceOrder frame");
			continue;
		}
		let Some(order) = event.get("o") else {
			continue;
		};
		let order: ForceOrder = serde_json::from_value(order.clone())
			.map_err(|e| FeedError::Malformed(format!("forceOrder frame: {e}")))?;

		let price = parse_f64(&order.price, "o.p")?;
		let quantity = parse_f64(&order.quantity, "o.q")?;

		records.push(Liquidation {
			exchange: "binance".to_string(),
			symbol: order.symbol,
			side: Side::from_venue(&order.side).unwrap_or(Side::Sell),
			price,
			quantity,
			value: price * quantity,
			timestamp: to_utc_datetime_or_epoch(order.trade_time),
		});
	}

	Ok(records)
}

fn parse_agg_trade_frame(min_value_usd: f64, text: &str) -> Result<Vec<LargeTrade>, FeedError> {
	let value: Value =
		serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("aggTrade frame: {e}")))?;

	if value.get("e").and_then(Value::as_str) != Some("aggTrade") {
		debug!(stream = "binance:agg_trade", "dropping non-aggTrade frame");
		return Ok(Vec::new());
	}

	let trade: AggTradeFrame =
		serde_json::from_value(value).map_err(|e| FeedError::Malformed(format!("aggTrade frame: {e}")))?;

	let price = parse_f64(&trade.price, "p")?;
	let quantity = parse_f64(&trade.quantity, "q")?;
	let value_usd = price * quantity;
	if value_usd < min_value_usd {
		return Ok(Vec::new());
	}

	let side = if trade.is_buyer_maker { Side::Sell } else { Side::Buy };

	Ok(vec![LargeTrade {
		exchange: "binance".to_string(),
		symbol: trade.symbol,
		side,
		price,
		quantity,
		value: value_usd,
		is_buyer_maker: trade.is_buyer_maker,
		timestamp: to_utc_datetime_or_epoch(trade.trade_time),
	}])
}

fn parse_f64(raw: &str, field: &str) -> Result<f64, FeedError> {
	raw.parse::<f64>().map_err(|_| FeedError::Malformed(format!("unparseable {field}: {raw}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn parses_live_kline_frame() {
		let text = r#"{"e":"kline","E":1704110401000,"s":"BTCUSDT","k":{"t":1704110400000,"T":1704110459999,"s":"BTCUSDT","i":"1m","o":"50000","h":"50100","l":"49900","c":"50050","v":"1.0","q":"50025","n":3,"x":false}}"#;

		let candles = parse_kline_frame("BTCUSDT", "1m", text).unwrap();
		assert_eq!(candles.len(), 1);

		let candle = &candles[0];
		assert_eq!(candle.exchange, "binance");
		assert_eq!(candle.symbol, "BTCUSDT");
		assert_eq!(candle.interval, "1m");
		assert_eq!(candle.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
		assert_eq!(candle.open, 50_000.0);
		assert_eq!(candle.high, 50_100.0);
		assert_eq!(candle.low, 49_900.0);
		assert_eq!(candle.close, 50_050.0);
		assert_eq!(candle.volume, 1.0);
		assert_eq!(candle.quote_volume, 50_025.0);
		assert_eq!(candle.trades_count, 3);
		assert!(!candle.is_closed);
	}

	#[test]
	fn drops_non_kline_frames() {
		let text = r#"{"e":"markPriceUpdate","s":"BTCUSDT","p":"50000"}"#;
		assert!(parse_kline_frame("BTCUSDT", "1m", text).unwrap().is_empty());
	}

	#[test]
	fn rejects_malformed_kline_json() {
		assert!(matches!(parse_kline_frame("BTCUSDT", "1m", "{not json"), Err(FeedError::Malformed(_))));
	}

	#[test]
	fn agg_trade_below_threshold_is_dropped() {
		let text = r#"{"e":"aggTrade","s":"BTCUSDT","a":1,"p":"50000","q":"0.5","T":1704110400000,"m":false}"#;
		let trades = parse_agg_trade_frame(100_000.0, text).unwrap();
		assert!(trades.is_empty());
	}

	#[test]
	fn agg_trade_above_threshold_is_emitted() {
		let text = r#"{"e":"aggTrade","s":"BTCUSDT","a":1,"p":"50000","q":"100","T":1704110400000,"m":false}"#;
		let trades = parse_agg_trade_frame(100_000.0, text).unwrap();
		assert_eq!(trades.len(), 1);

		let trade = &trades[0];
		assert_eq!(trade.side, Side::Buy);
		assert!(!trade.is_buyer_maker);
		assert_eq!(trade.value, 5_000_000.0);
	}

	#[test]
	fn agg_trade_buyer_maker_is_a_sell() {
		let text = r#"{"e":"aggTrade","s":"BTCUSDT","a":1,"p":"50000","q":"100","T":1704110400000,"m":true}"#;
		let trades = parse_agg_trade_frame(0.0, text).unwrap();
		assert_eq!(trades[0].side, Side::Sell);
		assert!(trades[0].is_buyer_maker);
	}

	#[test]
	fn force_order_array_and_single_forms_parse() {
		let single = r#"{"e":"forceOrder","E":1704110400000,"o":{"s":"BTCUSDT","S":"SELL","q":"0.014","p":"9910","ap":"9910","T":1704110400000}}"#;
		let records = parse_force_order_frame(single).unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].side, Side::Sell);
		assert!((records[0].value - 9910.0 * 0.014).abs() < 1e-9);

		let array = format!("[{single},{single}]");
		assert_eq!(parse_force_order_frame(&array).unwrap().len(), 2);
	}
}
