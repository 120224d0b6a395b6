use crate::backoff::DEFAULT_MAX_RECONNECT_SECONDS;
use crate::error::FeedError;
use crate::feed::{FeedHandle, spawn_feed};
use crate::time::to_utc_datetime_or_epoch;
use crate::types::{Liquidation, Side};
use crate::ws::{Keepalive, run_feed, run_feed_once};
use crate::{Capabilities, Exchange, symbol};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// OKX expects a literal "ping" text and answers "pong".
const KEEPALIVE: Keepalive = Keepalive::Text("ping");

/// OKX connector. Only the public SWAP liquidation-orders channel is wired
/// up; the feed is market-wide, so per-symbol streams filter client-side.
pub struct OkxExchange {
	max_reconnect_seconds: u64,
}

impl OkxExchange {
	#[must_use]
	pub const fn new() -> Self {
		Self::with_reconnect_cap(DEFAULT_MAX_RECONNECT_SECONDS)
	}

	#[must_use]
	pub const fn with_reconnect_cap(max_reconnect_seconds: u64) -> Self {
		Self { max_reconnect_seconds }
	}

	/// Market-wide SWAP liquidation stream. One connection per session; the
	/// handle ends when the venue disconnects.
	pub fn all_liquidations_session(&self) -> FeedHandle<Liquidation> {
		spawn_feed(move |tx| {
			run_feed_once(
				"okx:liquidation_orders",
				WS_URL.to_string(),
				vec![subscribe_frame()],
				None,
				KEEPALIVE,
				tx,
				|text| parse_liquidation_frame(text, None),
			)
		})
	}
}

impl Default for OkxExchange {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Exchange for OkxExchange {
	fn name(&self) -> &'static str {
		"okx"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities { liquidations: true, ..Capabilities::none() }
	}

	fn stream_liquidations(&self, symbol_tag: &str) -> Result<FeedHandle<Liquidation>> {
		let coin = symbol::to_coin(symbol_tag);
		let max_backoff = self.max_reconnect_seconds;

		Ok(spawn_feed(move |tx| {
			run_feed(
				"okx:liquidation_orders",
				WS_URL.to_string(),
				vec![subscribe_frame()],
				None,
				KEEPALIVE,
				max_backoff,
				tx,
				move |text| parse_liquidation_frame(text, Some(&coin)),
			)
		}))
	}
}

fn subscribe_frame() -> String {
	serde_json::json!({
		"op": "subscribe",
		"args": [{ "channel": "liquidation-orders", "instType": "SWAP" }]
	})
	.to_string()
}

/// `coin_filter` restricts the market-wide feed to instruments of one coin
/// (`BTC` matches `BTC-USDT-SWAP`).
fn parse_liquidation_frame(text: &str, coin_filter: Option<&str>) -> Result<Vec<Liquidation>, FeedError> {
	// Keepalive replies are plain text, not JSON.
	if text == "pong" {
		return Ok(Vec::new());
	}

	let value: Value =
		serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("liquidation frame: {e}")))?;

	if let Some(event) = value.get("event").and_then(Value::as_str) {
		if event == "error" {
			let reason = value.get("msg").and_then(Value::as_str).unwrap_or("subscribe failed").to_string();
			return Err(FeedError::SubscriptionRejected(reason));
		}
		debug!(stream = "okx:liquidation_orders", event, "control frame");
		return Ok(Vec::new());
	}

	if value.get("arg").is_none() || value.get("data").is_none() {
		debug!(stream = "okx:liquidation_orders", "dropping non-data frame");
		return Ok(Vec::new());
	}

	let entries: Vec<LiquidationEntry> = serde_json::from_value(value.get("data").cloned().unwrap_or_default())
		.map_err(|e| FeedError::Malformed(format!("liquidation frame: {e}")))?;

	let mut records = Vec::new();
	for entry in entries {
		if let Some(coin) = coin_filter {
			if entry.inst_id.split('-').next() != Some(coin) {
				continue;
			}
		}

		for detail in entry.details {
			let price = detail.bk_px.parse::<f64>().unwrap_or(0.0);
			let quantity = detail.sz.parse::<f64>().unwrap_or(0.0);

			records.push(Liquidation {
				exchange: "okx".to_string(),
				symbol: entry.inst_id.clone(),
				side: Side::from_venue(&detail.side).unwrap_or(Side::Sell),
				price,
				quantity,
				value: price * quantity,
				timestamp: to_utc_datetime_or_epoch(detail.ts.parse().unwrap_or(0)),
			});
		}
	}

	Ok(records)
}

// https://www.okx.com/docs-v5/en/#public-data-websocket-liquidation-orders-channel
#[derive(Debug, Deserialize)]
struct LiquidationEntry {
	#[serde(rename = "instId")]
	inst_id: String,
	details: Vec<LiquidationDetail>,
}

#[derive(Debug, Deserialize)]
struct LiquidationDetail {
	side: String,
	sz: String,
	#[serde(rename = "bkPx")]
	bk_px: String,
	ts: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	const FRAME: &str = r#"{"arg":{"channel":"liquidation-orders","instType":"SWAP"},"data":[{"details":[{"bkLoss":"0","bkPx":"50000","ccy":"","posSide":"long","side":"sell","sz":"2","ts":"1704110400000"}],"instFamily":"BTC-USDT","instId":"BTC-USDT-SWAP","instType":"SWAP","uly":"BTC-USDT"}]}"#;

	#[test]
	fn subscribe_frame_matches_the_wire_shape() {
		let value: Value = serde_json::from_str(&subscribe_frame()).unwrap();
		assert_eq!(value["op"], "subscribe");
		assert_eq!(value["args"][0]["channel"], "liquidation-orders");
		assert_eq!(value["args"][0]["instType"], "SWAP");
	}

	#[test]
	fn liquidation_details_flatten_into_records() {
		let records = parse_liquidation_frame(FRAME, None).unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].symbol, "BTC-USDT-SWAP");
		assert_eq!(records[0].side, Side::Sell);
		assert_eq!(records[0].value, 100_000.0);
	}

	#[test]
	fn coin_filter_restricts_the_feed() {
		assert_eq!(parse_liquidation_frame(FRAME, Some("BTC")).unwrap().len(), 1);
		assert!(parse_liquidation_frame(FRAME, Some("ETH")).unwrap().is_empty());
	}

	#[test]
	fn pong_and_acks_are_silent() {
		assert!(parse_liquidation_frame("pong", None).unwrap().is_empty());
		let ack = r#"{"event":"subscribe","arg":{"channel":"liquidation-orders","instType":"SWAP"},"connId":"a"}"#;
		assert!(parse_liquidation_frame(ack, None).unwrap().is_empty());
	}

	#[test]
	fn error_event_is_a_rejection() {
		let error = r#"{"event":"error","code":"60012","msg":"Invalid request"}"#;
		assert!(matches!(parse_liquidation_frame(error, None), Err(FeedError::SubscriptionRejected(_))));
	}
}
