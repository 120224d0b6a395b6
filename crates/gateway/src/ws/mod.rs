pub mod firehose;
pub mod multi_ohlc;
pub mod per_symbol;

pub use firehose::ConnectionFilter;
pub use multi_ohlc::{BinanceCandleSource, CandleSource, MultiOhlcSettings};

use crate::AppContext;
use crate::bus::{TOPIC_LARGE_TRADE, TOPIC_LIQUIDATION, TOPIC_OI_SPIKE};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info};

pub type ServerWs = WebSocketStream<TcpStream>;

/// Timeframes the oi-vol endpoint accepts in its filter.
const OI_VOL_TIMEFRAMES: [&str; 3] = ["5m", "15m", "1h"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
	Ohlc,
	LargeTrades,
	Liquidations,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WsRoute {
	PerSymbol { exchange: String, symbol: String, kind: StreamKind, interval: Option<String> },
	AllLiquidations { min_value_usd: f64 },
	AllLargeTrades { min_value_usd: f64 },
	OiVol { timeframes: Vec<String> },
	MultiOhlc { interval: String },
}

/// Maps a request path (with query) to an endpoint. The fixed multi-segment
/// paths are matched before the generic `/ws/{exchange}/{symbol}/{stream}`
/// pattern so `all` and `multi` never resolve as venue tags.
pub fn parse_route(path_and_query: &str) -> Result<WsRoute, String> {
	let (path, query) = path_and_query.split_once('?').unwrap_or((path_and_query, ""));
	let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes()).into_owned().collect();

	match path {
		"/ws/all/liquidations" => Ok(WsRoute::AllLiquidations { min_value_usd: parse_min_value(&params) }),
		"/ws/all/large_trades" => Ok(WsRoute::AllLargeTrades { min_value_usd: parse_min_value(&params) }),
		"/ws/oi-vol" => Ok(WsRoute::OiVol { timeframes: parse_timeframes(params.get("timeframes")) }),
		"/ws/binance/multi/ohlc" => match params.get("interval") {
			Some(interval) if !interval.is_empty() => Ok(WsRoute::MultiOhlc { interval: interval.clone() }),
			_ => Err("interval query parameter is required".to_string()),
		},
		_ => parse_per_symbol(path, &params),
	}
}

fn parse_per_symbol(path: &str, params: &HashMap<String, String>) -> Result<WsRoute, String> {
	let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
	if segments.len() != 4 || segments[0] != "ws" {
		return Err("unknown endpoint".to_string());
	}

	let kind = match segments[3] {
		"ohlc" => StreamKind::Ohlc,
		"large_trades" => StreamKind::LargeTrades,
		"liquidations" => StreamKind::Liquidations,
		other => return Err(format!("unknown stream type: {other}")),
	};

	Ok(WsRoute::PerSymbol {
		exchange: segments[1].to_string(),
		symbol: segments[2].to_string(),
		kind,
		interval: params.get("interval").cloned(),
	})
}

fn parse_min_value(params: &HashMap<String, String>) -> f64 {
	params.get("min_value_usd").and_then(|raw| raw.parse().ok()).unwrap_or(0.0)
}

fn parse_timeframes(raw: Option<&String>) -> Vec<String> {
	let all = || OI_VOL_TIMEFRAMES.iter().map(ToString::to_string).collect();

	raw.map_or_else(all, |csv| {
		let selected: Vec<String> = csv
			.split(',')
			.map(str::trim)
			.filter(|tf| OI_VOL_TIMEFRAMES.contains(tf))
			.map(ToString::to_string)
			.collect();
		if selected.is_empty() { all() } else { selected }
	})
}

/// Accept loop for the websocket surface. Each connection is routed from its
/// handshake path and served on its own task.
pub async fn serve(listener: TcpListener, ctx: Arc<AppContext>) {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				let ctx = ctx.clone();
				tokio::spawn(async move {
					handle_connection(stream, peer, ctx).await;
				});
			},
			Err(e) => {
				error!(error = %e, "websocket accept failed");
				sleep(Duration::from_millis(100)).await;
			},
		}
	}
}

pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<AppContext>) {
	let mut request_path = None;
	let callback = |req: &Request, response: Response| {
		request_path = Some(
			req.uri().path_and_query().map_or_else(|| req.uri().path().to_string(), |pq| pq.as_str().to_string()),
		);
		Ok(response)
	};

	let ws = match accept_hdr_async(stream, callback).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(%peer, error = %e, "websocket handshake failed");
			return;
		},
	};

	let Some(path) = request_path else {
		close_policy(ws, "missing request path").await;
		return;
	};
	info!(%peer, path = %path, "websocket client connected");

	match parse_route(&path) {
		Ok(route) => dispatch(route, ws, &ctx).await,
		Err(reason) => close_policy(ws, &reason).await,
	}

	info!(%peer, "websocket client disconnected");
}

async fn dispatch(route: WsRoute, ws: ServerWs, ctx: &Arc<AppContext>) {
	match route {
		WsRoute::PerSymbol { exchange, symbol, kind, interval } => {
			per_symbol::run(ws, ctx, &exchange, &symbol, &kind, interval).await;
		},
		WsRoute::AllLiquidations { min_value_usd } => {
			firehose::run(ws, &ctx.bus, TOPIC_LIQUIDATION, ConnectionFilter::MinValue(min_value_usd)).await;
		},
		WsRoute::AllLargeTrades { min_value_usd } => {
			firehose::run(ws, &ctx.bus, TOPIC_LARGE_TRADE, ConnectionFilter::MinValue(min_value_usd)).await;
		},
		WsRoute::OiVol { timeframes } => {
			firehose::run(ws, &ctx.bus, TOPIC_OI_SPIKE, ConnectionFilter::Timeframes(timeframes)).await;
		},
		WsRoute::MultiOhlc { interval } => {
			multi_ohlc::run(ws, &interval, ctx.candles.clone(), ctx.multi_ohlc).await;
		},
	}
}

/// Close with 1008 and a human-readable reason, before any frame is accepted.
pub(crate) async fn close_policy(mut ws: ServerWs, reason: &str) {
	let frame = CloseFrame { code: CloseCode::Policy, reason: reason.to_string().into() };
	let _ = ws.close(Some(frame)).await;
}

/// Close with 1011 on internal failure.
pub(crate) async fn close_internal(mut ws: ServerWs, reason: &str) {
	let frame = CloseFrame { code: CloseCode::Error, reason: reason.to_string().into() };
	let _ = ws.close(Some(frame)).await;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fixed_paths_route_before_the_generic_pattern() {
		assert_eq!(parse_route("/ws/all/liquidations"), Ok(WsRoute::AllLiquidations { min_value_usd: 0.0 }));
		assert_eq!(
			parse_route("/ws/all/large_trades?min_value_usd=250000"),
			Ok(WsRoute::AllLargeTrades { min_value_usd: 250_000.0 })
		);
		assert_eq!(
			parse_route("/ws/binance/multi/ohlc?interval=1m"),
			Ok(WsRoute::MultiOhlc { interval: "1m".to_string() })
		);
	}

	#[test]
	fn multi_ohlc_requires_an_interval() {
		assert!(parse_route("/ws/binance/multi/ohlc").is_err());
		assert!(parse_route("/ws/binance/multi/ohlc?interval=").is_err());
	}

	#[test]
	fn per_symbol_routes_parse_with_optional_interval() {
		assert_eq!(
			parse_route("/ws/binance/BTCUSDT/ohlc?interval=5m"),
			Ok(WsRoute::PerSymbol {
				exchange: "binance".to_string(),
				symbol: "BTCUSDT".to_string(),
				kind: StreamKind::Ohlc,
				interval: Some("5m".to_string()),
			})
		);
		assert_eq!(
			parse_route("/ws/bybit/ETHUSDT/liquidations"),
			Ok(WsRoute::PerSymbol {
				exchange: "bybit".to_string(),
				symbol: "ETHUSDT".to_string(),
				kind: StreamKind::Liquidations,
				interval: None,
			})
		);
	}

	#[test]
	fn unknown_paths_and_streams_are_rejected() {
		assert!(parse_route("/ws/binance/BTCUSDT/order_book").is_err());
		assert!(parse_route("/api/candles").is_err());
		assert!(parse_route("/ws/binance").is_err());
	}

	#[test]
	fn oi_vol_timeframes_filter_to_known_values() {
		assert_eq!(
			parse_route("/ws/oi-vol?timeframes=5m,1h"),
			Ok(WsRoute::OiVol { timeframes: vec!["5m".to_string(), "1h".to_string()] })
		);
		// Unknown entries are dropped; nothing valid falls back to all.
		assert_eq!(
			parse_route("/ws/oi-vol?timeframes=2h,bogus"),
			Ok(WsRoute::OiVol { timeframes: vec!["5m".to_string(), "15m".to_string(), "1h".to_string()] })
		);
		assert_eq!(
			parse_route("/ws/oi-vol"),
			Ok(WsRoute::OiVol { timeframes: vec!["5m".to_string(), "15m".to_string(), "1h".to_string()] })
		);
	}

	#[test]
	fn malformed_min_value_defaults_to_zero() {
		assert_eq!(parse_route("/ws/all/liquidations?min_value_usd=abc"), Ok(WsRoute::AllLiquidations { min_value_usd: 0.0 }));
	}
}
