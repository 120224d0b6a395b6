use super::{ServerWs, StreamKind, close_internal, close_policy};
use crate::AppContext;
use exchanges::{Feature, FeedHandle};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

/// Per-symbol pass-through: resolve the venue, check the capability, then
/// forward normalized records until either side goes away. Dropping the feed
/// handle on exit cancels the upstream task.
pub async fn run(
	ws: ServerWs,
	ctx: &AppContext,
	exchange_name: &str,
	symbol: &str,
	kind: &StreamKind,
	interval: Option<String>,
) {
	let Some(exchange) = ctx.registry.get(exchange_name) else {
		close_policy(ws, &format!("unknown exchange: {exchange_name}")).await;
		return;
	};

	let (feature, label) = match kind {
		StreamKind::Ohlc => (Feature::Ohlc, "ohlc"),
		StreamKind::LargeTrades => (Feature::LargeTrades, "large_trades"),
		StreamKind::Liquidations => (Feature::Liquidations, "liquidations"),
	};
	if !exchange.supports(feature) {
		close_policy(ws, &format!("{exchange_name} does not support {label}")).await;
		return;
	}

	match kind {
		StreamKind::Ohlc => {
			let Some(interval) = interval else {
				close_policy(ws, "interval query parameter is required").await;
				return;
			};
			match exchange.stream_ohlc(symbol, &interval) {
				Ok(feed) => forward(ws, feed).await,
				Err(e) => {
					error!(exchange = exchange_name, symbol, error = %e, "failed to start ohlc stream");
					close_internal(ws, "failed to start stream").await;
				},
			}
		},
		StreamKind::LargeTrades => {
			match exchange.stream_large_trades(symbol, ctx.config.streams.large_trade_threshold_usd) {
				Ok(feed) => forward(ws, feed).await,
				Err(e) => {
					error!(exchange = exchange_name, symbol, error = %e, "failed to start trade stream");
					close_internal(ws, "failed to start stream").await;
				},
			}
		},
		StreamKind::Liquidations => match exchange.stream_liquidations(symbol) {
			Ok(feed) => forward(ws, feed).await,
			Err(e) => {
				error!(exchange = exchange_name, symbol, error = %e, "failed to start liquidation stream");
				close_internal(ws, "failed to start stream").await;
			},
		},
	}
}

async fn forward<T: Serialize>(ws: ServerWs, mut feed: FeedHandle<T>) {
	let (mut write, mut read) = ws.split();

	loop {
		tokio::select! {
			record = feed.recv() => {
				let Some(record) = record else { break };
				let Ok(json) = serde_json::to_string(&record) else { break };
				if write.send(Message::Text(json.into())).await.is_err() {
					break;
				}
			}
			msg = read.next() => match msg {
				Some(Ok(Message::Ping(payload))) => {
					if write.send(Message::Pong(payload)).await.is_err() {
						break;
					}
				},
				Some(Ok(Message::Close(_))) | None => break,
				Some(Err(e)) => {
					debug!(error = %e, "per-symbol client socket error");
					break;
				},
				_ => {},
			}
		}
	}
}
