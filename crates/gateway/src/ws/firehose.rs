use super::ServerWs;
use crate::bus::{BusEvent, EventBus};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Per-connection filter applied between the bus queue and the client socket.
#[derive(Debug, Clone)]
pub enum ConnectionFilter {
	/// Minimum notional for liquidation / large-trade events.
	MinValue(f64),
	/// Timeframe subset for spike alerts.
	Timeframes(Vec<String>),
}

impl ConnectionFilter {
	#[must_use]
	pub fn passes(&self, event: &BusEvent) -> bool {
		match self {
			Self::MinValue(min) => event.value_usd().is_none_or(|value| value >= *min),
			Self::Timeframes(timeframes) => {
				event.timeframe().is_none_or(|tf| timeframes.iter().any(|t| t == tf))
			},
		}
	}
}

/// Firehose session: subscribe the connection to a topic, forward every event
/// that passes the filter, unsubscribe on the way out. A send failure or a
/// client close ends the session.
pub async fn run(ws: ServerWs, bus: &Arc<EventBus>, topic: &'static str, filter: ConnectionFilter) {
	let mut subscription = bus.subscribe(topic).await;
	let (mut write, mut read) = ws.split();

	loop {
		tokio::select! {
			event = subscription.recv() => {
				let Some(event) = event else { break };
				if !filter.passes(&event) {
					continue;
				}
				let Ok(json) = serde_json::to_string(&event) else { break };
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
					debug!(topic, error = %e, "firehose client socket error");
					break;
				},
				_ => {},
			}
		}
	}

	bus.unsubscribe(subscription).await;
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use exchanges::types::{LargeTrade, Liquidation, Side, SpikeAlert};

	fn liquidation(value: f64) -> BusEvent {
		BusEvent::Liquidation(Liquidation {
			exchange: "okx".to_string(),
			symbol: "BTC-USDT-SWAP".to_string(),
			side: Side::Buy,
			price: value,
			quantity: 1.0,
			value,
			timestamp: Utc::now(),
		})
	}

	fn trade(value: f64) -> BusEvent {
		BusEvent::LargeTrade(LargeTrade {
			exchange: "binance".to_string(),
			symbol: "BTCUSDT".to_string(),
			side: Side::Buy,
			price: value,
			quantity: 1.0,
			value,
			is_buyer_maker: false,
			timestamp: Utc::now(),
		})
	}

	fn spike(timeframe: &str) -> BusEvent {
		BusEvent::OiSpike(SpikeAlert {
			exchange: "binance".to_string(),
			symbol: "BTCUSDT".to_string(),
			timeframe: timeframe.to_string(),
			z_oi: 3.5,
			z_vol: 2.1,
			confirmed: false,
			timestamp: Utc::now(),
		})
	}

	#[test]
	fn min_value_filter_gates_notional() {
		let filter = ConnectionFilter::MinValue(100_000.0);
		assert!(!filter.passes(&liquidation(50_000.0)));
		assert!(filter.passes(&liquidation(100_000.0)));
		assert!(filter.passes(&trade(250_000.0)));
	}

	#[test]
	fn min_value_filter_ignores_events_without_notional() {
		let filter = ConnectionFilter::MinValue(100_000.0);
		assert!(filter.passes(&spike("5m")));
	}

	#[test]
	fn timeframe_filter_gates_spike_alerts() {
		let filter = ConnectionFilter::Timeframes(vec!["5m".to_string(), "1h".to_string()]);
		assert!(filter.passes(&spike("5m")));
		assert!(filter.passes(&spike("1h")));
		assert!(!filter.passes(&spike("15m")));
		// Events without a timeframe pass through untouched.
		assert!(filter.passes(&trade(1.0)));
	}
}
