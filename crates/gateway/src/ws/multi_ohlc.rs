use super::ServerWs;
use exchanges::{BinanceExchange, Candle, Exchange, FeedHandle};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

/// A connection must send its first subscribe within this window.
pub const PRE_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(60);
/// After the initial subscription, the client must stay talkative.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const CANDLE_BUFFER: usize = 256;

/// Where the multiplex endpoint gets its per-symbol candle feeds. Injected so
/// sessions can be driven by scripted sources in tests.
pub trait CandleSource: Send + Sync {
	fn open(&self, symbol: &str, interval: &str) -> anyhow::Result<FeedHandle<Candle>>;
}

pub struct BinanceCandleSource {
	exchange: Arc<BinanceExchange>,
}

impl BinanceCandleSource {
	#[must_use]
	pub const fn new(exchange: Arc<BinanceExchange>) -> Self {
		Self { exchange }
	}
}

impl CandleSource for BinanceCandleSource {
	fn open(&self, symbol: &str, interval: &str) -> anyhow::Result<FeedHandle<Candle>> {
		self.exchange.stream_ohlc(symbol, interval)
	}
}

#[derive(Debug, Clone, Copy)]
pub struct MultiOhlcSettings {
	pub max_symbols: usize,
	pub pre_subscribe_timeout: Duration,
	pub idle_timeout: Duration,
}

impl MultiOhlcSettings {
	#[must_use]
	pub const fn new(max_symbols: usize) -> Self {
		Self { max_symbols, pre_subscribe_timeout: PRE_SUBSCRIBE_TIMEOUT, idle_timeout: IDLE_TIMEOUT }
	}
}

#[derive(Debug, Deserialize)]
struct ClientCommand {
	action: String,
	#[serde(default)]
	symbols: Vec<String>,
}

type WsSink = SplitSink<ServerWs, Message>;

fn error_envelope(code: &str, message: &str, symbol: Option<&str>) -> String {
	let mut value = serde_json::json!({ "type": "error", "code": code, "message": message });
	if let Some(symbol) = symbol {
		value["symbol"] = symbol.into();
	}
	value.to_string()
}

fn policy_close(reason: &str) -> CloseFrame {
	CloseFrame { code: CloseCode::Policy, reason: reason.to_string().into() }
}

fn internal_close(reason: &str) -> CloseFrame {
	CloseFrame { code: CloseCode::Error, reason: reason.to_string().into() }
}

/// Multiplexed multi-symbol candle session.
///
/// The client drives subscriptions with `{action, symbols}` control messages;
/// every active symbol owns one upstream kline socket whose candles funnel
/// into this connection. Unsubscribing a symbol cancels exactly its task;
/// disconnecting cancels all of them.
pub async fn run(ws: ServerWs, interval: &str, source: Arc<dyn CandleSource>, settings: MultiOhlcSettings) {
	let (mut write, mut read) = ws.split();
	let (candle_tx, mut candle_rx) = mpsc::channel::<Candle>(CANDLE_BUFFER);
	let mut tasks: HashMap<String, JoinHandle<()>> = HashMap::new();
	let mut subscribed = false;
	let mut deadline = Instant::now() + settings.pre_subscribe_timeout;
	let mut close: Option<CloseFrame> = None;

	loop {
		tokio::select! {
			candle = candle_rx.recv() => {
				// A sender is held in scope, so the channel cannot close under us.
				let Some(candle) = candle else { break };
				match serde_json::to_string(&candle) {
					Ok(json) => {
						if write.send(Message::Text(json.into())).await.is_err() {
							break;
						}
					},
					Err(e) => {
						warn!(error = %e, "failed to serialize candle");
						close = Some(internal_close("serialization failure"));
						break;
					},
				}
			}
			msg = read.next() => match msg {
				Some(Ok(Message::Text(text))) => {
					deadline = Instant::now()
						+ if subscribed { settings.idle_timeout } else { settings.pre_subscribe_timeout };

					match handle_command(
						text.as_str(),
						interval,
						source.as_ref(),
						settings.max_symbols,
						subscribed,
						&mut tasks,
						&candle_tx,
						&mut write,
					)
					.await
					{
						Ok(activated) => {
							if activated && !subscribed {
								subscribed = true;
								deadline = Instant::now() + settings.idle_timeout;
							}
						},
						Err(reason) => {
							close = Some(policy_close(&reason));
							break;
						},
					}
				},
				Some(Ok(Message::Ping(payload))) => {
					if write.send(Message::Pong(payload)).await.is_err() {
						break;
					}
				},
				Some(Ok(Message::Close(_))) | None => break,
				Some(Err(e)) => {
					debug!(error = %e, "multiplex client socket error");
					break;
				},
				_ => {},
			},
			() = tokio::time::sleep_until(deadline) => {
				let reason = if subscribed { "idle timeout" } else { "no subscription within the allowed window" };
				let _ = write.send(Message::Text(error_envelope("TIMEOUT", reason, None).into())).await;
				close = Some(policy_close(reason));
				break;
			}
		}
	}

	// Cancel every per-symbol task and wait for them to wind down.
	let handles: Vec<JoinHandle<()>> = tasks.drain().map(|(_, task)| task).collect();
	for task in &handles {
		task.abort();
	}
	for task in handles {
		let _ = task.await;
	}

	if let Some(frame) = close {
		let _ = write.send(Message::Close(Some(frame))).await;
	}
	let _ = write.close().await;
}

/// Applies one control message. `Ok(true)` means at least one new upstream
/// subscription was activated; `Err` carries a policy-close reason.
#[allow(clippy::too_many_arguments)]
async fn handle_command(
	text: &str,
	interval: &str,
	source: &dyn CandleSource,
	max_symbols: usize,
	subscribed: bool,
	tasks: &mut HashMap<String, JoinHandle<()>>,
	candle_tx: &mpsc::Sender<Candle>,
	write: &mut WsSink,
) -> Result<bool, String> {
	const FIRST_MESSAGE_RULE: &str = "first message must be a subscribe action";

	let Ok(command) = serde_json::from_str::<ClientCommand>(text) else {
		let envelope = error_envelope("INVALID_ACTION", r#"expected {"action", "symbols"}"#, None);
		let _ = write.send(Message::Text(envelope.into())).await;
		return if subscribed { Ok(false) } else { Err(FIRST_MESSAGE_RULE.to_string()) };
	};

	match command.action.as_str() {
		"subscribe" => {
			let mut activated = false;

			for raw in &command.symbols {
				let symbol = raw.trim().to_uppercase();

				if !symbol.ends_with("USDT") {
					let envelope = error_envelope("INVALID_SYMBOL", "symbol must be a USDT pair", Some(&symbol));
					let _ = write.send(Message::Text(envelope.into())).await;
					continue;
				}

				if tasks.contains_key(&symbol) {
					debug!(symbol = %symbol, "already subscribed");
					continue;
				}

				if tasks.len() >= max_symbols {
					let message = format!("maximum of {max_symbols} symbols per connection");
					let envelope = error_envelope("RATE_LIMIT", &message, Some(&symbol));
					let _ = write.send(Message::Text(envelope.into())).await;
					break;
				}

				match source.open(&symbol, interval) {
					Ok(mut feed) => {
						let tx = candle_tx.clone();
						let task = tokio::spawn(async move {
							while let Some(candle) = feed.recv().await {
								if tx.send(candle).await.is_err() {
									break;
								}
							}
						});
						tasks.insert(symbol, task);
						activated = true;
					},
					Err(e) => {
						warn!(symbol = %symbol, error = %e, "failed to open upstream candle stream");
						let envelope =
							error_envelope("SUBSCRIPTION_FAILED", "failed to start upstream stream", Some(&symbol));
						let _ = write.send(Message::Text(envelope.into())).await;
					},
				}
			}

			Ok(activated)
		},
		"unsubscribe" => {
			if !subscribed {
				let envelope = error_envelope("INVALID_ACTION", FIRST_MESSAGE_RULE, None);
				let _ = write.send(Message::Text(envelope.into())).await;
				return Err(FIRST_MESSAGE_RULE.to_string());
			}

			for raw in &command.symbols {
				let symbol = raw.trim().to_uppercase();
				if let Some(task) = tasks.remove(&symbol) {
					task.abort();
					debug!(symbol = %symbol, "unsubscribed");
				}
			}

			Ok(false)
		},
		other => {
			let envelope = error_envelope("INVALID_ACTION", &format!("unknown action: {other}"), None);
			let _ = write.send(Message::Text(envelope.into())).await;
			if subscribed { Ok(false) } else { Err(FIRST_MESSAGE_RULE.to_string()) }
		},
	}
}
