use crate::backoff::ReconnectPolicy;
use crate::error::FeedError;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How a read session over one websocket ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SessionEnd {
	/// The consumer dropped the handle; the feed task must exit.
	Cancelled,
	/// Transport dropped or errored; reconnect with backoff.
	Disconnected,
	/// The venue refused the subscription; retry only at the backoff cap.
	Rejected,
}

/// Keepalive obligation towards the venue. Some venues expect protocol ping
/// frames, others an application-level text message.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Keepalive {
	Frame,
	Text(&'static str),
}

async fn open_session(
	url: &str,
	subscribe_frames: &[String],
	pacing: Option<Duration>,
) -> Result<WsStream, FeedError> {
	let (mut stream, _) =
		connect_async(url).await.map_err(|e| FeedError::Transient(format!("connect {url}: {e}")))?;

	for frame in subscribe_frames {
		stream
			.send(Message::Text(frame.clone().into()))
			.await
			.map_err(|e| FeedError::Transient(format!("subscribe on {url}: {e}")))?;
		if let Some(delay) = pacing {
			sleep(delay).await;
		}
	}

	Ok(stream)
}

/// Reads frames until the session ends, parsing each text frame into zero or
/// more records and forwarding them to the consumer. Frames that do not match
/// the expected shape parse to an empty batch; malformed frames are counted
/// and skipped.
async fn pump<T>(
	stream: WsStream,
	keepalive: Keepalive,
	tx: &mpsc::Sender<T>,
	parse: &(impl Fn(&str) -> Result<Vec<T>, FeedError> + Sync),
	label: &str,
	malformed: &mut u64,
) -> SessionEnd {
	let (mut write, mut read) = stream.split();
	let mut ping = tokio::time::interval(PING_INTERVAL);
	ping.reset();

	loop {
		tokio::select! {
			_ = ping.tick() => {
				let message = match keepalive {
					Keepalive::Frame => Message::Ping(Bytes::new()),
					Keepalive::Text(payload) => Message::Text(payload.into()),
				};
				if write.send(message).await.is_err() {
					return SessionEnd::Disconnected;
				}
			}
			() = tx.closed() => return SessionEnd::Cancelled,
			msg = read.next() => match msg {
				Some(Ok(Message::Text(text))) => match parse(text.as_str()) {
					Ok(records) => {
						for record in records {
							if tx.send(record).await.is_err() {
								return SessionEnd::Cancelled;
							}
						}
					},
					Err(FeedError::SubscriptionRejected(reason)) => {
						error!(stream = label, %reason, "venue rejected subscription");
						return SessionEnd::Rejected;
					},
					Err(e) => {
						*malformed += 1;
						warn!(stream = label, count = *malformed, error = %e, "skipping malformed frame");
					},
				},
				Some(Ok(Message::Ping(payload))) => {
					if write.send(Message::Pong(payload)).await.is_err() {
						return SessionEnd::Disconnected;
					}
				},
				Some(Ok(Message::Close(frame))) => {
					info!(stream = label, ?frame, "server closed connection");
					return SessionEnd::Disconnected;
				},
				Some(Ok(_)) => {},
				Some(Err(e)) => {
					error!(stream = label, error = %e, "websocket error");
					return SessionEnd::Disconnected;
				},
				None => return SessionEnd::Disconnected,
			}
		}
	}
}

/// Long-lived feed loop: connect, subscribe, pump, reconnect with capped
/// exponential backoff until the consumer goes away.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_feed<T: Send>(
	label: &'static str,
	url: String,
	subscribe_frames: Vec<String>,
	subscribe_pacing: Option<Duration>,
	keepalive: Keepalive,
	max_backoff_seconds: u64,
	tx: mpsc::Sender<T>,
	parse: impl Fn(&str) -> Result<Vec<T>, FeedError> + Send + Sync,
) {
	let mut policy = ReconnectPolicy::new(max_backoff_seconds);
	let mut malformed: u64 = 0;

	loop {
		match open_session(&url, &subscribe_frames, subscribe_pacing).await {
			Ok(stream) => {
				info!(stream = label, "connected");
				policy.reset();
				match pump(stream, keepalive, &tx, &parse, label, &mut malformed).await {
					SessionEnd::Cancelled => return,
					SessionEnd::Disconnected => {},
					SessionEnd::Rejected => {
						let delay = policy.max_delay_jittered();
						warn!(
							stream = label,
							delay_secs = delay.as_secs_f64(),
							"feed degraded after subscription rejection, retrying at capped cadence"
						);
						sleep(delay).await;
						continue;
					},
				}
			},
			Err(e) => error!(stream = label, error = %e, "connect failed"),
		}

		if tx.is_closed() {
			return;
		}

		let delay = policy.next_delay();
		if policy.is_degraded() {
			warn!(stream = label, attempts = policy.attempt(), delay_secs = delay.as_secs_f64(), "feed degraded, still retrying");
		} else {
			debug!(stream = label, delay_secs = delay.as_secs_f64(), "reconnecting");
		}
		sleep(delay).await;
	}
}

/// Single-session variant: one connect/subscribe/pump pass, then the task
/// ends. Callers that need to refresh their subscription universe between
/// connections (e.g. symbol discovery) supervise the reconnects themselves.
pub(crate) async fn run_feed_once<T: Send>(
	label: &'static str,
	url: String,
	subscribe_frames: Vec<String>,
	subscribe_pacing: Option<Duration>,
	keepalive: Keepalive,
	tx: mpsc::Sender<T>,
	parse: impl Fn(&str) -> Result<Vec<T>, FeedError> + Send + Sync,
) {
	let mut malformed: u64 = 0;
	match open_session(&url, &subscribe_frames, subscribe_pacing).await {
		Ok(stream) => {
			info!(stream = label, "connected");
			let _ = pump(stream, keepalive, &tx, &parse, label, &mut malformed).await;
		},
		Err(e) => error!(stream = label, error = %e, "connect failed"),
	}
}
