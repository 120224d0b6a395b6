use chrono::Utc;
use exchanges::feed::spawn_feed;
use exchanges::types::{Liquidation, Side, SpikeAlert};
use exchanges::{Candle, ExchangeRegistry, FeedHandle};
use futures_util::{SinkExt, StreamExt};
use gateway::AppContext;
use gateway::bus::{BusEvent, EventBus, TOPIC_LIQUIDATION, TOPIC_OI_SPIKE};
use gateway::config::Config;
use gateway::ws::{self, CandleSource, MultiOhlcSettings};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type ClientWs = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted candle source: each opened symbol emits a candle every few
/// milliseconds until its task is cancelled.
struct FakeCandleSource {
	opened: Mutex<Vec<String>>,
}

impl FakeCandleSource {
	fn new() -> Self {
		Self { opened: Mutex::new(Vec::new()) }
	}

	fn opened(&self) -> Vec<String> {
		self.opened.lock().unwrap().clone()
	}
}

impl CandleSource for FakeCandleSource {
	fn open(&self, symbol: &str, interval: &str) -> anyhow::Result<FeedHandle<Candle>> {
		self.opened.lock().unwrap().push(symbol.to_string());
		let symbol = symbol.to_string();
		let interval = interval.to_string();

		Ok(spawn_feed(move |tx| async move {
			loop {
				if tx.send(sample_candle(&symbol, &interval)).await.is_err() {
					break;
				}
				sleep(Duration::from_millis(25)).await;
			}
		}))
	}
}

fn sample_candle(symbol: &str, interval: &str) -> Candle {
	Candle {
		exchange: "binance".to_string(),
		symbol: symbol.to_string(),
		interval: interval.to_string(),
		timestamp: Utc::now(),
		open: 100.0,
		high: 110.0,
		low: 95.0,
		close: 105.0,
		volume: 2.0,
		quote_volume: 210.0,
		trades_count: 12,
		is_closed: false,
	}
}

fn liquidation(value: f64) -> BusEvent {
	BusEvent::Liquidation(Liquidation {
		exchange: "binance".to_string(),
		symbol: "BTCUSDT".to_string(),
		side: Side::Sell,
		price: value,
		quantity: 1.0,
		value,
		timestamp: Utc::now(),
	})
}

fn spike(timeframe: &str) -> BusEvent {
	BusEvent::OiSpike(SpikeAlert {
		exchange: "binance".to_string(),
		symbol: "BTCUSDT".to_string(),
		timeframe: timeframe.to_string(),
		z_oi: 4.0,
		z_vol: 3.2,
		confirmed: true,
		timestamp: Utc::now(),
	})
}

fn test_context(
	bus: Arc<EventBus>,
	candles: Arc<dyn CandleSource>,
	multi_ohlc: MultiOhlcSettings,
) -> Arc<AppContext> {
	Arc::new(AppContext {
		config: Config::default(),
		bus,
		registry: Arc::new(ExchangeRegistry::with_default_venues(30).unwrap()),
		candles,
		multi_ohlc,
	})
}

async fn start_server(ctx: Arc<AppContext>) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(ws::serve(listener, ctx));
	addr
}

async fn connect(addr: SocketAddr, path: &str) -> ClientWs {
	let (ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
	ws
}

/// Next text frame as JSON; panics on timeout or close.
async fn next_json(ws: &mut ClientWs) -> Value {
	loop {
		let msg = timeout(RECV_TIMEOUT, ws.next()).await.expect("timed out waiting for frame");
		match msg.expect("socket ended").expect("socket error") {
			Message::Text(text) => return serde_json::from_str(text.as_str()).expect("invalid JSON frame"),
			Message::Close(frame) => panic!("unexpected close: {frame:?}"),
			_ => {},
		}
	}
}

/// Reads until the server closes, returning the close code and reason.
async fn expect_close(ws: &mut ClientWs) -> (CloseCode, String) {
	loop {
		let msg = timeout(RECV_TIMEOUT, ws.next()).await.expect("timed out waiting for close");
		match msg {
			Some(Ok(Message::Close(Some(frame)))) => return (frame.code, frame.reason.to_string()),
			Some(Ok(_)) => {},
			Some(Err(_)) | None => panic!("socket ended without a close frame"),
		}
	}
}

async fn wait_for_subscriber(bus: &EventBus, topic: &str) {
	for _ in 0..100 {
		if bus.subscriber_count(topic).await > 0 {
			return;
		}
		sleep(Duration::from_millis(10)).await;
	}
	panic!("no subscriber appeared on {topic}");
}

fn default_settings() -> MultiOhlcSettings {
	MultiOhlcSettings::new(10)
}

#[tokio::test]
async fn unknown_route_closes_with_policy_code() {
	let ctx = test_context(Arc::new(EventBus::new(16)), Arc::new(FakeCandleSource::new()), default_settings());
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/nope").await;
	let (code, reason) = expect_close(&mut ws).await;
	assert_eq!(code, CloseCode::Policy);
	assert_eq!(reason, "unknown endpoint");
}

#[tokio::test]
async fn unknown_exchange_closes_with_reason() {
	let ctx = test_context(Arc::new(EventBus::new(16)), Arc::new(FakeCandleSource::new()), default_settings());
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/kraken/BTCUSDT/ohlc?interval=1m").await;
	let (code, reason) = expect_close(&mut ws).await;
	assert_eq!(code, CloseCode::Policy);
	assert!(reason.contains("unknown exchange"), "reason was: {reason}");
}

#[tokio::test]
async fn unsupported_capability_closes_with_policy_code() {
	let ctx = test_context(Arc::new(EventBus::new(16)), Arc::new(FakeCandleSource::new()), default_settings());
	let addr = start_server(ctx).await;

	// OKX exposes liquidations only.
	let mut ws = connect(addr, "/ws/okx/BTCUSDT/ohlc?interval=1m").await;
	let (code, reason) = expect_close(&mut ws).await;
	assert_eq!(code, CloseCode::Policy);
	assert!(reason.contains("does not support"), "reason was: {reason}");
}

#[tokio::test]
async fn ohlc_without_interval_is_rejected() {
	let ctx = test_context(Arc::new(EventBus::new(16)), Arc::new(FakeCandleSource::new()), default_settings());
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/binance/BTCUSDT/ohlc").await;
	let (code, reason) = expect_close(&mut ws).await;
	assert_eq!(code, CloseCode::Policy);
	assert!(reason.contains("interval"), "reason was: {reason}");
}

#[tokio::test]
async fn liquidation_firehose_applies_the_connection_filter() {
	let bus = Arc::new(EventBus::new(64));
	let ctx = test_context(bus.clone(), Arc::new(FakeCandleSource::new()), default_settings());
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/all/liquidations?min_value_usd=100000").await;
	wait_for_subscriber(&bus, TOPIC_LIQUIDATION).await;

	bus.publish(TOPIC_LIQUIDATION, liquidation(50_000.0)).await;
	bus.publish(TOPIC_LIQUIDATION, liquidation(200_000.0)).await;

	let event = next_json(&mut ws).await;
	assert_eq!(event["type"], "liquidation");
	assert_eq!(event["value"], 200_000.0);
	assert_eq!(event["side"], "sell");

	ws.close(None).await.unwrap();
}

#[tokio::test]
async fn oi_vol_firehose_filters_timeframes() {
	let bus = Arc::new(EventBus::new(64));
	let ctx = test_context(bus.clone(), Arc::new(FakeCandleSource::new()), default_settings());
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/oi-vol?timeframes=5m").await;
	wait_for_subscriber(&bus, TOPIC_OI_SPIKE).await;

	bus.publish(TOPIC_OI_SPIKE, spike("15m")).await;
	bus.publish(TOPIC_OI_SPIKE, spike("5m")).await;

	let event = next_json(&mut ws).await;
	assert_eq!(event["type"], "oi_spike");
	assert_eq!(event["timeframe"], "5m");
	assert_eq!(event["confirmed"], true);

	ws.close(None).await.unwrap();
}

#[tokio::test]
async fn multiplex_subscribe_starts_streams_and_validates_symbols() {
	let source = Arc::new(FakeCandleSource::new());
	let ctx = test_context(Arc::new(EventBus::new(16)), source.clone(), MultiOhlcSettings::new(2));
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/binance/multi/ohlc?interval=1m").await;

	ws.send(Message::Text(r#"{"action":"subscribe","symbols":["BTCUSDT","ETHUSDT"]}"#.into())).await.unwrap();

	// Candles from both upstream streams reach the client.
	let mut seen_btc = false;
	let mut seen_eth = false;
	while !(seen_btc && seen_eth) {
		let frame = next_json(&mut ws).await;
		match frame["symbol"].as_str() {
			Some("BTCUSDT") => seen_btc = true,
			Some("ETHUSDT") => seen_eth = true,
			other => panic!("unexpected frame for {other:?}"),
		}
	}
	assert_eq!(source.opened(), vec!["BTCUSDT", "ETHUSDT"]);

	// Invalid symbol: one error envelope, no new upstream stream.
	ws.send(Message::Text(r#"{"action":"subscribe","symbols":["FOO"]}"#.into())).await.unwrap();
	loop {
		let frame = next_json(&mut ws).await;
		if frame["type"] == "error" {
			assert_eq!(frame["code"], "INVALID_SYMBOL");
			assert_eq!(frame["symbol"], "FOO");
			break;
		}
	}
	assert_eq!(source.opened().len(), 2);

	// Connection cap: RATE_LIMIT, session stays open.
	ws.send(Message::Text(r#"{"action":"subscribe","symbols":["XRPUSDT"]}"#.into())).await.unwrap();
	loop {
		let frame = next_json(&mut ws).await;
		if frame["type"] == "error" {
			assert_eq!(frame["code"], "RATE_LIMIT");
			break;
		}
	}
	assert_eq!(source.opened().len(), 2);

	// Candles keep flowing after the errors.
	let frame = next_json(&mut ws).await;
	assert!(frame["symbol"].as_str().is_some());

	ws.close(None).await.unwrap();
}

#[tokio::test]
async fn multiplex_unsubscribe_cancels_exactly_that_stream() {
	let source = Arc::new(FakeCandleSource::new());
	let ctx = test_context(Arc::new(EventBus::new(16)), source.clone(), default_settings());
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/binance/multi/ohlc?interval=1m").await;

	ws.send(Message::Text(r#"{"action":"subscribe","symbols":["BTCUSDT","ETHUSDT"]}"#.into())).await.unwrap();

	// Wait until both streams demonstrably run.
	let mut seen_btc = false;
	let mut seen_eth = false;
	while !(seen_btc && seen_eth) {
		let frame = next_json(&mut ws).await;
		match frame["symbol"].as_str() {
			Some("BTCUSDT") => seen_btc = true,
			Some("ETHUSDT") => seen_eth = true,
			_ => {},
		}
	}

	ws.send(Message::Text(r#"{"action":"unsubscribe","symbols":["BTCUSDT"]}"#.into())).await.unwrap();

	// Let in-flight frames from the cancelled stream drain.
	sleep(Duration::from_millis(300)).await;
	while timeout(Duration::from_millis(10), ws.next()).await.is_ok() {}

	// Everything that still arrives belongs to the surviving stream.
	for _ in 0..5 {
		let frame = next_json(&mut ws).await;
		assert_eq!(frame["symbol"], "ETHUSDT");
	}

	ws.close(None).await.unwrap();
}

#[tokio::test]
async fn multiplex_rejects_a_non_subscribe_first_message() {
	let ctx = test_context(Arc::new(EventBus::new(16)), Arc::new(FakeCandleSource::new()), default_settings());
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/binance/multi/ohlc?interval=1m").await;
	ws.send(Message::Text(r#"{"action":"unsubscribe","symbols":["BTCUSDT"]}"#.into())).await.unwrap();

	let frame = next_json(&mut ws).await;
	assert_eq!(frame["type"], "error");
	assert_eq!(frame["code"], "INVALID_ACTION");

	let (code, _) = expect_close(&mut ws).await;
	assert_eq!(code, CloseCode::Policy);
}

#[tokio::test]
async fn multiplex_times_out_without_an_initial_subscribe() {
	let settings = MultiOhlcSettings {
		pre_subscribe_timeout: Duration::from_millis(200),
		..MultiOhlcSettings::new(10)
	};
	let ctx = test_context(Arc::new(EventBus::new(16)), Arc::new(FakeCandleSource::new()), settings);
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/binance/multi/ohlc?interval=1m").await;

	let frame = next_json(&mut ws).await;
	assert_eq!(frame["type"], "error");
	assert_eq!(frame["code"], "TIMEOUT");

	let (code, _) = expect_close(&mut ws).await;
	assert_eq!(code, CloseCode::Policy);
}

#[tokio::test]
async fn multiplex_rejects_malformed_first_frames() {
	let ctx = test_context(Arc::new(EventBus::new(16)), Arc::new(FakeCandleSource::new()), default_settings());
	let addr = start_server(ctx).await;

	let mut ws = connect(addr, "/ws/binance/multi/ohlc?interval=1m").await;
	ws.send(Message::Text("{not json".into())).await.unwrap();

	let frame = next_json(&mut ws).await;
	assert_eq!(frame["type"], "error");
	assert_eq!(frame["code"], "INVALID_ACTION");

	let (code, _) = expect_close(&mut ws).await;
	assert_eq!(code, CloseCode::Policy);
}
