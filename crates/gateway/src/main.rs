use anyhow::{Context, Result};
use exchanges::{BinanceExchange, ExchangeRegistry};
use gateway::bus::EventBus;
use gateway::config::Config;
use gateway::http::{self, HttpState};
use gateway::services::{LargeTradesService, LiquidationsService, OiVolMonitor};
use gateway::ws::{BinanceCandleSource, MultiOhlcSettings};
use gateway::{AppContext, ws};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[actix_web::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	info!("starting market data gateway");

	let config = Config::load("config.toml").context("failed to load configuration")?;
	let reconnect_cap = config.streams.ws_reconnect_max_seconds;

	let registry = Arc::new(
		ExchangeRegistry::with_default_venues(reconnect_cap).context("failed to build exchange registry")?,
	);
	registry.initialize_all().await;

	let bus = Arc::new(EventBus::new(config.streams.bus_queue_capacity));

	let liquidations = Arc::new(
		LiquidationsService::new(bus.clone(), config.streams.liquidation_min_value_usd, reconnect_cap)
			.context("failed to build liquidations service")?,
	);
	let large_trades = Arc::new(
		LargeTradesService::new(
			bus.clone(),
			config.streams.symbols_list(),
			config.streams.large_trade_threshold_usd,
			reconnect_cap,
		)
		.context("failed to build large trades service")?,
	);
	let oi_vol = Arc::new(
		OiVolMonitor::new(bus.clone(), config.oi_vol.clone(), reconnect_cap)
			.context("failed to build OI/Vol monitor")?,
	);

	liquidations.start().await;
	large_trades.start().await;
	oi_vol.start().await;
	info!("aggregation services started");

	let binance =
		Arc::new(BinanceExchange::with_reconnect_cap(reconnect_cap).context("failed to build Binance connector")?);
	let ctx = Arc::new(AppContext {
		multi_ohlc: MultiOhlcSettings::new(config.streams.max_symbols_per_connection),
		candles: Arc::new(BinanceCandleSource::new(binance)),
		bus: bus.clone(),
		registry: registry.clone(),
		config: config.clone(),
	});

	let ws_listener = TcpListener::bind(&config.gateway.ws_bind)
		.await
		.with_context(|| format!("failed to bind websocket listener on {}", config.gateway.ws_bind))?;
	info!(addr = %config.gateway.ws_bind, "websocket server listening");

	let ws_ctx = ctx.clone();
	tokio::spawn(async move {
		ws::serve(ws_listener, ws_ctx).await;
	});

	let http_state = HttpState {
		registry: registry.clone(),
		services: vec![
			("liquidations", liquidations.status()),
			("large_trades", large_trades.status()),
			("oi_vol", oi_vol.status()),
		],
	};
	info!(addr = %config.gateway.http_bind, "http server listening");

	http::serve(&config.gateway.http_bind, http_state, config.gateway.cors_origins_list())
		.with_context(|| format!("failed to bind http listener on {}", config.gateway.http_bind))?
		.await?;

	// The HTTP server returns once a shutdown signal lands.
	info!("shutting down");
	liquidations.stop().await;
	large_trades.stop().await;
	oi_vol.stop().await;
	registry.shutdown_all().await;

	Ok(())
}
