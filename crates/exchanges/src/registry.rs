use crate::{BinanceExchange, BybitExchange, Capabilities, Exchange, Feature, HyperliquidExchange, OkxExchange};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Central venue registry: tag -> connector, with orchestrated lifecycle.
/// Lookup is case-insensitive; a failing connector never takes its siblings
/// down during startup, shutdown, or health checks.
pub struct ExchangeRegistry {
	exchanges: HashMap<String, Arc<dyn Exchange>>,
}

impl ExchangeRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self { exchanges: HashMap::new() }
	}

	/// Registry with every supported venue, sharing one reconnect cap.
	pub fn with_default_venues(max_reconnect_seconds: u64) -> Result<Self> {
		let mut registry = Self::new();
		registry.register(Arc::new(BinanceExchange::with_reconnect_cap(max_reconnect_seconds)?));
		registry.register(Arc::new(BybitExchange::with_reconnect_cap(max_reconnect_seconds)?));
		registry.register(Arc::new(HyperliquidExchange::with_reconnect_cap(max_reconnect_seconds)?));
		registry.register(Arc::new(OkxExchange::with_reconnect_cap(max_reconnect_seconds)));
		Ok(registry)
	}

	pub fn register(&mut self, exchange: Arc<dyn Exchange>) {
		self.exchanges.insert(exchange.name().to_lowercase(), exchange);
	}

	#[must_use]
	pub fn get(&self, name: &str) -> Option<Arc<dyn Exchange>> {
		self.exchanges.get(&name.to_lowercase()).cloned()
	}

	#[must_use]
	pub fn list(&self) -> Vec<&'static str> {
		let mut names: Vec<_> = self.exchanges.values().map(|e| e.name()).collect();
		names.sort_unstable();
		names
	}

	#[must_use]
	pub fn capabilities(&self, name: &str) -> Option<Capabilities> {
		self.get(name).map(|e| e.capabilities())
	}

	/// Venues providing a feature, sorted by tag.
	#[must_use]
	pub fn exchanges_with(&self, feature: Feature) -> Vec<&'static str> {
		let mut names: Vec<_> =
			self.exchanges.values().filter(|e| e.supports(feature)).map(|e| e.name()).collect();
		names.sort_unstable();
		names
	}

	pub async fn initialize_all(&self) {
		for exchange in self.exchanges.values() {
			match exchange.initialize().await {
				Ok(()) => info!(exchange = exchange.name(), "connector initialized"),
				Err(e) => error!(exchange = exchange.name(), error = %e, "connector failed to initialize"),
			}
		}
	}

	pub async fn shutdown_all(&self) {
		for exchange in self.exchanges.values() {
			if let Err(e) = exchange.shutdown().await {
				warn!(exchange = exchange.name(), error = %e, "connector shutdown failed");
			}
		}
	}

	pub async fn health_check_all(&self) -> HashMap<String, bool> {
		let mut results = HashMap::new();
		for exchange in self.exchanges.values() {
			results.insert(exchange.name().to_string(), exchange.health_check().await);
		}
		results
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.exchanges.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.exchanges.is_empty()
	}
}

impl Default for ExchangeRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn registry() -> ExchangeRegistry {
		ExchangeRegistry::with_default_venues(30).unwrap()
	}

	#[test]
	fn lookup_is_case_insensitive() {
		let registry = registry();
		assert!(registry.get("binance").is_some());
		assert!(registry.get("Binance").is_some());
		assert!(registry.get("BYBIT").is_some());
		assert!(registry.get("kraken").is_none());
	}

	#[test]
	fn lists_all_venues_sorted() {
		assert_eq!(registry().list(), vec!["binance", "bybit", "hyperliquid", "okx"]);
	}

	#[test]
	fn feature_filter_respects_capabilities() {
		let registry = registry();
		assert_eq!(registry.exchanges_with(Feature::Liquidations), vec!["binance", "bybit", "okx"]);
		assert_eq!(registry.exchanges_with(Feature::Ohlc), vec!["binance", "bybit", "hyperliquid"]);
		assert_eq!(registry.exchanges_with(Feature::LargeTrades), vec!["binance", "bybit", "hyperliquid"]);
	}

	#[test]
	fn capability_query_per_venue() {
		let registry = registry();
		let okx = registry.capabilities("okx").unwrap();
		assert!(okx.liquidations);
		assert!(!okx.ohlc);

		let hyperliquid = registry.capabilities("hyperliquid").unwrap();
		assert!(!hyperliquid.liquidations);
		assert!(hyperliquid.large_trades);
	}
}
