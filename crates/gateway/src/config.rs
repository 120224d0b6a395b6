use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
	pub gateway: GatewayConfig,
	pub streams: StreamsConfig,
	pub oi_vol: OiVolConfig,
	pub keys: KeysConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
	pub http_bind: String,
	pub ws_bind: String,
	/// Comma-separated allowed CORS origins.
	pub cors_origins: String,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			http_bind: "0.0.0.0:8000".to_string(),
			ws_bind: "0.0.0.0:8001".to_string(),
			cors_origins: "http://localhost:3000,http://localhost:5173".to_string(),
		}
	}
}

impl GatewayConfig {
	#[must_use]
	pub fn cors_origins_list(&self) -> Vec<String> {
		self.cors_origins.split(',').map(str::trim).filter(|s| !s.is_empty()).map(ToString::to_string).collect()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
	/// Comma-separated pair tags (e.g. "BTCUSDT,ETHUSDT").
	pub supported_symbols: String,
	pub large_trade_threshold_usd: f64,
	pub liquidation_min_value_usd: f64,
	pub max_symbols_per_connection: usize,
	pub ws_reconnect_max_seconds: u64,
	pub bus_queue_capacity: usize,
}

impl Default for StreamsConfig {
	fn default() -> Self {
		Self {
			supported_symbols: "BTCUSDT,ETHUSDT,SOLUSDT".to_string(),
			large_trade_threshold_usd: 50_000.0,
			liquidation_min_value_usd: 50_000.0,
			max_symbols_per_connection: 10,
			ws_reconnect_max_seconds: 30,
			bus_queue_capacity: 1000,
		}
	}
}

impl StreamsConfig {
	#[must_use]
	pub fn symbols_list(&self) -> Vec<String> {
		self
			.supported_symbols
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(str::to_uppercase)
			.collect()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OiVolConfig {
	pub cycle_seconds: u64,
	pub symbols_limit: usize,
	pub tf_5m: TimeframeConfig,
	pub tf_15m: TimeframeConfig,
	pub tf_1h: TimeframeConfig,
}

impl Default for OiVolConfig {
	fn default() -> Self {
		Self {
			cycle_seconds: 300,
			symbols_limit: 80,
			tf_5m: TimeframeConfig { z_threshold: 3.0, min_oi_usd: 500_000.0, min_vol_usd: 100_000.0 },
			tf_15m: TimeframeConfig { z_threshold: 2.5, min_oi_usd: 1_000_000.0, min_vol_usd: 250_000.0 },
			tf_1h: TimeframeConfig { z_threshold: 2.0, min_oi_usd: 2_500_000.0, min_vol_usd: 1_000_000.0 },
		}
	}
}

impl OiVolConfig {
	#[must_use]
	pub fn thresholds(&self, timeframe: &str) -> Option<&TimeframeConfig> {
		match timeframe {
			"5m" => Some(&self.tf_5m),
			"15m" => Some(&self.tf_15m),
			"1h" => Some(&self.tf_1h),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeframeConfig {
	pub z_threshold: f64,
	pub min_oi_usd: f64,
	pub min_vol_usd: f64,
}

/// Venue API keys; unused for the public feeds the gateway consumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
#[allow(dead_code)]
pub struct KeysConfig {
	pub binance_api_key: String,
	pub binance_secret_key: String,
}

impl Config {
	pub fn load(path: &str) -> Result<Self> {
		let content = match fs::read_to_string(path) {
			Ok(content) => content,
			Err(err) if err.kind() == ErrorKind::NotFound => {
				warn!(path, "config file not found, using defaults");
				return Ok(Self::default());
			},
			Err(err) => {
				return Err(err).with_context(|| format!("failed to read config file: {path}"));
			},
		};

		let config: Self = toml::from_str(&content).context("failed to parse config file")?;
		config.validate()?;

		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.streams.symbols_list().is_empty() {
			anyhow::bail!("supported_symbols must contain at least one pair tag");
		}

		if self.streams.large_trade_threshold_usd <= 0.0 {
			anyhow::bail!("large_trade_threshold_usd must be positive");
		}

		if self.streams.liquidation_min_value_usd < 0.0 {
			anyhow::bail!("liquidation_min_value_usd must be non-negative");
		}

		if self.streams.max_symbols_per_connection == 0 {
			anyhow::bail!("max_symbols_per_connection must be greater than 0");
		}

		if self.streams.bus_queue_capacity == 0 {
			anyhow::bail!("bus_queue_capacity must be greater than 0");
		}

		if self.oi_vol.cycle_seconds == 0 {
			anyhow::bail!("oi_vol cycle_seconds must be greater than 0");
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_validate() {
		let config = Config::default();
		assert!(config.validate().is_ok());
		assert_eq!(config.streams.symbols_list(), vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
		assert_eq!(config.streams.bus_queue_capacity, 1000);
		assert_eq!(config.oi_vol.cycle_seconds, 300);
	}

	#[test]
	fn partial_toml_overrides_defaults() {
		let raw = r#"
			[streams]
			supported_symbols = "btcusdt, ethusdt"
			large_trade_threshold_usd = 100000.0

			[oi_vol]
			symbols_limit = 10
		"#;

		let config: Config = toml::from_str(raw).unwrap();
		assert!(config.validate().is_ok());
		assert_eq!(config.streams.symbols_list(), vec!["BTCUSDT", "ETHUSDT"]);
		assert_eq!(config.streams.large_trade_threshold_usd, 100_000.0);
		assert_eq!(config.oi_vol.symbols_limit, 10);
		// Untouched sections keep their defaults.
		assert_eq!(config.streams.ws_reconnect_max_seconds, 30);
		assert_eq!(config.oi_vol.tf_5m.z_threshold, 3.0);
	}

	#[test]
	fn empty_symbols_fail_validation() {
		let raw = r#"
			[streams]
			supported_symbols = " , "
		"#;

		let config: Config = toml::from_str(raw).unwrap();
		assert!(config.validate().is_err());
	}

	#[test]
	fn timeframe_thresholds_lookup() {
		let config = OiVolConfig::default();
		assert_eq!(config.thresholds("5m").unwrap().z_threshold, 3.0);
		assert_eq!(config.thresholds("15m").unwrap().z_threshold, 2.5);
		assert_eq!(config.thresholds("1h").unwrap().z_threshold, 2.0);
		assert!(config.thresholds("4h").is_none());
	}

	#[test]
	fn cors_origins_split() {
		let gateway = GatewayConfig::default();
		assert_eq!(gateway.cors_origins_list(), vec!["http://localhost:3000", "http://localhost:5173"]);
	}
}
