use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction as reported by the venue, normalized to lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
	Buy,
	Sell,
}

impl Side {
	/// Parses a venue side field ("Buy", "SELL", "buy", ...). Unknown values map to None.
	pub fn from_venue(raw: &str) -> Option<Self> {
		if raw.eq_ignore_ascii_case("buy") {
			Some(Self::Buy)
		} else if raw.eq_ignore_ascii_case("sell") {
			Some(Self::Sell)
		} else {
			None
		}
	}
}

impl std::fmt::Display for Side {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Buy => write!(f, "buy"),
			Self::Sell => write!(f, "sell"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
	pub exchange: String,
	pub symbol: String,
	pub interval: String,
	pub timestamp: DateTime<Utc>,
	pub open: f64,
	pub high: f64,
	pub low: f64,
	pub close: f64,
	pub volume: f64,
	pub quote_volume: f64,
	pub trades_count: u64,
	pub is_closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenInterest {
	pub exchange: String,
	pub symbol: String,
	pub timestamp: DateTime<Utc>,
	pub open_interest: f64,
	/// Notional value in USD, when the venue exposes (or a mark price allows) it.
	pub open_interest_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
	pub exchange: String,
	pub symbol: String,
	pub timestamp: DateTime<Utc>,
	pub funding_rate: f64,
	pub funding_time: DateTime<Utc>,
	pub next_funding_rate: Option<f64>,
	pub next_funding_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidation {
	pub exchange: String,
	pub symbol: String,
	pub side: Side,
	pub price: f64,
	pub quantity: f64,
	pub value: f64,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LargeTrade {
	pub exchange: String,
	pub symbol: String,
	pub side: Side,
	pub price: f64,
	pub quantity: f64,
	pub value: f64,
	pub is_buyer_maker: bool,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeAlert {
	pub exchange: String,
	pub symbol: String,
	pub timeframe: String,
	pub z_oi: f64,
	pub z_vol: f64,
	pub confirmed: bool,
	pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn side_serializes_lowercase() {
		assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
		assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"sell\"");
	}

	#[test]
	fn side_parses_venue_casing() {
		assert_eq!(Side::from_venue("Buy"), Some(Side::Buy));
		assert_eq!(Side::from_venue("SELL"), Some(Side::Sell));
		assert_eq!(Side::from_venue("hold"), None);
	}
}
