use serde::Deserialize;

// https://developers.binance.com/docs/derivatives/usds-margined-futures/market-data/rest-api/Exchange-Information
#[derive(Debug, Deserialize)]
pub struct ExchangeInfoResponse {
	pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
	pub symbol: String,
	pub status: String,
	pub quote_asset: String,
	pub contract_type: String,
}

// https://developers.binance.com/docs/derivatives/usds-margined-futures/market-data/rest-api/Open-Interest
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterestResponse {
	pub open_interest: String,
	#[allow(dead_code)]
	pub symbol: String,
	pub time: i64,
}

// https://developers.binance.com/docs/derivatives/usds-margined-futures/market-data/rest-api/Mark-Price
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndexResponse {
	#[allow(dead_code)]
	pub symbol: String,
	pub mark_price: String,
	pub last_funding_rate: String,
	pub next_funding_time: i64,
	pub time: i64,
}

// https://developers.binance.com/docs/derivatives/usds-margined-futures/market-data/rest-api/Open-Interest-Statistics
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterestHistResponse {
	#[allow(dead_code)]
	pub symbol: String,
	pub sum_open_interest_value: String,
	pub timestamp: i64,
}

// https://developers.binance.com/docs/derivatives/usds-margined-futures/market-data/rest-api/Kline-Candlestick-Data
// [open time, open, high, low, close, volume, close time, quote volume, trades, taker base, taker quote, ignore]
pub type KlineRow = (i64, String, String, String, String, String, i64, String, u64, String, String, String);

// https://developers.binance.com/docs/derivatives/usds-margined-futures/websocket-market-streams/Kline-Candlestick-Streams
#[derive(Debug, Deserialize)]
pub struct KlineFrame {
	#[serde(rename = "e")]
	#[allow(dead_code)]
	pub event: String,
	#[serde(rename = "k")]
	pub kline: KlineData,
}

#[derive(Debug, Deserialize)]
pub struct KlineData {
	#[serde(rename = "t")]
	pub start_time: i64,
	#[serde(rename = "o")]
	pub open: String,
	#[serde(rename = "h")]
	pub high: String,
	#[serde(rename = "l")]
	pub low: String,
	#[serde(rename = "c")]
	pub close: String,
	#[serde(rename = "v")]
	pub volume: String,
	#[serde(rename = "q")]
	pub quote_volume: String,
	#[serde(rename = "n")]
	pub trades: u64,
	#[serde(rename = "x")]
	pub is_closed: bool,
}

// https://developers.binance.com/docs/derivatives/usds-margined-futures/websocket-market-streams/Liquidation-Order-Streams
#[derive(Debug, Deserialize)]
pub struct ForceOrder {
	#[serde(rename = "s")]
	pub symbol: String,
	#[serde(rename = "S")]
	pub side: String,
	#[serde(rename = "p")]
	pub price: String,
	#[serde(rename = "q")]
	pub quantity: String,
	#[serde(rename = "T")]
	pub trade_time: i64,
}

// https://developers.binance.com/docs/derivatives/usds-margined-futures/websocket-market-streams/Aggregate-Trade-Streams
#[derive(Debug, Deserialize)]
pub struct AggTradeFrame {
	#[serde(rename = "s")]
	pub symbol: String,
	#[serde(rename = "p")]
	pub price: String,
	#[serde(rename = "q")]
	pub quantity: String,
	#[serde(rename = "m")]
	pub is_buyer_maker: bool,
	#[serde(rename = "T")]
	pub trade_time: i64,
}
