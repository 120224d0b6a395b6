use tracing::warn;

/// Canonical candle intervals accepted at the API surface.
pub const CANONICAL_INTERVALS: [&str; 13] =
	["1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "12h", "1d", "1w", "1M"];

pub fn is_canonical(interval: &str) -> bool {
	CANONICAL_INTERVALS.contains(&interval)
}

/// Binance uses the canonical encoding directly. Unknown tokens degrade to 1m.
pub fn to_binance(interval: &str) -> String {
	if is_canonical(interval) {
		interval.to_string()
	} else {
		warn!(interval, "unknown interval, defaulting to 1m");
		"1m".to_string()
	}
}

/// Bybit encodes intervals as minute counts plus letter codes for day and up.
/// Supported: 1, 3, 5, 15, 30, 60, 120, 240, 360, 720, D, W, M.
pub fn to_bybit(interval: &str) -> String {
	let mapped = match interval {
		"1m" => "1",
		"3m" => "3",
		"5m" => "5",
		"15m" => "15",
		"30m" => "30",
		"1h" => "60",
		"2h" => "120",
		"4h" => "240",
		"6h" => "360",
		"12h" => "720",
		"1d" => "D",
		"1w" => "W",
		"1M" => "M",
		other => {
			warn!(interval = other, "unknown interval, defaulting to 1m");
			"1"
		},
	};
	mapped.to_string()
}

/// Hyperliquid accepts the canonical encoding. Unknown tokens degrade to 1m.
pub fn to_hyperliquid(interval: &str) -> String {
	if is_canonical(interval) {
		interval.to_string()
	} else {
		warn!(interval, "unknown interval, defaulting to 1m");
		"1m".to_string()
	}
}

/// Interval span in milliseconds, used to window candle snapshot requests.
pub fn interval_to_millis(interval: &str) -> i64 {
	let minute = 60_000;
	match interval {
		"1m" => minute,
		"3m" => 3 * minute,
		"5m" => 5 * minute,
		"15m" => 15 * minute,
		"30m" => 30 * minute,
		"1h" => 60 * minute,
		"2h" => 120 * minute,
		"4h" => 240 * minute,
		"6h" => 360 * minute,
		"12h" => 720 * minute,
		"1d" => 1440 * minute,
		"1w" => 7 * 1440 * minute,
		"1M" => 30 * 1440 * minute,
		other => {
			warn!(interval = other, "unknown interval, assuming 1m span");
			minute
		},
	}
}
