/// Quote suffixes recognized when converting a pair tag to its coin form.
const QUOTE_SUFFIXES: [&str; 6] = ["USDT", "USDC", "BUSD", "DAI", "TUSD", "USDP"];

/// Converts a pair tag to coin form: `BTCUSDT` -> `BTC`, `FOOUSDC` -> `FOO`.
/// Tags without a recognized quote suffix pass through uppercased.
pub fn to_coin(symbol: &str) -> String {
	let upper = symbol.to_uppercase();
	for suffix in QUOTE_SUFFIXES {
		if upper.len() > suffix.len() && upper.ends_with(suffix) {
			return upper[..upper.len() - suffix.len()].to_string();
		}
	}
	upper
}

pub fn is_usdt_pair(symbol: &str) -> bool {
	symbol.to_uppercase().ends_with("USDT")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_recognized_quote_suffixes() {
		assert_eq!(to_coin("BTCUSDT"), "BTC");
		assert_eq!(to_coin("FOOUSDC"), "FOO");
		assert_eq!(to_coin("XYZBUSD"), "XYZ");
	}

	#[test]
	fn passes_through_coin_form_and_unknown_tags() {
		assert_eq!(to_coin("ETH"), "ETH");
		assert_eq!(to_coin("WEIRD"), "WEIRD");
		assert_eq!(to_coin("btcusdt"), "BTC");
	}

	#[test]
	fn conversion_is_idempotent() {
		for tag in ["BTCUSDT", "ETH", "FOOUSDC", "WEIRD"] {
			let once = to_coin(tag);
			assert_eq!(to_coin(&once), once);
		}
	}

	#[test]
	fn bare_quote_tag_is_not_stripped_to_empty() {
		assert_eq!(to_coin("USDT"), "USDT");
	}

	#[test]
	fn usdt_pair_guard() {
		assert!(is_usdt_pair("BTCUSDT"));
		assert!(is_usdt_pair("btcusdt"));
		assert!(!is_usdt_pair("BTCUSD"));
		assert!(!is_usdt_pair("FOO"));
	}
}
