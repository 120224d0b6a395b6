pub mod large_trades;
pub mod liquidations;
pub mod oi_vol;

pub use large_trades::LargeTradesService;
pub use liquidations::LiquidationsService;
pub use oi_vol::OiVolMonitor;

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Delay before a supervisor restarts a venue task that should not have ended.
pub const SUPERVISOR_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Per-venue degraded markers, surfaced on the HTTP status endpoint. A
/// degraded feed keeps retrying; the marker only records that it has been
/// failing for a while.
#[derive(Debug, Default)]
pub struct FeedStatus {
	degraded: RwLock<HashMap<String, bool>>,
}

impl FeedStatus {
	pub fn set_degraded(&self, venue: &str, degraded: bool) {
		if let Ok(mut map) = self.degraded.write() {
			map.insert(venue.to_string(), degraded);
		}
	}

	#[must_use]
	pub fn is_degraded(&self, venue: &str) -> bool {
		self.degraded.read().map(|map| map.get(venue).copied().unwrap_or(false)).unwrap_or(false)
	}

	#[must_use]
	pub fn snapshot(&self) -> HashMap<String, bool> {
		self.degraded.read().map(|map| map.clone()).unwrap_or_default()
	}
}
