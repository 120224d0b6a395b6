use crate::error::FeedError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: u32 = 3;

/// Shared REST session for a venue. One reqwest client is reused across all
/// snapshot calls; HTTP 429/418/503 responses are retried with a linear
/// 1.5s * attempt backoff, everything else surfaces immediately.
#[derive(Debug, Clone)]
pub struct RestClient {
	client: reqwest::Client,
}

impl RestClient {
	pub fn new() -> Result<Self, FeedError> {
		let client = reqwest::Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()
			.map_err(|e| FeedError::Internal(format!("failed to build HTTP client: {e}")))?;

		Ok(Self { client })
	}

	pub async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T, FeedError> {
		for attempt in 1..=RETRY_ATTEMPTS {
			let response = match self.client.get(url).query(query).send().await {
				Ok(response) => response,
				Err(e) => {
					if attempt == RETRY_ATTEMPTS {
						return Err(FeedError::Transient(format!("GET {url} failed: {e}")));
					}
					warn!(url, error = %e, attempt, "request failed, retrying");
					sleep(Duration::from_secs_f64(f64::from(attempt))).await;
					continue;
				},
			};

			let status = response.status();
			if status.is_success() {
				debug!(url, attempt, "GET succeeded");
				return response
					.json::<T>()
					.await
					.map_err(|e| FeedError::Malformed(format!("failed to decode response from {url}: {e}")));
			}

			if matches!(status.as_u16(), 429 | 418 | 503) && attempt < RETRY_ATTEMPTS {
				let delay = 1.5 * f64::from(attempt);
				warn!(url, status = status.as_u16(), delay, "rate limited, backing off");
				sleep(Duration::from_secs_f64(delay)).await;
				continue;
			}

			let body = response.text().await.unwrap_or_default();
			return Err(FeedError::Transient(format!("HTTP {status} on {url}: {body}")));
		}

		Err(FeedError::Transient(format!("failed to fetch {url} after {RETRY_ATTEMPTS} attempts")))
	}

	/// POST with a JSON body; used by venues with RPC-style snapshot APIs.
	pub async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T, FeedError> {
		for attempt in 1..=RETRY_ATTEMPTS {
			let response = match self.client.post(url).json(body).send().await {
				Ok(response) => response,
				Err(e) => {
					if attempt == RETRY_ATTEMPTS {
						return Err(FeedError::Transient(format!("POST {url} failed: {e}")));
					}
					warn!(url, error = %e, attempt, "request failed, retrying");
					sleep(Duration::from_secs_f64(f64::from(attempt))).await;
					continue;
				},
			};

			let status = response.status();
			if status.is_success() {
				return response
					.json::<T>()
					.await
					.map_err(|e| FeedError::Malformed(format!("failed to decode response from {url}: {e}")));
			}

			if matches!(status.as_u16(), 429 | 418 | 503) && attempt < RETRY_ATTEMPTS {
				let delay = 1.5 * f64::from(attempt);
				warn!(url, status = status.as_u16(), delay, "rate limited, backing off");
				sleep(Duration::from_secs_f64(delay)).await;
				continue;
			}

			let body_text = response.text().await.unwrap_or_default();
			return Err(FeedError::Transient(format!("HTTP {status} on {url}: {body_text}")));
		}

		Err(FeedError::Transient(format!("failed to fetch {url} after {RETRY_ATTEMPTS} attempts")))
	}

	/// Lightweight reachability probe; any 2xx counts as healthy.
	pub async fn ping(&self, url: &str) -> bool {
		match self.client.get(url).send().await {
			Ok(response) => response.status().is_success(),
			Err(_) => false,
		}
	}
}
