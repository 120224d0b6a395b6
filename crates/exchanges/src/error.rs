use thiserror::Error;

/// Closed set of failure kinds at the feed boundary.
///
/// Reconnect decisions are driven by the variant, not by string matching:
/// `Transient` retries with backoff, `SubscriptionRejected` retries at the
/// backoff cap with the feed marked degraded, `Malformed` is counted and
/// skipped without touching the connection.
#[derive(Debug, Error)]
pub enum FeedError {
	#[error("transient transport failure: {0}")]
	Transient(String),

	#[error("malformed payload: {0}")]
	Malformed(String),

	#[error("subscription rejected by venue: {0}")]
	SubscriptionRejected(String),

	#[error("client protocol violation: {0}")]
	ClientProtocol(String),

	#[error("internal error: {0}")]
	Internal(String),
}
