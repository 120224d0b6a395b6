use rand::Rng;
use std::time::Duration;

/// Default cap on the reconnect delay, in seconds.
pub const DEFAULT_MAX_RECONNECT_SECONDS: u64 = 30;

/// Consecutive failed attempts after which a feed reports itself degraded.
pub const DEGRADED_AFTER_ATTEMPTS: u32 = 5;

/// Exponential reconnect backoff: 1s, 2s, 4s, ... capped at `max_delay`,
/// with +/-25% jitter so many feeds do not reconnect in lockstep after a
/// shared upstream blip. Reset after a successful subscription.
#[derive(Debug)]
pub struct ReconnectPolicy {
	attempt: u32,
	max_delay: Duration,
}

impl ReconnectPolicy {
	#[must_use]
	pub const fn new(max_delay_seconds: u64) -> Self {
		Self { attempt: 0, max_delay: Duration::from_secs(max_delay_seconds) }
	}

	/// Registers a failed attempt and returns the delay before the next one.
	pub fn next_delay(&mut self) -> Duration {
		self.attempt = self.attempt.saturating_add(1);
		// Cap the shift so the exponent cannot overflow long before max_delay kicks in.
		let exponent = (self.attempt - 1).min(16);
		let base = Duration::from_secs(1u64 << exponent).min(self.max_delay);
		apply_jitter(base)
	}

	/// Delay used when the venue rejected the subscription outright: retry at
	/// the cap cadence instead of walking the exponential ramp again.
	pub fn max_delay_jittered(&self) -> Duration {
		apply_jitter(self.max_delay)
	}

	pub const fn reset(&mut self) {
		self.attempt = 0;
	}

	#[must_use]
	pub const fn attempt(&self) -> u32 {
		self.attempt
	}

	#[must_use]
	pub const fn is_degraded(&self) -> bool {
		self.attempt >= DEGRADED_AFTER_ATTEMPTS
	}
}

fn apply_jitter(base: Duration) -> Duration {
	let factor = rand::rng().random_range(0.75..=1.25);
	base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn assert_within_jitter(delay: Duration, expected_seconds: f64) {
		let secs = delay.as_secs_f64();
		assert!(secs >= expected_seconds * 0.75, "delay {secs}s below jitter floor of {expected_seconds}s");
		assert!(secs <= expected_seconds * 1.25, "delay {secs}s above jitter ceiling of {expected_seconds}s");
	}

	#[test]
	fn delays_double_then_cap() {
		let mut policy = ReconnectPolicy::new(30);
		assert_within_jitter(policy.next_delay(), 1.0);
		assert_within_jitter(policy.next_delay(), 2.0);
		assert_within_jitter(policy.next_delay(), 4.0);
		assert_within_jitter(policy.next_delay(), 8.0);
		assert_within_jitter(policy.next_delay(), 16.0);
		assert_within_jitter(policy.next_delay(), 30.0);
		assert_within_jitter(policy.next_delay(), 30.0);
	}

	#[test]
	fn reset_restarts_the_ramp() {
		let mut policy = ReconnectPolicy::new(30);
		for _ in 0..6 {
			policy.next_delay();
		}
		assert!(policy.is_degraded());
		policy.reset();
		assert!(!policy.is_degraded());
		assert_within_jitter(policy.next_delay(), 1.0);
	}

	#[test]
	fn degraded_after_repeated_failures() {
		let mut policy = ReconnectPolicy::new(30);
		for _ in 0..DEGRADED_AFTER_ATTEMPTS {
			policy.next_delay();
		}
		assert!(policy.is_degraded());
	}
}
