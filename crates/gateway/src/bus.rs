use exchanges::types::{LargeTrade, Liquidation, SpikeAlert};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

pub const TOPIC_LIQUIDATION: &str = "liquidation";
pub const TOPIC_LARGE_TRADE: &str = "large_trade";
pub const TOPIC_OI_SPIKE: &str = "oi_spike";

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Event published on the bus; serializes with a `type` tag next to the
/// record fields, which is exactly the wire shape the firehose endpoints emit.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
	Liquidation(Liquidation),
	LargeTrade(LargeTrade),
	OiSpike(SpikeAlert),
}

impl BusEvent {
	/// Notional value for the min-value endpoint filters; spike alerts have none.
	#[must_use]
	pub const fn value_usd(&self) -> Option<f64> {
		match self {
			Self::Liquidation(liquidation) => Some(liquidation.value),
			Self::LargeTrade(trade) => Some(trade.value),
			Self::OiSpike(_) => None,
		}
	}

	#[must_use]
	pub fn timeframe(&self) -> Option<&str> {
		match self {
			Self::OiSpike(alert) => Some(&alert.timeframe),
			_ => None,
		}
	}
}

struct TopicSubscriber {
	id: u64,
	tx: mpsc::Sender<BusEvent>,
}

/// Receiving end of a bus subscription. Hand it back via
/// [`EventBus::unsubscribe`] when the consumer goes away; queues left behind
/// by a dropped subscription are pruned on the next publish to the topic.
#[derive(Debug)]
pub struct Subscription {
	topic: String,
	id: u64,
	rx: mpsc::Receiver<BusEvent>,
}

impl Subscription {
	pub async fn recv(&mut self) -> Option<BusEvent> {
		self.rx.recv().await
	}

	pub fn try_recv(&mut self) -> Option<BusEvent> {
		self.rx.try_recv().ok()
	}

	#[must_use]
	pub fn topic(&self) -> &str {
		&self.topic
	}
}

/// Topic-keyed in-process pub/sub.
///
/// Every subscriber owns a bounded queue; `publish` never blocks and drops
/// the event for a subscriber whose queue is full, counting the drop. This is
/// deliberate: the gateway prefers fresh telemetry over complete telemetry,
/// and a slow consumer must not stall the pipeline for its peers.
pub struct EventBus {
	topics: RwLock<HashMap<String, Vec<TopicSubscriber>>>,
	capacity: usize,
	next_id: AtomicU64,
	dropped: AtomicU64,
}

impl EventBus {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		Self { topics: RwLock::new(HashMap::new()), capacity, next_id: AtomicU64::new(0), dropped: AtomicU64::new(0) }
	}

	pub async fn subscribe(&self, topic: &str) -> Subscription {
		let (tx, rx) = mpsc::channel(self.capacity);
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);

		let mut topics = self.topics.write().await;
		let subscribers = topics.entry(topic.to_string()).or_default();
		subscribers.push(TopicSubscriber { id, tx });
		debug!(topic, total = subscribers.len(), "subscriber added");

		Subscription { topic: topic.to_string(), id, rx }
	}

	pub async fn unsubscribe(&self, subscription: Subscription) {
		let Subscription { topic, id, mut rx } = subscription;

		{
			let mut topics = self.topics.write().await;
			if let Some(subscribers) = topics.get_mut(&topic) {
				subscribers.retain(|s| s.id != id);
				debug!(topic, total = subscribers.len(), "subscriber removed");
			}
		}

		// Drain whatever was still queued so the buffers release immediately.
		rx.close();
		while rx.try_recv().is_ok() {}
	}

	pub async fn publish(&self, topic: &str, event: BusEvent) {
		let mut closed = Vec::new();

		{
			let topics = self.topics.read().await;
			let Some(subscribers) = topics.get(topic) else {
				return;
			};

			for subscriber in subscribers {
				match subscriber.tx.try_send(event.clone()) {
					Ok(()) => {},
					Err(mpsc::error::TrySendError::Full(_)) => {
						self.dropped.fetch_add(1, Ordering::Relaxed);
						warn!(topic, "dropping event for slow subscriber");
					},
					Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
				}
			}
		}

		if !closed.is_empty() {
			let mut topics = self.topics.write().await;
			if let Some(subscribers) = topics.get_mut(topic) {
				subscribers.retain(|s| !closed.contains(&s.id));
			}
		}
	}

	/// Events dropped because a subscriber queue was full, over the bus lifetime.
	#[must_use]
	pub fn dropped_events(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}

	pub async fn subscriber_count(&self, topic: &str) -> usize {
		self.topics.read().await.get(topic).map_or(0, Vec::len)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use exchanges::Side;

	fn liquidation(value: f64) -> BusEvent {
		BusEvent::Liquidation(Liquidation {
			exchange: "binance".to_string(),
			symbol: "BTCUSDT".to_string(),
			side: Side::Sell,
			price: 1.0,
			quantity: value,
			value,
			timestamp: Utc::now(),
		})
	}

	#[tokio::test]
	async fn events_are_tagged_on_the_wire() {
		let json = serde_json::to_value(liquidation(5.0)).unwrap();
		assert_eq!(json["type"], "liquidation");
		assert_eq!(json["symbol"], "BTCUSDT");
		assert_eq!(json["value"], 5.0);
	}

	#[tokio::test]
	async fn subscriber_receives_in_publish_order() {
		let bus = EventBus::new(100);
		let mut sub = bus.subscribe(TOPIC_LIQUIDATION).await;

		for i in 0..50 {
			bus.publish(TOPIC_LIQUIDATION, liquidation(f64::from(i))).await;
		}

		for i in 0..50 {
			let event = sub.recv().await.unwrap();
			assert_eq!(event.value_usd(), Some(f64::from(i)));
		}
	}

	#[tokio::test]
	async fn full_queue_drops_without_blocking() {
		let bus = EventBus::new(8);
		let mut sub = bus.subscribe(TOPIC_LIQUIDATION).await;

		for i in 0..20 {
			bus.publish(TOPIC_LIQUIDATION, liquidation(f64::from(i))).await;
		}

		assert_eq!(bus.dropped_events(), 12);

		// The queue holds the first events in order; later ones were dropped.
		for i in 0..8 {
			assert_eq!(sub.recv().await.unwrap().value_usd(), Some(f64::from(i)));
		}
		assert!(sub.try_recv().is_none());
	}

	#[tokio::test]
	async fn slow_subscriber_does_not_starve_its_peer() {
		let bus = EventBus::new(64);
		// Subscriber A never drains; B drains as events arrive.
		let mut stuck = bus.subscribe(TOPIC_LARGE_TRADE).await;
		let mut active = bus.subscribe(TOPIC_LARGE_TRADE).await;

		let total = 5000u32;
		let mut received = Vec::new();
		for i in 0..total {
			bus.publish(TOPIC_LARGE_TRADE, liquidation(f64::from(i))).await;
			while let Some(event) = active.try_recv() {
				received.push(event.value_usd().unwrap());
			}
		}
		while let Some(event) = active.try_recv() {
			received.push(event.value_usd().unwrap());
		}

		// The active subscriber saw every event, in publish order.
		assert_eq!(received.len() as u32, total);
		assert!(received.windows(2).all(|w| w[0] < w[1]));

		// The stuck queue never grew past its capacity; the rest was dropped.
		let mut stuck_count = 0u32;
		while stuck.try_recv().is_some() {
			stuck_count += 1;
		}
		assert_eq!(stuck_count, 64);
		assert_eq!(bus.dropped_events(), u64::from(total - 64));
	}

	#[tokio::test]
	async fn unsubscribe_releases_the_queue() {
		let bus = EventBus::new(16);
		let sub = bus.subscribe(TOPIC_OI_SPIKE).await;
		assert_eq!(bus.subscriber_count(TOPIC_OI_SPIKE).await, 1);

		bus.unsubscribe(sub).await;
		assert_eq!(bus.subscriber_count(TOPIC_OI_SPIKE).await, 0);
	}

	#[tokio::test]
	async fn dropped_subscription_is_pruned_on_publish() {
		let bus = EventBus::new(16);
		let sub = bus.subscribe(TOPIC_OI_SPIKE).await;
		drop(sub);

		bus.publish(TOPIC_OI_SPIKE, liquidation(1.0)).await;
		assert_eq!(bus.subscriber_count(TOPIC_OI_SPIKE).await, 0);
	}

	#[tokio::test]
	async fn publishing_to_topic_without_subscribers_is_a_noop() {
		let bus = EventBus::new(16);
		bus.publish("nobody-home", liquidation(1.0)).await;
		assert_eq!(bus.dropped_events(), 0);
	}
}
