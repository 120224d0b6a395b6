use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Buffer between a feed task and its consumer. Sized for bursts; sustained
/// slowness propagates to the upstream read, which is acceptable for a
/// single-consumer pass-through (the bus applies its own drop policy).
pub const FEED_CHANNEL_CAPACITY: usize = 256;

/// Handle to a spawned upstream feed task.
///
/// The task owns the websocket and pushes normalized records into a bounded
/// channel. Dropping (or `close`-ing) the handle cancels the task, which is
/// the cooperative `close()` of the feed contract; the task also stops on its
/// own when it observes the channel closed.
#[derive(Debug)]
pub struct FeedHandle<T> {
	rx: mpsc::Receiver<T>,
	task: JoinHandle<()>,
}

impl<T> FeedHandle<T> {
	#[must_use]
	pub const fn new(rx: mpsc::Receiver<T>, task: JoinHandle<()>) -> Self {
		Self { rx, task }
	}

	/// Next record from the feed; `None` once the feed task has stopped and
	/// the channel has drained.
	pub async fn recv(&mut self) -> Option<T> {
		self.rx.recv().await
	}

	/// Terminates the feed and prevents further records from arriving.
	pub fn close(&mut self) {
		self.task.abort();
		self.rx.close();
	}
}

impl<T> Drop for FeedHandle<T> {
	fn drop(&mut self) {
		self.task.abort();
	}
}

/// Spawns a feed task and returns the connected handle.
pub fn spawn_feed<T, F>(task: impl FnOnce(mpsc::Sender<T>) -> F) -> FeedHandle<T>
where
	T: Send + 'static,
	F: std::future::Future<Output = ()> + Send + 'static,
{
	let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
	let handle = tokio::spawn(task(tx));
	FeedHandle::new(rx, handle)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn recv_returns_none_after_task_finishes() {
		let mut feed = spawn_feed(|tx| async move {
			tx.send(1u32).await.ok();
			tx.send(2u32).await.ok();
		});

		assert_eq!(feed.recv().await, Some(1));
		assert_eq!(feed.recv().await, Some(2));
		assert_eq!(feed.recv().await, None);
	}

	#[tokio::test]
	async fn close_cancels_the_task() {
		let mut feed = spawn_feed(|tx: mpsc::Sender<u32>| async move {
			loop {
				tokio::time::sleep(Duration::from_secs(60)).await;
				if tx.send(0).await.is_err() {
					break;
				}
			}
		});

		feed.close();
		assert_eq!(feed.recv().await, None);
	}

	#[tokio::test]
	async fn task_observes_dropped_receiver() {
		let (probe_tx, mut probe_rx) = mpsc::channel(1);
		let feed = spawn_feed(|tx: mpsc::Sender<u32>| async move {
			tx.closed().await;
			probe_tx.send(()).await.ok();
		});

		drop(feed);
		// Aborted or cooperatively stopped, either way the task must end; the
		// probe firing means it saw the closed channel before the abort landed.
		let _ = tokio::time::timeout(Duration::from_secs(1), probe_rx.recv()).await;
	}
}
