#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

/// Work run on every tick of a recurring timer.
pub type TickTask = Box<dyn FnMut() + Send + 'static>;

/// Arms recurring timers.
pub trait TickScheduler: Send + Sync {
	/// Run `task` every `period`, starting one period from now.
	fn every(&self, period: Duration, task: TickTask) -> TickHandle;
}

/// Cancels its timer when cancelled or dropped.
pub struct TickHandle {
	cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TickHandle {
	pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
		Self {
			cancel: Some(Box::new(cancel)),
		}
	}

	pub fn cancel(mut self) {
		self.fire_cancel();
	}

	fn fire_cancel(&mut self) {
		if let Some(cancel) = self.cancel.take() {
			cancel();
		}
	}
}

impl Drop for TickHandle {
	fn drop(&mut self) {
		self.fire_cancel();
	}
}

impl fmt::Debug for TickHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TickHandle").field("armed", &self.cancel.is_some()).finish()
	}
}

/// Runs tasks on `tokio::time::interval`s spawned onto a runtime handle.
#[derive(Debug, Clone)]
pub struct TokioTickScheduler {
	runtime: Handle,
}

impl TokioTickScheduler {
	pub fn new(runtime: Handle) -> Self {
		Self { runtime }
	}

	/// Scheduler bound to the runtime of the calling task.
	pub fn current() -> Self {
		Self::new(Handle::current())
	}
}

impl TickScheduler for TokioTickScheduler {
	fn every(&self, period: Duration, mut task: TickTask) -> TickHandle {
		let join = self.runtime.spawn(async move {
			let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
			interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

			loop {
				interval.tick().await;
				if std::panic::catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
					warn!("timer task panicked; timer keeps running");
				}
			}
		});

		let abort = join.abort_handle();
		TickHandle::new(move || abort.abort())
	}
}

/// Scheduler whose timers only fire when a test calls [`ManualTickScheduler::fire_all`].
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct ManualTickScheduler {
	inner: Arc<Mutex<ManualTimers>>,
}

#[derive(Default)]
struct ManualTimers {
	next_id: u64,
	timers: BTreeMap<u64, ManualTimer>,
	/// Cancelled while their task was running.
	cancelled_in_flight: HashSet<u64>,
}

struct ManualTimer {
	period: Duration,
	task: TickTask,
}

#[allow(dead_code)]
impl ManualTickScheduler {
	pub fn new() -> Self {
		Self::default()
	}

	/// Fire one tick of every armed timer. Returns how many ran.
	pub fn fire_all(&self) -> usize {
		let ids: Vec<u64> = self.inner.lock().timers.keys().copied().collect();
		let mut fired = 0;

		for id in ids {
			let Some(mut timer) = self.inner.lock().timers.remove(&id) else {
				continue;
			};

			(timer.task)();
			fired += 1;

			let mut inner = self.inner.lock();
			if !inner.cancelled_in_flight.remove(&id) {
				inner.timers.insert(id, timer);
			}
		}

		fired
	}

	pub fn armed(&self) -> usize {
		self.inner.lock().timers.len()
	}

	pub fn periods(&self) -> Vec<Duration> {
		self.inner.lock().timers.values().map(|t| t.period).collect()
	}
}

impl TickScheduler for ManualTickScheduler {
	fn every(&self, period: Duration, task: TickTask) -> TickHandle {
		let id = {
			let mut inner = self.inner.lock();
			let id = inner.next_id;
			inner.next_id += 1;
			inner.timers.insert(id, ManualTimer { period, task });
			id
		};

		let inner = Arc::clone(&self.inner);
		TickHandle::new(move || {
			let mut inner = inner.lock();
			if inner.timers.remove(&id).is_none() {
				inner.cancelled_in_flight.insert(id);
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	fn counter_task(counter: &Arc<AtomicUsize>) -> TickTask {
		let counter = Arc::clone(counter);
		Box::new(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		})
	}

	#[test]
	fn manual_timers_fire_until_cancelled() {
		let scheduler = ManualTickScheduler::new();
		let hits = Arc::new(AtomicUsize::new(0));

		let handle = scheduler.every(Duration::from_secs(5), counter_task(&hits));
		assert_eq!(scheduler.armed(), 1);
		assert_eq!(scheduler.periods(), vec![Duration::from_secs(5)]);

		assert_eq!(scheduler.fire_all(), 1);
		assert_eq!(scheduler.fire_all(), 1);
		assert_eq!(hits.load(Ordering::SeqCst), 2);

		handle.cancel();
		assert_eq!(scheduler.armed(), 0);
		assert_eq!(scheduler.fire_all(), 0);
		assert_eq!(hits.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn dropping_the_handle_cancels() {
		let scheduler = ManualTickScheduler::new();
		let hits = Arc::new(AtomicUsize::new(0));

		{
			let _handle = scheduler.every(Duration::from_secs(1), counter_task(&hits));
		}

		assert_eq!(scheduler.fire_all(), 0);
		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn tokio_timer_ticks_and_stops_on_cancel() {
		let scheduler = TokioTickScheduler::current();
		let hits = Arc::new(AtomicUsize::new(0));

		let handle = scheduler.every(Duration::from_millis(10), counter_task(&hits));
		tokio::time::sleep(Duration::from_millis(100)).await;
		handle.cancel();

		let seen = hits.load(Ordering::SeqCst);
		assert!(seen >= 2, "expected several ticks, got {seen}");

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(hits.load(Ordering::SeqCst), seen);
	}

	#[tokio::test]
	async fn tokio_timer_survives_a_panicking_tick() {
		let scheduler = TokioTickScheduler::current();
		let hits = Arc::new(AtomicUsize::new(0));
		let hits_in_task = Arc::clone(&hits);

		let handle = scheduler.every(
			Duration::from_millis(10),
			Box::new(move || {
				if hits_in_task.fetch_add(1, Ordering::SeqCst) == 0 {
					panic!("first tick fails");
				}
			}),
		);
		tokio::time::sleep(Duration::from_millis(100)).await;
		handle.cancel();

		assert!(hits.load(Ordering::SeqCst) >= 2);
	}
}
