#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Time source for liveness bookkeeping and envelope timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
	/// Monotonic now, used for `last_ping_at` comparisons.
	fn now(&self) -> Instant;

	/// Wall-clock Unix milliseconds, stamped on outbound envelopes.
	fn unix_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}

	fn unix_ms(&self) -> i64 {
		unix_ms_now()
	}
}

/// Clock that only moves when told to.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct ManualClock {
	inner: Arc<Mutex<ManualState>>,
}

#[allow(dead_code)]
#[derive(Debug)]
struct ManualState {
	base: Instant,
	unix_base_ms: i64,
	elapsed: Duration,
}

#[allow(dead_code)]
impl ManualClock {
	pub fn new(unix_base_ms: i64) -> Self {
		Self {
			inner: Arc::new(Mutex::new(ManualState {
				base: Instant::now(),
				unix_base_ms,
				elapsed: Duration::ZERO,
			})),
		}
	}

	pub fn advance(&self, by: Duration) {
		let mut st = self.inner.lock();
		st.elapsed = st.elapsed.saturating_add(by);
	}

	pub fn elapsed(&self) -> Duration {
		self.inner.lock().elapsed
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Instant {
		let st = self.inner.lock();
		st.base + st.elapsed
	}

	fn unix_ms(&self) -> i64 {
		let st = self.inner.lock();
		st.unix_base_ms.saturating_add(st.elapsed.as_millis() as i64)
	}
}
