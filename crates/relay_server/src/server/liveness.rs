#![forbid(unsafe_code)]

use std::time::Duration;

use tracing::debug;

use crate::server::gateway::SharedGateway;
use crate::server::timer::{TickHandle, TickScheduler};

pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(10_000);

/// Run [`Gateway::sweep_liveness`](crate::server::gateway::Gateway::sweep_liveness) on every tick.
pub fn spawn_liveness_sweep(gateway: SharedGateway, scheduler: &dyn TickScheduler, interval: Duration) -> TickHandle {
	debug!(interval_ms = interval.as_millis() as u64, "liveness sweep armed");
	scheduler.every(
		interval,
		Box::new(move || {
			gateway.lock().sweep_liveness();
		}),
	)
}
