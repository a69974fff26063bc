#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_domain::{ChannelId, UpstreamChannelId};
use relay_upstream::{ConnectedState, StreamMeta, UpstreamClient};
use tracing::{debug, info, warn};

use crate::server::timer::{TickHandle, TickScheduler};

/// Default reconnect tick interval.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5_000);

/// Keeps one channel's upstream session alive.
///
/// Every tick re-attempts `connect` only while the client reports `Standby`; the
/// state read and the connect call happen inside the same tick, so there is never
/// more than one attempt in flight. Retries are constant-interval and unbounded.
pub struct UpstreamSupervisor {
	channel: ChannelId,
	target: UpstreamChannelId,
	client: Arc<dyn UpstreamClient>,
	scheduler: Arc<dyn TickScheduler>,
	interval: Duration,
	timer: Option<TickHandle>,
}

impl UpstreamSupervisor {
	pub fn new(
		channel: ChannelId,
		target: UpstreamChannelId,
		client: Arc<dyn UpstreamClient>,
		scheduler: Arc<dyn TickScheduler>,
		interval: Duration,
	) -> Self {
		Self {
			channel,
			target,
			client,
			scheduler,
			interval,
			timer: None,
		}
	}

	/// (Re)arm the reconnect loop. Safe to call repeatedly: any previous timer is cancelled first.
	pub fn start_watching(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.cancel();
		}

		let channel = self.channel.clone();
		let target = self.target.clone();
		let client = Arc::clone(&self.client);

		try_connect(&channel, &target, client.as_ref());

		self.timer = Some(self.scheduler.every(
			self.interval,
			Box::new(move || {
				try_connect(&channel, &target, client.as_ref());
			}),
		));

		info!(
			channel = %self.channel,
			upstream = %self.target,
			interval_ms = self.interval.as_millis() as u64,
			"upstream supervisor watching"
		);
	}

	/// Cancel the reconnect loop and close the upstream session.
	pub fn stop_watching(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.cancel();
		}
		self.client.close();
		info!(channel = %self.channel, "upstream supervisor stopped");
	}

	pub fn is_watching(&self) -> bool {
		self.timer.is_some()
	}

	pub fn state(&self) -> ConnectedState {
		self.client.state()
	}

	pub fn stream_meta(&self) -> Option<StreamMeta> {
		self.client.stream_meta()
	}
}

impl std::fmt::Debug for UpstreamSupervisor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UpstreamSupervisor")
			.field("channel", &self.channel)
			.field("target", &self.target)
			.field("state", &self.client.state())
			.field("watching", &self.is_watching())
			.finish()
	}
}

/// One reconnect tick. Returns whether a connect attempt was issued.
fn try_connect(channel: &ChannelId, target: &UpstreamChannelId, client: &dyn UpstreamClient) -> bool {
	let state = client.state();
	if state != ConnectedState::Standby {
		return false;
	}

	metrics::counter!("relay_server_upstream_connect_attempts_total").increment(1);
	match client.connect(target) {
		Ok(()) => {
			debug!(%channel, upstream = %target, "upstream connect issued");
		}
		Err(e) => {
			metrics::counter!("relay_server_upstream_connect_errors_total").increment(1);
			warn!(%channel, upstream = %target, error = %e, "upstream connect failed; retrying on next tick");
		}
	}
	true
}

#[cfg(test)]
mod tests {
	use relay_upstream::{UpstreamError, event_queue};

	use super::*;
	use crate::server::test_support::{FakeUpstream, channel_id};
	use crate::server::timer::ManualTickScheduler;

	fn supervisor(state_after_connect: ConnectedState) -> (UpstreamSupervisor, Arc<FakeUpstream>, ManualTickScheduler) {
		let (sink, _rx) = event_queue(4);
		let client = FakeUpstream::new(sink.for_channel(channel_id("c1")));
		client.set_state_after_connect(state_after_connect);
		let scheduler = ManualTickScheduler::new();
		let sup = UpstreamSupervisor::new(
			channel_id("c1"),
			UpstreamChannelId::new("up-c1").unwrap(),
			client.clone(),
			Arc::new(scheduler.clone()),
			DEFAULT_RECONNECT_INTERVAL,
		);
		(sup, client, scheduler)
	}

	#[test]
	fn start_connects_immediately_and_arms_one_timer() {
		let (mut sup, client, scheduler) = supervisor(ConnectedState::Connecting);

		sup.start_watching();

		assert_eq!(client.connects(), 1);
		assert_eq!(client.last_target().unwrap().as_str(), "up-c1");
		assert_eq!(scheduler.armed(), 1);
		assert_eq!(scheduler.periods(), vec![DEFAULT_RECONNECT_INTERVAL]);
		assert!(sup.is_watching());
	}

	#[test]
	fn ticks_are_noops_while_connecting_or_connected() {
		let (mut sup, client, scheduler) = supervisor(ConnectedState::Connecting);
		sup.start_watching();

		scheduler.fire_all();
		assert_eq!(client.connects(), 1);

		client.set_state(ConnectedState::Connected);
		scheduler.fire_all();
		assert_eq!(client.connects(), 1);

		client.set_state(ConnectedState::Standby);
		scheduler.fire_all();
		assert_eq!(client.connects(), 2);
	}

	#[test]
	fn start_skips_immediate_connect_when_not_standby() {
		let (mut sup, client, scheduler) = supervisor(ConnectedState::Connecting);
		client.set_state(ConnectedState::Connected);

		sup.start_watching();

		assert_eq!(client.connects(), 0);
		assert_eq!(scheduler.armed(), 1);
	}

	#[test]
	fn restarting_replaces_the_timer() {
		let (mut sup, client, scheduler) = supervisor(ConnectedState::Standby);

		sup.start_watching();
		sup.start_watching();
		assert_eq!(scheduler.armed(), 1);
		assert_eq!(client.connects(), 2);

		scheduler.fire_all();
		assert_eq!(client.connects(), 3);
	}

	#[test]
	fn failed_connects_keep_retrying() {
		let (mut sup, client, scheduler) = supervisor(ConnectedState::Connecting);
		client.fail_connects_with(Some(UpstreamError::Unavailable("offline".to_string())));

		sup.start_watching();
		for _ in 0..3 {
			scheduler.fire_all();
		}

		assert_eq!(client.connects(), 4);
		assert_eq!(client.state(), ConnectedState::Standby);
		assert!(sup.is_watching());
	}

	#[test]
	fn stop_cancels_timer_and_closes_upstream() {
		let (mut sup, client, scheduler) = supervisor(ConnectedState::Connected);
		sup.start_watching();

		sup.stop_watching();
		assert_eq!(scheduler.armed(), 0);
		assert_eq!(client.closes(), 1);
		assert!(!sup.is_watching());

		sup.stop_watching();
		assert_eq!(client.closes(), 2);
		assert_eq!(scheduler.fire_all(), 0);
	}
}
