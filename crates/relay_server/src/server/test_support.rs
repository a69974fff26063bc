#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use relay_domain::{ChannelId, UpstreamChannelId};
use relay_protocol::{OutboundEvent, Reply, decode_event, decode_reply};
use relay_upstream::{
	ConnectedState, StreamMeta, UpstreamClient, UpstreamError, UpstreamEventRx, UpstreamEventTx, UpstreamFactory,
	event_queue,
};

use crate::server::gateway::{Gateway, GatewayConfig, GatewayDeps};
use crate::server::session::{Frame, SessionTransport, TransportError};
use crate::server::timer::ManualTickScheduler;
use crate::util::time::ManualClock;

/// Transport that records every frame it accepts.
#[derive(Debug, Default)]
pub struct RecordingTransport {
	frames: Mutex<Vec<String>>,
	closed: AtomicBool,
	close_calls: AtomicUsize,
	refuse_sends: AtomicBool,
}

impl RecordingTransport {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn frames(&self) -> Vec<String> {
		self.frames.lock().clone()
	}

	pub fn take_frames(&self) -> Vec<String> {
		std::mem::take(&mut *self.frames.lock())
	}

	pub fn replies(&self) -> Vec<Reply> {
		self.take_frames()
			.iter()
			.map(|f| decode_reply(f).expect("frame is a reply"))
			.collect()
	}

	pub fn events(&self) -> Vec<OutboundEvent> {
		self.take_frames()
			.iter()
			.map(|f| decode_event(f).expect("frame is an event"))
			.collect()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub fn close_calls(&self) -> usize {
		self.close_calls.load(Ordering::SeqCst)
	}

	/// Accept `is_open` but fail every send with `Full`.
	pub fn refuse_sends(&self) {
		self.refuse_sends.store(true, Ordering::SeqCst);
	}
}

impl SessionTransport for RecordingTransport {
	fn is_open(&self) -> bool {
		!self.closed.load(Ordering::SeqCst)
	}

	fn try_send(&self, frame: Frame) -> Result<(), TransportError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(TransportError::Closed);
		}
		if self.refuse_sends.load(Ordering::SeqCst) {
			return Err(TransportError::Full);
		}
		self.frames.lock().push(frame.to_string());
		Ok(())
	}

	fn close(&self) {
		self.close_calls.fetch_add(1, Ordering::SeqCst);
		self.closed.store(true, Ordering::SeqCst);
	}
}

/// Scriptable upstream client.
#[derive(Debug)]
pub struct FakeUpstream {
	state: Mutex<ConnectedState>,
	state_after_connect: Mutex<ConnectedState>,
	connect_error: Mutex<Option<UpstreamError>>,
	meta: Mutex<Option<StreamMeta>>,
	connects: AtomicUsize,
	closes: AtomicUsize,
	last_target: Mutex<Option<UpstreamChannelId>>,
	events: UpstreamEventTx,
}

impl FakeUpstream {
	pub fn new(events: UpstreamEventTx) -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(ConnectedState::Standby),
			state_after_connect: Mutex::new(ConnectedState::Connecting),
			connect_error: Mutex::new(None),
			meta: Mutex::new(None),
			connects: AtomicUsize::new(0),
			closes: AtomicUsize::new(0),
			last_target: Mutex::new(None),
			events,
		})
	}

	pub fn set_state(&self, state: ConnectedState) {
		*self.state.lock() = state;
	}

	pub fn set_state_after_connect(&self, state: ConnectedState) {
		*self.state_after_connect.lock() = state;
	}

	pub fn fail_connects_with(&self, err: Option<UpstreamError>) {
		*self.connect_error.lock() = err;
	}

	pub fn set_meta(&self, meta: Option<StreamMeta>) {
		*self.meta.lock() = meta;
	}

	pub fn connects(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn closes(&self) -> usize {
		self.closes.load(Ordering::SeqCst)
	}

	pub fn last_target(&self) -> Option<UpstreamChannelId> {
		self.last_target.lock().clone()
	}

	pub fn events(&self) -> &UpstreamEventTx {
		&self.events
	}
}

impl UpstreamClient for FakeUpstream {
	fn connect(&self, channel: &UpstreamChannelId) -> Result<(), UpstreamError> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		*self.last_target.lock() = Some(channel.clone());
		if let Some(err) = self.connect_error.lock().clone() {
			return Err(err);
		}
		*self.state.lock() = *self.state_after_connect.lock();
		Ok(())
	}

	fn close(&self) {
		self.closes.fetch_add(1, Ordering::SeqCst);
		*self.state.lock() = ConnectedState::Standby;
	}

	fn state(&self) -> ConnectedState {
		*self.state.lock()
	}

	fn stream_meta(&self) -> Option<StreamMeta> {
		self.meta.lock().clone()
	}
}

/// Factory that remembers every client it created, keyed by gateway channel.
#[derive(Debug, Default)]
pub struct FakeUpstreamFactory {
	created: Mutex<HashMap<ChannelId, Arc<FakeUpstream>>>,
}

impl FakeUpstreamFactory {
	pub fn client(&self, channel: &str) -> Arc<FakeUpstream> {
		let id = ChannelId::new(channel).expect("valid ChannelId");
		Arc::clone(self.created.lock().get(&id).expect("client created for channel"))
	}
}

impl UpstreamFactory for FakeUpstreamFactory {
	fn create(&self, channel: &ChannelId, events: UpstreamEventTx) -> Arc<dyn UpstreamClient> {
		let client = FakeUpstream::new(events);
		self.created.lock().insert(channel.clone(), Arc::clone(&client));
		client
	}
}

/// A gateway wired to manual time and fake upstreams.
pub struct TestGateway {
	pub gateway: Gateway,
	pub clock: ManualClock,
	pub scheduler: ManualTickScheduler,
	pub upstream: Arc<FakeUpstreamFactory>,
	pub events_rx: UpstreamEventRx,
}

pub const TEST_UNIX_BASE_MS: i64 = 1_700_000_000_000;

impl TestGateway {
	pub fn new() -> Self {
		Self::with_config(GatewayConfig::default())
	}

	pub fn with_config(cfg: GatewayConfig) -> Self {
		init_test_logging();
		let clock = ManualClock::new(TEST_UNIX_BASE_MS);
		let scheduler = ManualTickScheduler::new();
		let upstream = Arc::new(FakeUpstreamFactory::default());
		let (events, events_rx) = event_queue(64);

		let gateway = Gateway::new(
			cfg,
			GatewayDeps {
				clock: Arc::new(clock.clone()),
				scheduler: Arc::new(scheduler.clone()),
				upstream: upstream.clone(),
				events,
			},
		);

		Self {
			gateway,
			clock,
			scheduler,
			upstream,
			events_rx,
		}
	}

	pub fn add_channel(&mut self, id: &str) {
		self.gateway
			.add_channel(
				ChannelId::new(id).expect("valid ChannelId"),
				format!("{id} display"),
				UpstreamChannelId::new(format!("up-{id}")).expect("valid UpstreamChannelId"),
			)
			.expect("add channel");
	}

	pub fn advance(&self, by: Duration) {
		self.clock.advance(by);
	}
}

/// Route tracing output to the test harness when `RELAY_TEST_LOG` is set (value is an env filter).
pub fn init_test_logging() {
	let Ok(filter) = std::env::var("RELAY_TEST_LOG") else {
		return;
	};
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_test_writer()
		.try_init();
}

pub fn channel_id(id: &str) -> ChannelId {
	ChannelId::new(id).expect("valid ChannelId")
}
