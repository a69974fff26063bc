#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_domain::{ChannelId, UpstreamChannelId};
use relay_upstream::{
	ChatEvent, ConnectedState, ContentPart, DonationEvent, Emote, StreamMeta, SubscriptionTier, UpstreamClient,
	UpstreamError, UpstreamEvent, UpstreamEventTx, UpstreamFactory, new_session_id,
};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_DEMO_EMIT_INTERVAL: Duration = Duration::from_millis(1_000);

const DEMO_EMOTE: &str = "/wave/";
const DEMO_EMOTE_MOBILE_IMG: &str = "https://static.example.com/emote/wave_m.png";
const DEMO_EMOTE_PC_IMG: &str = "https://static.example.com/emote/wave.png";
const DONATION_EVERY: u64 = 5;

/// Dev-only upstream that fabricates chat and donation traffic.
#[derive(Debug, Clone)]
pub struct DemoUpstreamFactory {
	runtime: Handle,
	emit_interval: Duration,
}

impl DemoUpstreamFactory {
	pub fn new(runtime: Handle) -> Self {
		Self {
			runtime,
			emit_interval: DEFAULT_DEMO_EMIT_INTERVAL,
		}
	}

	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = interval;
		self
	}
}

impl UpstreamFactory for DemoUpstreamFactory {
	fn create(&self, channel: &ChannelId, events: UpstreamEventTx) -> Arc<dyn UpstreamClient> {
		Arc::new(DemoUpstream {
			channel: channel.clone(),
			events,
			runtime: self.runtime.clone(),
			emit_interval: self.emit_interval,
			inner: Mutex::new(DemoState::default()),
		})
	}
}

#[derive(Debug, Default)]
struct DemoState {
	state: ConnectedState,
	task: Option<AbortHandle>,
}

#[derive(Debug)]
struct DemoUpstream {
	channel: ChannelId,
	events: UpstreamEventTx,
	runtime: Handle,
	emit_interval: Duration,
	inner: Mutex<DemoState>,
}

impl UpstreamClient for DemoUpstream {
	fn connect(&self, target: &UpstreamChannelId) -> Result<(), UpstreamError> {
		let mut inner = self.inner.lock();
		if inner.state != ConnectedState::Standby {
			return Ok(());
		}
		if self.events.is_closed() {
			return Err(UpstreamError::EventQueueClosed);
		}

		let session_id = new_session_id();
		let events = self.events.clone();
		let target = target.clone();
		let emit_interval = self.emit_interval;
		let join = self
			.runtime
			.spawn(async move { emit_loop(events, target, emit_interval).await });

		inner.task = Some(join.abort_handle());
		inner.state = ConnectedState::Connected;
		info!(channel = %self.channel, %session_id, "demo upstream connected");
		Ok(())
	}

	fn close(&self) {
		let mut inner = self.inner.lock();
		if let Some(task) = inner.task.take() {
			task.abort();
			info!(channel = %self.channel, "demo upstream closed");
		}
		inner.state = ConnectedState::Standby;
	}

	fn state(&self) -> ConnectedState {
		self.inner.lock().state
	}

	fn stream_meta(&self) -> Option<StreamMeta> {
		Some(demo_stream_meta())
	}
}

async fn emit_loop(events: UpstreamEventTx, target: UpstreamChannelId, emit_interval: Duration) {
	let mut interval = tokio::time::interval(emit_interval);
	interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
	let mut tick: u64 = 0;

	loop {
		interval.tick().await;
		tick += 1;

		let mut batch = vec![UpstreamEvent::Chat(Box::new(make_chat(tick, &target)))];
		if tick % DONATION_EVERY == 0 {
			batch.push(UpstreamEvent::Donation(make_donation(tick)));
		}

		for event in batch {
			match events.emit(event) {
				Ok(()) => {}
				Err(UpstreamError::EventQueueFull) => {
					warn!(channel = %events.channel(), "demo upstream event queue full; dropping event");
				}
				Err(e) => {
					debug!(channel = %events.channel(), error = %e, "demo upstream stopping");
					return;
				}
			}
		}
	}
}

fn make_chat(tick: u64, target: &UpstreamChannelId) -> ChatEvent {
	let user = tick % 3;
	let mut emotes = HashMap::new();
	emotes.insert(
		DEMO_EMOTE.to_string(),
		Emote {
			mobile_img: DEMO_EMOTE_MOBILE_IMG.to_string(),
			pc_img: DEMO_EMOTE_PC_IMG.to_string(),
		},
	);

	ChatEvent {
		user_id: format!("demo-user-{user}"),
		nickname: format!("DemoUser{user}"),
		color: "#1e90ff".to_string(),
		color_darkmode: "#87cefa".to_string(),
		subscription: [0, 2, 7][user as usize],
		is_streamer: false,
		is_manager: user == 1,
		is_topfan: false,
		is_fan: user == 2,
		parts: vec![
			ContentPart::Text(format!("demo message #{tick} in {target} ")),
			ContentPart::Emote(DEMO_EMOTE.to_string()),
		],
		emotes,
		sticker: (tick % 2 == 0).then(|| format!("demo/{tick}.png")),
	}
}

fn make_donation(tick: u64) -> DonationEvent {
	let round = tick / DONATION_EVERY;
	DonationEvent {
		kind: "balloon".to_string(),
		user_id: "demo-donor".to_string(),
		nickname: "DemoDonor".to_string(),
		count: round * 100,
		fan_club_order: round,
		image_name: "balloon".to_string(),
	}
}

fn demo_stream_meta() -> StreamMeta {
	StreamMeta {
		subscription_tiers: [(1, "tier_1"), (3, "tier_3"), (6, "tier_6")]
			.into_iter()
			.map(|(months, name)| SubscriptionTier {
				months,
				image: format!("https://static.example.com/badge/{name}.png"),
			})
			.collect(),
	}
}

#[cfg(test)]
mod tests {
	use relay_upstream::event_queue;
	use tokio::time::timeout;

	use super::*;

	#[tokio::test]
	async fn emits_chat_and_periodic_donations_until_closed() {
		let (sink, mut rx) = event_queue(64);
		let channel = ChannelId::new("c1").unwrap();
		let client = DemoUpstreamFactory::new(Handle::current())
			.with_emit_interval(Duration::from_millis(5))
			.create(&channel, sink.for_channel(channel.clone()));

		assert_eq!(client.state(), ConnectedState::Standby);
		client.connect(&UpstreamChannelId::new("up-c1").unwrap()).unwrap();
		assert_eq!(client.state(), ConnectedState::Connected);

		let mut chats = 0;
		let mut donations = 0;
		let mut stickers = 0;
		while donations == 0 {
			let tagged = timeout(Duration::from_secs(2), rx.recv())
				.await
				.expect("demo event within timeout")
				.expect("queue open");
			assert_eq!(tagged.channel, channel);
			match tagged.event {
				UpstreamEvent::Chat(chat) => {
					chats += 1;
					assert!(chat.emotes.contains_key(DEMO_EMOTE));
					if chat.sticker.is_some() {
						stickers += 1;
					}
				}
				UpstreamEvent::Donation(d) => {
					donations += 1;
					assert_eq!(d.count, 100);
				}
			}
		}
		assert_eq!(chats, 5);
		assert_eq!(stickers, 2);

		client.close();
		assert_eq!(client.state(), ConnectedState::Standby);
		while rx.try_recv().is_ok() {}
		assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
	}

	#[test]
	fn tier_table_is_sorted_by_months() {
		let meta = demo_stream_meta();
		let months: Vec<u32> = meta.subscription_tiers.iter().map(|t| t.months).collect();
		assert_eq!(months, vec![1, 3, 6]);
	}
}
