#![forbid(unsafe_code)]

//! Contract between the gateway and an upstream live-chat session.
//!
//! An upstream client is created per gateway channel through an [`UpstreamFactory`].
//! It owns its connection state and pushes chat and donation events into the
//! [`UpstreamEventTx`] it was created with. The gateway only reads the coarse
//! [`ConnectedState`] and asks it to connect or close.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use relay_domain::{ChannelId, UpstreamChannelId};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Coarse connection state reported by an upstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectedState {
	/// Idle; a connect attempt may be issued.
	#[default]
	Standby,
	Connecting,
	Connected,
}

impl ConnectedState {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectedState::Standby => "standby",
			ConnectedState::Connecting => "connecting",
			ConnectedState::Connected => "connected",
		}
	}
}

impl fmt::Display for ConnectedState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Upstream errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
	#[error("upstream unavailable: {0}")]
	Unavailable(String),

	#[error("upstream event queue full")]
	EventQueueFull,

	#[error("upstream event queue closed")]
	EventQueueClosed,
}

/// Emote image set carried inside a chat event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Emote {
	pub mobile_img: String,
	pub pc_img: String,
}

/// One parsed segment of a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
	Text(String),
	/// Emote token; resolved against [`ChatEvent::emotes`].
	Emote(String),
}

/// A chat message observed on the upstream session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatEvent {
	pub user_id: String,
	pub nickname: String,
	pub color: String,
	pub color_darkmode: String,

	/// Subscription tier value (months); `0` means not subscribed.
	pub subscription: u32,

	pub is_streamer: bool,
	pub is_manager: bool,
	pub is_topfan: bool,
	pub is_fan: bool,

	pub parts: Vec<ContentPart>,
	pub emotes: HashMap<String, Emote>,

	/// Sticker path relative to the sticker CDN, if the message carries one.
	pub sticker: Option<String>,
}

/// A donation observed on the upstream session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DonationEvent {
	pub kind: String,
	pub user_id: String,
	pub nickname: String,
	pub count: u64,
	pub fan_club_order: u64,
	pub image_name: String,
}

/// Subscription badge entry: applies from `months` upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTier {
	pub months: u32,
	pub image: String,
}

/// Read-only stream metadata exposed by a connected upstream client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamMeta {
	/// Tier table ordered by ascending `months`.
	pub subscription_tiers: Vec<SubscriptionTier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
	Chat(Box<ChatEvent>),
	Donation(DonationEvent),
}

/// An upstream event tagged with the gateway channel it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedUpstreamEvent {
	pub channel: ChannelId,
	pub event: UpstreamEvent,
}

/// Receiving half of the shared upstream event queue.
pub type UpstreamEventRx = mpsc::Receiver<TaggedUpstreamEvent>;

/// Untagged sending half; hand out per-channel senders with [`UpstreamEventSink::for_channel`].
#[derive(Debug, Clone)]
pub struct UpstreamEventSink {
	tx: mpsc::Sender<TaggedUpstreamEvent>,
}

impl UpstreamEventSink {
	pub fn for_channel(&self, channel: ChannelId) -> UpstreamEventTx {
		UpstreamEventTx {
			channel,
			tx: self.tx.clone(),
		}
	}
}

/// Create the shared upstream event queue.
pub fn event_queue(capacity: usize) -> (UpstreamEventSink, UpstreamEventRx) {
	let (tx, rx) = mpsc::channel(capacity.max(1));
	(UpstreamEventSink { tx }, rx)
}

/// Per-channel event sender handed to an upstream client.
#[derive(Debug, Clone)]
pub struct UpstreamEventTx {
	channel: ChannelId,
	tx: mpsc::Sender<TaggedUpstreamEvent>,
}

impl UpstreamEventTx {
	pub fn channel(&self) -> &ChannelId {
		&self.channel
	}

	/// Non-blocking emit; a full queue drops the event.
	pub fn emit(&self, event: UpstreamEvent) -> Result<(), UpstreamError> {
		let tagged = TaggedUpstreamEvent {
			channel: self.channel.clone(),
			event,
		};
		self.tx.try_send(tagged).map_err(|e| match e {
			mpsc::error::TrySendError::Full(_) => UpstreamError::EventQueueFull,
			mpsc::error::TrySendError::Closed(_) => UpstreamError::EventQueueClosed,
		})
	}

	pub fn emit_chat(&self, event: ChatEvent) -> Result<(), UpstreamError> {
		self.emit(UpstreamEvent::Chat(Box::new(event)))
	}

	pub fn emit_donation(&self, event: DonationEvent) -> Result<(), UpstreamError> {
		self.emit(UpstreamEvent::Donation(event))
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Capability interface of one upstream session.
///
/// Implementations must be cheap and non-blocking: `connect` starts an attempt and
/// returns, the outcome shows up later through [`UpstreamClient::state`].
pub trait UpstreamClient: Send + Sync {
	/// Start connecting to `channel`. Only called while the state is `Standby`.
	fn connect(&self, channel: &UpstreamChannelId) -> Result<(), UpstreamError>;

	/// Close the session. Must be idempotent.
	fn close(&self);

	fn state(&self) -> ConnectedState;

	/// Stream metadata of the current session, if known.
	fn stream_meta(&self) -> Option<StreamMeta>;
}

/// Creates one upstream client per gateway channel.
pub trait UpstreamFactory: Send + Sync {
	fn create(&self, channel: &ChannelId, events: UpstreamEventTx) -> Arc<dyn UpstreamClient>;
}

/// Generate a new session id for logs.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn channel(id: &str) -> ChannelId {
		ChannelId::new(id).expect("valid ChannelId")
	}

	#[tokio::test]
	async fn events_are_tagged_with_their_channel() {
		let (sink, mut rx) = event_queue(8);
		let a = sink.for_channel(channel("a"));
		let b = sink.for_channel(channel("b"));

		a.emit_chat(ChatEvent {
			user_id: "u1".to_string(),
			..Default::default()
		})
		.unwrap();
		b.emit_donation(DonationEvent {
			count: 10,
			..Default::default()
		})
		.unwrap();

		let first = rx.recv().await.expect("first");
		assert_eq!(first.channel, channel("a"));
		assert!(matches!(first.event, UpstreamEvent::Chat(ref c) if c.user_id == "u1"));

		let second = rx.recv().await.expect("second");
		assert_eq!(second.channel, channel("b"));
		assert!(matches!(second.event, UpstreamEvent::Donation(ref d) if d.count == 10));
	}

	#[test]
	fn full_queue_reports_full_and_dropped_receiver_reports_closed() {
		let (sink, rx) = event_queue(1);
		let tx = sink.for_channel(channel("a"));

		tx.emit_donation(DonationEvent::default()).unwrap();
		assert_eq!(tx.emit_donation(DonationEvent::default()), Err(UpstreamError::EventQueueFull));

		drop(rx);
		assert!(tx.is_closed());
		assert_eq!(
			tx.emit_donation(DonationEvent::default()),
			Err(UpstreamError::EventQueueClosed)
		);
	}

	#[test]
	fn default_state_is_standby() {
		assert_eq!(ConnectedState::default(), ConnectedState::Standby);
		assert_eq!(ConnectedState::Connecting.to_string(), "connecting");
	}
}
