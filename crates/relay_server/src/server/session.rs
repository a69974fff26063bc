#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use relay_domain::{ChannelId, SessionId};
use relay_protocol::{ProtocolError, Reply, encode_reply};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

/// One serialized outbound message, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Why a transport refused a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
	Closed,
	Full,
}

/// Outbound side of one subscriber connection.
pub trait SessionTransport: Send + Sync {
	fn is_open(&self) -> bool;

	/// Queue a frame without blocking.
	fn try_send(&self, frame: Frame) -> Result<(), TransportError>;

	/// Ask the connection to close. Idempotent.
	fn close(&self);
}

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("session {session} (user {user_id:?}) is not open")]
	NotOpen {
		session: SessionId,
		user_id: String,
	},

	#[error("session {session} outbound queue full; frame dropped")]
	QueueFull {
		session: SessionId,
	},

	#[error("encode reply: {0}")]
	Encode(#[from] ProtocolError),
}

/// Per-connection state.
pub struct ClientSession {
	id: SessionId,
	user_id: String,
	last_ping_at: Instant,
	joined: BTreeSet<ChannelId>,
	transport: Arc<dyn SessionTransport>,
}

impl ClientSession {
	pub fn new(id: SessionId, transport: Arc<dyn SessionTransport>, now: Instant) -> Self {
		Self {
			id,
			user_id: String::new(),
			last_ping_at: now,
			joined: BTreeSet::new(),
			transport,
		}
	}

	pub fn id(&self) -> SessionId {
		self.id
	}

	/// Empty until LOGIN.
	pub fn user_id(&self) -> &str {
		&self.user_id
	}

	pub fn is_logged_in(&self) -> bool {
		!self.user_id.is_empty()
	}

	/// Overwrites any previous id; returns the old one.
	pub fn set_user_id(&mut self, user_id: String) -> String {
		std::mem::replace(&mut self.user_id, user_id)
	}

	pub fn last_ping_at(&self) -> Instant {
		self.last_ping_at
	}

	pub fn touch(&mut self, now: Instant) {
		self.last_ping_at = now;
	}

	pub fn idle_for(&self, now: Instant) -> Duration {
		now.saturating_duration_since(self.last_ping_at)
	}

	pub fn joined_channels(&self) -> impl Iterator<Item = &ChannelId> {
		self.joined.iter()
	}

	pub fn is_joined(&self, channel: &ChannelId) -> bool {
		self.joined.contains(channel)
	}

	/// Back-reference bookkeeping; only `Channel` and `Gateway` keep it in sync with rosters.
	pub(crate) fn insert_joined(&mut self, channel: ChannelId) -> bool {
		self.joined.insert(channel)
	}

	pub(crate) fn remove_joined(&mut self, channel: &ChannelId) -> bool {
		self.joined.remove(channel)
	}

	pub fn is_open(&self) -> bool {
		self.transport.is_open()
	}

	/// Guarded send: fails instead of queueing when the transport is not open.
	pub fn send_frame(&self, frame: Frame) -> Result<(), SessionError> {
		if !self.transport.is_open() {
			return Err(self.not_open());
		}

		self.transport.try_send(frame).map_err(|e| match e {
			TransportError::Closed => self.not_open(),
			TransportError::Full => SessionError::QueueFull { session: self.id },
		})
	}

	pub fn send_reply(&self, reply: &Reply) -> Result<(), SessionError> {
		let text = encode_reply(reply)?;
		self.send_frame(Frame::from(text))
	}

	pub fn close_transport(&self) {
		self.transport.close();
	}

	fn not_open(&self) -> SessionError {
		SessionError::NotOpen {
			session: self.id,
			user_id: self.user_id.clone(),
		}
	}
}

impl std::fmt::Debug for ClientSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClientSession")
			.field("id", &self.id)
			.field("user_id", &self.user_id)
			.field("joined", &self.joined)
			.field("open", &self.transport.is_open())
			.finish()
	}
}

/// Transport backed by a bounded queue drained by the connection's writer task.
#[derive(Debug)]
pub struct QueuedTransport {
	tx: mpsc::Sender<Frame>,
	closing: AtomicBool,
	close_signal: Arc<Notify>,
}

/// Writer-side half of a [`QueuedTransport`].
#[derive(Debug)]
pub struct TransportOutlet {
	pub frames: mpsc::Receiver<Frame>,
	pub close_signal: Arc<Notify>,
}

/// Create a queued transport and the outlet its writer task drains.
pub fn queued_transport(capacity: usize) -> (Arc<QueuedTransport>, TransportOutlet) {
	let (tx, frames) = mpsc::channel(capacity.max(1));
	let close_signal = Arc::new(Notify::new());
	let transport = Arc::new(QueuedTransport {
		tx,
		closing: AtomicBool::new(false),
		close_signal: Arc::clone(&close_signal),
	});
	(transport, TransportOutlet { frames, close_signal })
}

impl SessionTransport for QueuedTransport {
	fn is_open(&self) -> bool {
		!self.closing.load(Ordering::Acquire) && !self.tx.is_closed()
	}

	fn try_send(&self, frame: Frame) -> Result<(), TransportError> {
		if self.closing.load(Ordering::Acquire) {
			return Err(TransportError::Closed);
		}
		self.tx.try_send(frame).map_err(|e| match e {
			mpsc::error::TrySendError::Full(_) => TransportError::Full,
			mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
		})
	}

	fn close(&self) {
		if !self.closing.swap(true, Ordering::AcqRel) {
			// notify_one stores a permit if the writer is not parked yet.
			self.close_signal.notify_one();
		}
	}
}
