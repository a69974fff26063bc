#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_domain::{ChannelId, SessionId, UpstreamChannelId};
use relay_protocol::{ChannelRef, DEFAULT_MAX_MESSAGE_SIZE, MessageType, ProtocolError, Reply, Request, decode_request};
use relay_upstream::{TaggedUpstreamEvent, UpstreamEvent, UpstreamEventSink, UpstreamFactory};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::server::channel::{BroadcastReport, Channel};
use crate::server::session::{ClientSession, SessionError, SessionTransport};
use crate::server::supervisor::{DEFAULT_RECONNECT_INTERVAL, UpstreamSupervisor};
use crate::server::timer::TickScheduler;
use crate::server::translate::{translate_chat, translate_donation};
use crate::util::time::Clock;

/// Default liveness timeout: sessions idle longer than this are closed by the sweep.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Gateway handles are shared by connection tasks, the router and the sweep; every mutation
/// goes through this one lock.
pub type SharedGateway = Arc<parking_lot::Mutex<Gateway>>;

#[derive(Debug, Error)]
pub enum GatewayError {
	#[error("protocol error: {0}")]
	Protocol(#[from] ProtocolError),

	#[error("session {session} sent {kind} before LOGIN")]
	NotLoggedIn {
		session: SessionId,
		kind: MessageType,
	},

	#[error("channel {0} not found")]
	ChannelNotFound(String),

	#[error("session {0} not found")]
	SessionNotFound(SessionId),

	#[error("channel {0} already exists")]
	DuplicateChannel(ChannelId),

	#[error("session {session} already joined {channel}")]
	AlreadyMember {
		session: SessionId,
		channel: ChannelId,
	},

	#[error("session {session} is not a member of {channel}")]
	NotMember {
		session: SessionId,
		channel: ChannelId,
	},

	#[error(transparent)]
	Session(#[from] SessionError),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
	pub reconnect_interval: Duration,
	pub liveness_timeout: Duration,
	pub max_message_bytes: usize,
	/// Send `{type, success:false}` for privileged commands before LOGIN instead of staying silent.
	pub reply_on_not_logged_in: bool,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
			liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
			max_message_bytes: DEFAULT_MAX_MESSAGE_SIZE,
			reply_on_not_logged_in: false,
		}
	}
}

/// Collaborators injected at construction.
pub struct GatewayDeps {
	pub clock: Arc<dyn Clock>,
	pub scheduler: Arc<dyn TickScheduler>,
	pub upstream: Arc<dyn UpstreamFactory>,
	pub events: UpstreamEventSink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
	pub id: String,
	pub name: String,
	pub upstream_channel_id: String,
	pub state: &'static str,
	pub members: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewaySnapshot {
	pub sessions: usize,
	pub channels: Vec<ChannelSnapshot>,
}

/// Registry of channels and subscriber sessions plus the inbound dispatcher.
pub struct Gateway {
	config: GatewayConfig,
	deps: GatewayDeps,
	channels: HashMap<ChannelId, Channel>,
	/// Insertion order for CHLIST replies.
	channel_order: Vec<ChannelId>,
	sessions: HashMap<SessionId, ClientSession>,
	next_session_id: u64,
}

impl Gateway {
	pub fn new(config: GatewayConfig, deps: GatewayDeps) -> Self {
		Self {
			config,
			deps,
			channels: HashMap::new(),
			channel_order: Vec::new(),
			sessions: HashMap::new(),
			next_session_id: 1,
		}
	}

	pub fn shared(self) -> SharedGateway {
		Arc::new(parking_lot::Mutex::new(self))
	}

	pub fn config(&self) -> &GatewayConfig {
		&self.config
	}

	// -- channels ---------------------------------------------------------

	/// Register a channel and start its upstream supervisor immediately.
	pub fn add_channel(
		&mut self,
		id: ChannelId,
		display_name: String,
		upstream_channel_id: UpstreamChannelId,
	) -> Result<(), GatewayError> {
		if self.channels.contains_key(&id) {
			return Err(GatewayError::DuplicateChannel(id));
		}

		let client = self.deps.upstream.create(&id, self.deps.events.for_channel(id.clone()));
		let supervisor = UpstreamSupervisor::new(
			id.clone(),
			upstream_channel_id.clone(),
			client,
			Arc::clone(&self.deps.scheduler),
			self.config.reconnect_interval,
		);

		let mut channel = Channel::new(id.clone(), display_name, upstream_channel_id, supervisor);
		channel.start_watching();

		info!(channel = %id, name = %channel.display_name(), upstream = %channel.upstream_channel_id(), "channel added");
		self.channels.insert(id.clone(), channel);
		self.channel_order.push(id);
		metrics::gauge!("relay_server_channels").set(self.channels.len() as f64);
		Ok(())
	}

	/// Stop the channel's supervisor and drop it from the registry and from every member's
	/// joined set. Returns false when the id is unknown.
	pub fn remove_channel(&mut self, id: &ChannelId) -> bool {
		let Some(mut channel) = self.channels.remove(id) else {
			return false;
		};
		self.channel_order.retain(|c| c != id);

		channel.stop_watching();
		for sid in channel.roster() {
			if let Some(session) = self.sessions.get_mut(&sid) {
				session.remove_joined(id);
			}
		}

		info!(channel = %id, members = channel.roster_len(), "channel removed");
		metrics::gauge!("relay_server_channels").set(self.channels.len() as f64);
		true
	}

	pub fn channel(&self, id: &ChannelId) -> Option<&Channel> {
		self.channels.get(id)
	}

	/// Channel ids in the order they were added.
	pub fn channel_ids(&self) -> Vec<String> {
		self.channel_order.iter().map(|id| id.as_str().to_string()).collect()
	}

	pub fn channel_count(&self) -> usize {
		self.channels.len()
	}

	// -- sessions ---------------------------------------------------------

	pub fn open_session(&mut self, transport: Arc<dyn SessionTransport>) -> SessionId {
		let id = SessionId::new(self.next_session_id);
		self.next_session_id += 1;

		self.sessions.insert(id, ClientSession::new(id, transport, self.deps.clock.now()));
		metrics::counter!("relay_server_sessions_opened_total").increment(1);
		metrics::gauge!("relay_server_sessions_active").set(self.sessions.len() as f64);
		info!(session_id = %id, sessions = self.sessions.len(), "session opened");
		id
	}

	/// Teardown path for every close, client- or sweep-initiated. Evicts the session from each
	/// joined roster, then from the registry. Idempotent.
	pub fn remove_session(&mut self, id: SessionId) -> bool {
		let Some(session) = self.sessions.remove(&id) else {
			return false;
		};

		for channel_id in session.joined_channels() {
			if let Some(channel) = self.channels.get_mut(channel_id) {
				channel.evict(id);
			}
		}

		metrics::gauge!("relay_server_sessions_active").set(self.sessions.len() as f64);
		info!(session_id = %id, user_id = %session.user_id(), sessions = self.sessions.len(), "session removed");
		true
	}

	pub fn session(&self, id: SessionId) -> Option<&ClientSession> {
		self.sessions.get(&id)
	}

	pub fn session_count(&self) -> usize {
		self.sessions.len()
	}

	// -- inbound ----------------------------------------------------------

	/// Decode and dispatch one inbound message. Errors are logged and never propagated, so one
	/// bad message never tears the connection down.
	pub fn handle_message(&mut self, session: SessionId, text: &str) {
		metrics::counter!("relay_server_inbound_messages_total").increment(1);

		let request = match decode_request(text, self.config.max_message_bytes) {
			Ok(req) => req,
			Err(e) => {
				metrics::counter!("relay_server_protocol_errors_total").increment(1);
				warn!(session_id = %session, error = %e, "dropping malformed message");
				return;
			}
		};

		let kind = request.message_type();
		match self.dispatch(session, request) {
			Ok(()) => {}
			Err(GatewayError::NotLoggedIn { session, kind }) => {
				metrics::counter!("relay_server_not_logged_in_total").increment(1);
				warn!(session_id = %session, kind = %kind.as_str(), "command requires LOGIN");
				if self.config.reply_on_not_logged_in
					&& let Some(s) = self.sessions.get(&session)
					&& let Err(e) = s.send_reply(&Reply::failure(kind))
				{
					debug!(session_id = %session, error = %e, "failed to send rejection");
				}
			}
			Err(e) => {
				warn!(session_id = %session, kind = %kind.as_str(), error = %e, "request failed");
			}
		}
	}

	pub fn dispatch(&mut self, session: SessionId, request: Request) -> Result<(), GatewayError> {
		match request {
			Request::Ping => self.handle_ping(session),
			Request::Login { user_id } => self.handle_login(session, user_id),
			Request::Join { channel_ids } => self.handle_join(session, &channel_ids),
			Request::Part { channel_ids } => self.handle_part(session, &channel_ids),
			Request::ChannelList => self.handle_channel_list(session),
		}
	}

	fn handle_ping(&mut self, id: SessionId) -> Result<(), GatewayError> {
		let now = self.deps.clock.now();
		let session = self.sessions.get_mut(&id).ok_or(GatewayError::SessionNotFound(id))?;
		session.touch(now);
		session.send_reply(&Reply::ping())?;
		Ok(())
	}

	fn handle_login(&mut self, id: SessionId, user_id: String) -> Result<(), GatewayError> {
		let session = self.sessions.get_mut(&id).ok_or(GatewayError::SessionNotFound(id))?;
		let previous = session.set_user_id(user_id);
		if previous.is_empty() {
			info!(session_id = %id, user_id = %session.user_id(), "login");
		} else {
			info!(session_id = %id, user_id = %session.user_id(), %previous, "re-login replaced user id");
		}
		session.send_reply(&Reply::login(session.user_id()))?;
		Ok(())
	}

	fn handle_join(&mut self, id: SessionId, channel_ids: &[ChannelRef]) -> Result<(), GatewayError> {
		let session = logged_in(&mut self.sessions, id, MessageType::Join)?;

		let mut accepted = Vec::with_capacity(channel_ids.len());
		for entry in channel_ids {
			let raw = match entry {
				ChannelRef::Id(raw) => raw,
				ChannelRef::NotAString(value) => {
					debug!(session_id = %id, %value, "join skipped: channel id is not a string");
					continue;
				}
			};
			let Some(channel) = lookup_mut(&mut self.channels, raw) else {
				debug!(session_id = %id, channel = %raw, "join skipped: channel not found");
				continue;
			};
			match channel.join(session) {
				Ok(()) => accepted.push(raw.clone()),
				Err(e) => debug!(session_id = %id, error = %e, "join skipped"),
			}
		}

		session.send_reply(&Reply::channels(MessageType::Join, session.user_id(), accepted))?;
		Ok(())
	}

	fn handle_part(&mut self, id: SessionId, channel_ids: &[ChannelRef]) -> Result<(), GatewayError> {
		let session = logged_in(&mut self.sessions, id, MessageType::Part)?;

		let mut accepted = Vec::with_capacity(channel_ids.len());
		for entry in channel_ids {
			let raw = match entry {
				ChannelRef::Id(raw) => raw,
				ChannelRef::NotAString(value) => {
					debug!(session_id = %id, %value, "part skipped: channel id is not a string");
					continue;
				}
			};
			let Some(channel) = lookup_mut(&mut self.channels, raw) else {
				debug!(session_id = %id, channel = %raw, "part skipped: channel not found");
				continue;
			};
			match channel.part(session) {
				Ok(()) => accepted.push(raw.clone()),
				Err(e) => debug!(session_id = %id, error = %e, "part skipped"),
			}
		}

		session.send_reply(&Reply::channels(MessageType::Part, session.user_id(), accepted))?;
		Ok(())
	}

	fn handle_channel_list(&mut self, id: SessionId) -> Result<(), GatewayError> {
		let ids = self.channel_ids();
		let session = logged_in(&mut self.sessions, id, MessageType::Chlist)?;
		session.send_reply(&Reply::channels(MessageType::Chlist, session.user_id(), ids))?;
		Ok(())
	}

	// -- upstream ---------------------------------------------------------

	/// Translate one upstream event and broadcast it to the channel's roster.
	pub fn relay_upstream_event(&mut self, tagged: TaggedUpstreamEvent) -> Result<BroadcastReport, GatewayError> {
		let channel = self
			.channels
			.get(&tagged.channel)
			.ok_or_else(|| GatewayError::ChannelNotFound(tagged.channel.to_string()))?;

		let timestamp = self.deps.clock.unix_ms();
		let event = match &tagged.event {
			UpstreamEvent::Chat(chat) => {
				let meta = channel.stream_meta();
				translate_chat(channel.id(), chat, meta.as_ref(), timestamp)
			}
			UpstreamEvent::Donation(donation) => translate_donation(channel.id(), donation, timestamp),
		};

		let report = channel.broadcast(&event, &self.sessions)?;
		if report.failed > 0 {
			metrics::counter!("relay_server_broadcast_send_failures_total").increment(report.failed as u64);
		}
		Ok(report)
	}

	// -- liveness ---------------------------------------------------------

	/// Close every open session idle for longer than the liveness timeout. The connection task
	/// observes the close and runs [`Gateway::remove_session`].
	pub fn sweep_liveness(&mut self) -> Vec<SessionId> {
		let now = self.deps.clock.now();
		let timeout = self.config.liveness_timeout;

		let mut closed = Vec::new();
		for session in self.sessions.values() {
			if !session.is_open() {
				continue;
			}
			let idle = session.idle_for(now);
			if idle > timeout {
				info!(
					session_id = %session.id(),
					user_id = %session.user_id(),
					idle_ms = idle.as_millis() as u64,
					"liveness timeout; closing session"
				);
				session.close_transport();
				closed.push(session.id());
			}
		}

		if !closed.is_empty() {
			metrics::counter!("relay_server_liveness_closes_total").increment(closed.len() as u64);
		}
		debug!(sessions = self.sessions.len(), closed = closed.len(), "liveness sweep");
		closed
	}

	// -- status -----------------------------------------------------------

	pub fn snapshot(&self) -> GatewaySnapshot {
		GatewaySnapshot {
			sessions: self.sessions.len(),
			channels: self
				.channel_order
				.iter()
				.filter_map(|id| self.channels.get(id))
				.map(|c| ChannelSnapshot {
					id: c.id().to_string(),
					name: c.display_name().to_string(),
					upstream_channel_id: c.upstream_channel_id().to_string(),
					state: c.upstream_state().as_str(),
					members: c.roster_len(),
				})
				.collect(),
		}
	}

	/// Stop every supervisor and close every session transport.
	pub fn shutdown(&mut self) {
		for channel in self.channels.values_mut() {
			channel.stop_watching();
		}
		for session in self.sessions.values() {
			session.close_transport();
		}
		info!(channels = self.channels.len(), sessions = self.sessions.len(), "gateway shut down");
	}
}

impl std::fmt::Debug for Gateway {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Gateway")
			.field("config", &self.config)
			.field("channels", &self.channel_order)
			.field("sessions", &self.sessions.len())
			.finish()
	}
}

fn logged_in(
	sessions: &mut HashMap<SessionId, ClientSession>,
	id: SessionId,
	kind: MessageType,
) -> Result<&mut ClientSession, GatewayError> {
	let session = sessions.get_mut(&id).ok_or(GatewayError::SessionNotFound(id))?;
	if !session.is_logged_in() {
		return Err(GatewayError::NotLoggedIn { session: id, kind });
	}
	Ok(session)
}

fn lookup_mut<'a>(channels: &'a mut HashMap<ChannelId, Channel>, raw: &str) -> Option<&'a mut Channel> {
	let id = ChannelId::new(raw).ok()?;
	channels.get_mut(&id)
}
