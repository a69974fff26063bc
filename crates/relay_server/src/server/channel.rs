#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use relay_domain::{ChannelId, SessionId, UpstreamChannelId};
use relay_protocol::{OutboundEvent, encode_event};
use relay_upstream::{ConnectedState, StreamMeta};
use tracing::{debug, info, warn};

use crate::server::gateway::GatewayError;
use crate::server::session::{ClientSession, Frame, SessionError};
use crate::server::supervisor::UpstreamSupervisor;

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
	pub delivered: usize,
	pub failed: usize,
}

/// A live broadcast room: one supervised upstream, many subscriber sessions.
///
/// The roster holds session ids only; sessions themselves live in the gateway registry.
#[derive(Debug)]
pub struct Channel {
	id: ChannelId,
	display_name: String,
	upstream_channel_id: UpstreamChannelId,
	roster: BTreeSet<SessionId>,
	supervisor: UpstreamSupervisor,
}

impl Channel {
	pub fn new(
		id: ChannelId,
		display_name: String,
		upstream_channel_id: UpstreamChannelId,
		supervisor: UpstreamSupervisor,
	) -> Self {
		Self {
			id,
			display_name,
			upstream_channel_id,
			roster: BTreeSet::new(),
			supervisor,
		}
	}

	pub fn id(&self) -> &ChannelId {
		&self.id
	}

	pub fn display_name(&self) -> &str {
		&self.display_name
	}

	pub fn upstream_channel_id(&self) -> &UpstreamChannelId {
		&self.upstream_channel_id
	}

	pub fn roster(&self) -> impl Iterator<Item = SessionId> + '_ {
		self.roster.iter().copied()
	}

	pub fn roster_len(&self) -> usize {
		self.roster.len()
	}

	pub fn contains(&self, session: SessionId) -> bool {
		self.roster.contains(&session)
	}

	pub fn upstream_state(&self) -> ConnectedState {
		self.supervisor.state()
	}

	pub fn stream_meta(&self) -> Option<StreamMeta> {
		self.supervisor.stream_meta()
	}

	pub fn start_watching(&mut self) {
		self.supervisor.start_watching();
	}

	pub fn stop_watching(&mut self) {
		self.supervisor.stop_watching();
	}

	/// Add `session` to the roster and the channel to its joined set. Rejected before either side
	/// changes when the pair already exists.
	pub fn join(&mut self, session: &mut ClientSession) -> Result<(), GatewayError> {
		let sid = session.id();
		if self.roster.contains(&sid) || session.is_joined(&self.id) {
			return Err(GatewayError::AlreadyMember {
				session: sid,
				channel: self.id.clone(),
			});
		}

		self.roster.insert(sid);
		session.insert_joined(self.id.clone());
		info!(channel = %self.id, session_id = %sid, user_id = %session.user_id(), members = self.roster.len(), "joined channel");
		Ok(())
	}

	pub fn part(&mut self, session: &mut ClientSession) -> Result<(), GatewayError> {
		let sid = session.id();
		if !self.roster.contains(&sid) {
			return Err(GatewayError::NotMember {
				session: sid,
				channel: self.id.clone(),
			});
		}

		self.roster.remove(&sid);
		session.remove_joined(&self.id);
		info!(channel = %self.id, session_id = %sid, user_id = %session.user_id(), members = self.roster.len(), "parted channel");
		Ok(())
	}

	/// Drop a roster entry whose session is already gone from the registry.
	pub(crate) fn evict(&mut self, session: SessionId) -> bool {
		self.roster.remove(&session)
	}

	/// Serialize once and push the same frame to every member. A failed send is counted and
	/// never stops delivery to the rest of the roster.
	pub fn broadcast(
		&self,
		event: &OutboundEvent,
		sessions: &HashMap<SessionId, ClientSession>,
	) -> Result<BroadcastReport, GatewayError> {
		let frame: Frame = Frame::from(encode_event(event)?);
		let mut report = BroadcastReport::default();

		for sid in &self.roster {
			let Some(session) = sessions.get(sid) else {
				warn!(channel = %self.id, session_id = %sid, "roster member missing from registry");
				report.failed += 1;
				continue;
			};

			match session.send_frame(Frame::clone(&frame)) {
				Ok(()) => report.delivered += 1,
				Err(SessionError::QueueFull { .. }) => {
					report.failed += 1;
					metrics::counter!("relay_server_outbound_dropped_total", "reason" => "queue_full").increment(1);
					debug!(channel = %self.id, session_id = %sid, "outbound queue full; frame dropped");
				}
				Err(e) => {
					report.failed += 1;
					metrics::counter!("relay_server_outbound_dropped_total", "reason" => "closed").increment(1);
					debug!(channel = %self.id, session_id = %sid, error = %e, "broadcast send failed");
				}
			}
		}

		metrics::counter!("relay_server_broadcasts_total", "type" => event.message_type().as_str()).increment(1);
		Ok(report)
	}
}
