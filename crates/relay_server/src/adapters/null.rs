#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_domain::{ChannelId, UpstreamChannelId};
use relay_upstream::{
	ConnectedState, StreamMeta, UpstreamClient, UpstreamError, UpstreamEventTx, UpstreamFactory, new_session_id,
};
use tracing::{debug, info};

/// Upstream used when no real chat protocol is linked in. Never leaves `Standby`.
#[derive(Debug, Default)]
pub struct NullUpstreamFactory;

impl UpstreamFactory for NullUpstreamFactory {
	fn create(&self, channel: &ChannelId, _events: UpstreamEventTx) -> Arc<dyn UpstreamClient> {
		let session_id = new_session_id();
		info!(%channel, %session_id, "null upstream created");
		Arc::new(NullUpstream {
			channel: channel.clone(),
		})
	}
}

#[derive(Debug)]
struct NullUpstream {
	channel: ChannelId,
}

impl UpstreamClient for NullUpstream {
	fn connect(&self, target: &UpstreamChannelId) -> Result<(), UpstreamError> {
		debug!(channel = %self.channel, upstream = %target, "null upstream ignoring connect");
		Ok(())
	}

	fn close(&self) {}

	fn state(&self) -> ConnectedState {
		ConnectedState::Standby
	}

	fn stream_meta(&self) -> Option<StreamMeta> {
		None
	}
}
