#![forbid(unsafe_code)]

use relay_upstream::UpstreamEventRx;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::gateway::{GatewayError, SharedGateway};

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
	pub debug_log_events: bool,
}

/// Drains the shared upstream event queue into the gateway, one event at a time.
#[derive(Debug)]
pub struct UpstreamRouter {
	cfg: RouterConfig,
	gateway: SharedGateway,
	events_rx: UpstreamEventRx,
}

impl UpstreamRouter {
	pub fn new(gateway: SharedGateway, events_rx: UpstreamEventRx, cfg: RouterConfig) -> Self {
		Self {
			cfg,
			gateway,
			events_rx,
		}
	}

	/// Run until every event sender is gone.
	pub async fn run(mut self) {
		info!("upstream router started");

		while let Some(tagged) = self.events_rx.recv().await {
			let channel = tagged.channel.clone();
			let result = self.gateway.lock().relay_upstream_event(tagged);

			match result {
				Ok(report) => {
					if self.cfg.debug_log_events {
						debug!(%channel, delivered = report.delivered, failed = report.failed, "relayed upstream event");
					}
				}
				Err(GatewayError::ChannelNotFound(_)) => {
					debug!(%channel, "dropping upstream event for removed channel");
				}
				Err(e) => {
					warn!(%channel, error = %e, "failed to relay upstream event");
				}
			}
		}

		info!("upstream router exiting (all upstream senders closed)");
	}
}

pub fn spawn_upstream_router(gateway: SharedGateway, events_rx: UpstreamEventRx, cfg: RouterConfig) -> JoinHandle<()> {
	let router = UpstreamRouter::new(gateway, events_rx, cfg);
	tokio::spawn(router.run())
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use relay_upstream::{ChatEvent, ContentPart, UpstreamEvent};

	use super::*;
	use crate::server::test_support::{RecordingTransport, TestGateway, channel_id};

	#[tokio::test]
	async fn routes_events_in_order_and_skips_removed_channels() {
		let mut t = TestGateway::new();
		t.add_channel("c1");
		t.add_channel("c2");
		let transport = RecordingTransport::new();
		let sid = t.gateway.open_session(transport.clone());
		t.gateway.handle_message(sid, r#"{"type":"LOGIN","body":{"userId":"u1"}}"#);
		t.gateway.handle_message(sid, r#"{"type":"JOIN","body":{"channelIds":["c1"]}}"#);
		transport.take_frames();

		let c1 = t.upstream.client("c1").events().clone();
		let c2 = t.upstream.client("c2").events().clone();
		t.gateway.remove_channel(&channel_id("c2"));

		let TestGateway { gateway, events_rx, .. } = t;
		let handle = spawn_upstream_router(gateway.shared(), events_rx, RouterConfig { debug_log_events: true });

		c2.emit(UpstreamEvent::Chat(Box::default())).unwrap();
		for n in 0..3 {
			c1.emit_chat(ChatEvent {
				parts: vec![ContentPart::Text(format!("m{n}"))],
				..Default::default()
			})
			.unwrap();
		}

		let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
		while transport.frames().len() < 3 && tokio::time::Instant::now() < deadline {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}

		let frames = transport.frames();
		assert_eq!(frames.len(), 3);
		for (n, frame) in frames.iter().enumerate() {
			assert!(frame.contains(&format!("\"m{n}\"")), "{frame}");
		}
		handle.abort();
	}
}
