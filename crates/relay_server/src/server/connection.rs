#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use futures::{SinkExt as _, StreamExt as _};
use relay_domain::SessionId;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::gateway::SharedGateway;
use crate::server::session::{TransportOutlet, queued_transport};

/// Default bounded outbound queue per session.
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub session_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			session_queue_capacity: DEFAULT_SESSION_QUEUE_CAPACITY,
		}
	}
}

/// Accept loop. Runs until the listener fails permanently or the task is dropped.
pub async fn serve(listener: TcpListener, gateway: SharedGateway, settings: ConnectionSettings) -> anyhow::Result<()> {
	let local = listener.local_addr().context("listener local_addr")?;
	info!(%local, "websocket gateway listening");

	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				tokio::time::sleep(Duration::from_millis(100)).await;
				continue;
			}
		};

		metrics::counter!("relay_server_connections_accepted_total").increment(1);
		let gateway = SharedGateway::clone(&gateway);
		let settings = settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(stream, peer, gateway, settings).await {
				debug!(%peer, error = %e, "connection ended with error");
			}
		});
	}
}

/// Removes the session from the gateway however the connection task ends.
struct SessionGuard {
	gateway: SharedGateway,
	session_id: SessionId,
}

impl Drop for SessionGuard {
	fn drop(&mut self) {
		self.gateway.lock().remove_session(self.session_id);
		metrics::gauge!("relay_server_active_connections").decrement(1.0);
	}
}

/// Drive one subscriber connection: upgrade, register a session, then run the reader and the
/// queue-draining writer until either side finishes.
pub async fn handle_connection(
	stream: TcpStream,
	peer: SocketAddr,
	gateway: SharedGateway,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let ws = tokio_tungstenite::accept_async(stream)
		.await
		.with_context(|| format!("websocket upgrade failed for {peer}"))?;
	let (mut write, mut read) = ws.split();

	let (transport, outlet) = queued_transport(settings.session_queue_capacity);
	let session_id = gateway.lock().open_session(transport);
	metrics::gauge!("relay_server_active_connections").increment(1.0);
	let _guard = SessionGuard {
		gateway: SharedGateway::clone(&gateway),
		session_id,
	};
	info!(%peer, %session_id, "subscriber connected");

	let TransportOutlet {
		mut frames,
		close_signal,
	} = outlet;

	let writer = async move {
		loop {
			tokio::select! {
				frame = frames.recv() => {
					let Some(frame) = frame else {
						break;
					};
					if let Err(e) = write.send(Message::text(frame.to_string())).await {
						debug!(%session_id, error = %e, "websocket write failed");
						break;
					}
				}
				() = close_signal.notified() => {
					debug!(%session_id, "closing websocket on request");
					let _ = write.send(Message::Close(None)).await;
					break;
				}
			}
		}
	};

	let reader = async {
		while let Some(msg) = read.next().await {
			match msg {
				Ok(Message::Text(text)) => {
					gateway.lock().handle_message(session_id, text.as_str());
				}
				Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
					Ok(text) => gateway.lock().handle_message(session_id, text),
					Err(_) => {
						metrics::counter!("relay_server_protocol_errors_total").increment(1);
						warn!(%session_id, len = bytes.len(), "dropping non-UTF-8 binary message");
					}
				},
				Ok(Message::Close(frame)) => {
					debug!(%session_id, ?frame, "peer closed websocket");
					break;
				}
				Ok(_) => {}
				Err(e) => {
					debug!(%session_id, error = %e, "websocket read failed");
					break;
				}
			}
		}
	};

	tokio::select! {
		() = writer => {}
		() = reader => {}
	}

	info!(%peer, %session_id, "subscriber disconnected");
	Ok(())
}
