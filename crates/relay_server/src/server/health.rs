#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::gateway::SharedGateway;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	gateway: SharedGateway,
}

impl HealthState {
	pub fn new(gateway: SharedGateway) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			gateway,
		}
	}

	/// Channels are seeded; `/readyz` starts answering 200.
	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.is_ready() {
				respond(StatusCode::OK, Bytes::from_static(b"ready"))
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))
			}
		}
		"/statusz" => {
			let snapshot = state.gateway.lock().snapshot();
			match serde_json::to_vec(&snapshot) {
				Ok(body) => {
					let mut resp = respond(StatusCode::OK, Bytes::from(body));
					resp.headers_mut()
						.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
					resp
				}
				Err(e) => {
					warn!(error = %e, "failed to encode status snapshot");
					respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
				}
			}
		}
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt as _;

	use super::*;
	use crate::server::test_support::TestGateway;

	async fn body_of(resp: Response<Full<Bytes>>) -> Bytes {
		resp.into_body().collect().await.unwrap().to_bytes()
	}

	#[tokio::test]
	async fn routes_health_ready_status() {
		let mut t = TestGateway::new();
		t.add_channel("c1");
		let state = HealthState::new(t.gateway.shared());

		let resp = route(&Method::GET, "/healthz", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(body_of(resp).await, Bytes::from_static(b"ok"));

		assert_eq!(
			route(&Method::GET, "/readyz", &state).status(),
			StatusCode::SERVICE_UNAVAILABLE
		);
		state.mark_ready();
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::OK);

		let resp = route(&Method::GET, "/statusz", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
		let json: serde_json::Value = serde_json::from_slice(&body_of(resp).await).unwrap();
		assert_eq!(json["sessions"], 0);
		assert_eq!(json["channels"][0]["id"], "c1");
		assert_eq!(json["channels"][0]["members"], 0);

		assert_eq!(route(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
		assert_eq!(
			route(&Method::POST, "/healthz", &state).status(),
			StatusCode::METHOD_NOT_ALLOWED
		);
	}
}
