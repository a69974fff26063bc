#![forbid(unsafe_code)]

mod adapters;
mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use relay_upstream::{UpstreamFactory, event_queue};
use relay_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::adapters::{DemoUpstreamFactory, NullUpstreamFactory};
use crate::config::{ServerConfig, UpstreamAdapterKind};
use crate::server::connection::{ConnectionSettings, serve};
use crate::server::directory::{fetch_directory, seed_channels};
use crate::server::gateway::{Gateway, GatewayConfig, GatewayDeps};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::liveness::spawn_liveness_sweep;
use crate::server::router::{RouterConfig, spawn_upstream_router};
use crate::server::timer::TokioTickScheduler;
use crate::util::time::SystemClock;

const DEFAULT_BIND: &str = "ws://127.0.0.1:3000";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_server [--bind ws://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: {DEFAULT_BIND})\n\
\t         Format: ws://host:port\n\
\t--config  Config file (default: ~/.relay/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: WsEndpoint,
	config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = DEFAULT_BIND.to_string();
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { bind, config_path }
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("relay_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn upstream_factory(cfg: &ServerConfig) -> Arc<dyn UpstreamFactory> {
	match cfg.upstream.adapter {
		UpstreamAdapterKind::Demo if cfg!(debug_assertions) => {
			info!(
				interval_ms = cfg.upstream.demo_emit_interval.as_millis() as u64,
				"starting dev-only demo upstream"
			);
			Arc::new(
				DemoUpstreamFactory::new(tokio::runtime::Handle::current())
					.with_emit_interval(cfg.upstream.demo_emit_interval),
			)
		}
		UpstreamAdapterKind::Demo => {
			warn!("demo upstream is only available in debug builds; using null upstream");
			Arc::new(NullUpstreamFactory)
		}
		UpstreamAdapterKind::Null => Arc::new(NullUpstreamFactory),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let (events, events_rx) = event_queue(server_cfg.gateway.upstream_event_capacity);
	let scheduler = Arc::new(TokioTickScheduler::current());
	let gateway = Gateway::new(
		GatewayConfig {
			reconnect_interval: server_cfg.gateway.reconnect_interval,
			liveness_timeout: server_cfg.gateway.liveness_timeout,
			max_message_bytes: server_cfg.server.max_message_bytes,
			reply_on_not_logged_in: server_cfg.gateway.reply_on_not_logged_in,
		},
		GatewayDeps {
			clock: Arc::new(SystemClock),
			scheduler: scheduler.clone(),
			upstream: upstream_factory(&server_cfg),
			events,
		},
	)
	.shared();

	let health_state = HealthState::new(Arc::clone(&gateway));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let router = spawn_upstream_router(Arc::clone(&gateway), events_rx, RouterConfig::default());

	let added = seed_channels(&mut gateway.lock(), server_cfg.channels.clone());
	info!(channels = added, "static channels added");

	if let Some(url) = server_cfg.directory.url.as_deref() {
		match fetch_directory(url, &server_cfg.directory.platform).await {
			Ok(entries) => {
				let added = seed_channels(&mut gateway.lock(), entries);
				info!(channels = added, "directory channels added");
			}
			Err(e) => warn!(error = %e, "channel directory unavailable; continuing with static channels"),
		}
	}
	health_state.mark_ready();

	let _sweep = spawn_liveness_sweep(
		Arc::clone(&gateway),
		scheduler.as_ref(),
		server_cfg.gateway.liveness_interval,
	);

	let listener = TcpListener::bind(args.bind.hostport())
		.await
		.with_context(|| format!("bind {}", args.bind.hostport()))?;

	let settings = ConnectionSettings {
		session_queue_capacity: server_cfg.server.session_queue_capacity,
	};

	{
		let gw = gateway.lock();
		let cfg = gw.config();
		info!(
			bind = %args.bind.hostport(),
			channels = gw.channel_count(),
			liveness_timeout_ms = cfg.liveness_timeout.as_millis() as u64,
			reconnect_interval_ms = cfg.reconnect_interval.as_millis() as u64,
			"gateway listening"
		);
	}

	tokio::select! {
		res = serve(listener, Arc::clone(&gateway), settings) => {
			res?;
		}
		res = tokio::signal::ctrl_c() => {
			res.context("listen for ctrl-c")?;
			info!("shutdown requested");
		}
	}

	gateway.lock().shutdown();
	router.abort();
	Ok(())
}
