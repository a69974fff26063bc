#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relay_domain::{ChannelId, UpstreamChannelId};
use relay_protocol::DEFAULT_MAX_MESSAGE_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::adapters::DEFAULT_DEMO_EMIT_INTERVAL;
use crate::server::connection::DEFAULT_SESSION_QUEUE_CAPACITY;
use crate::server::gateway::DEFAULT_LIVENESS_TIMEOUT;
use crate::server::liveness::DEFAULT_LIVENESS_INTERVAL;
use crate::server::supervisor::DEFAULT_RECONNECT_INTERVAL;

pub const DEFAULT_UPSTREAM_EVENT_CAPACITY: usize = 4096;
pub const DEFAULT_DIRECTORY_PLATFORM: &str = "afreeca";

/// Default config path: `~/.relay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relay").join("config.toml"))
}

/// Load TOML from `path` (missing file means defaults), then apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub gateway: GatewaySettings,
	pub directory: DirectorySettings,
	pub upstream: UpstreamSettings,
	pub channels: Vec<StaticChannel>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub max_message_bytes: usize,
	pub session_queue_capacity: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			max_message_bytes: DEFAULT_MAX_MESSAGE_SIZE,
			session_queue_capacity: DEFAULT_SESSION_QUEUE_CAPACITY,
		}
	}
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
	pub reconnect_interval: Duration,
	pub liveness_interval: Duration,
	pub liveness_timeout: Duration,
	pub upstream_event_capacity: usize,
	/// Reply `{type, success:false}` to privileged commands sent before LOGIN.
	pub reply_on_not_logged_in: bool,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		Self {
			reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
			liveness_interval: DEFAULT_LIVENESS_INTERVAL,
			liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
			upstream_event_capacity: DEFAULT_UPSTREAM_EVENT_CAPACITY,
			reply_on_not_logged_in: false,
		}
	}
}

/// Member-list API used to seed channels at startup.
#[derive(Debug, Clone)]
pub struct DirectorySettings {
	pub url: Option<String>,
	pub platform: String,
}

impl Default for DirectorySettings {
	fn default() -> Self {
		Self {
			url: None,
			platform: DEFAULT_DIRECTORY_PLATFORM.to_string(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamAdapterKind {
	#[default]
	Null,
	Demo,
}

impl UpstreamAdapterKind {
	fn parse(v: &str) -> Option<Self> {
		match v.trim().to_ascii_lowercase().as_str() {
			"null" | "none" => Some(Self::Null),
			"demo" => Some(Self::Demo),
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
	pub adapter: UpstreamAdapterKind,
	pub demo_emit_interval: Duration,
}

impl Default for UpstreamSettings {
	fn default() -> Self {
		Self {
			adapter: UpstreamAdapterKind::Null,
			demo_emit_interval: DEFAULT_DEMO_EMIT_INTERVAL,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticChannel {
	pub id: ChannelId,
	pub name: String,
	pub upstream_channel_id: UpstreamChannelId,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	gateway: FileGatewaySettings,

	#[serde(default)]
	directory: FileDirectorySettings,

	#[serde(default)]
	upstream: FileUpstreamSettings,

	#[serde(default)]
	channels: Vec<FileChannel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_message_bytes: Option<usize>,
	session_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileGatewaySettings {
	reconnect_interval_ms: Option<u64>,
	liveness_interval_ms: Option<u64>,
	liveness_timeout_ms: Option<u64>,
	upstream_event_capacity: Option<usize>,
	reply_on_not_logged_in: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDirectorySettings {
	url: Option<String>,
	platform: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUpstreamSettings {
	adapter: Option<String>,
	demo_emit_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileChannel {
	id: String,
	name: Option<String>,
	upstream_channel_id: String,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = GatewaySettings::default();
		let gateway = GatewaySettings {
			reconnect_interval: interval_or_default(
				"reconnect_interval_ms",
				file.gateway.reconnect_interval_ms,
				defaults.reconnect_interval,
			),
			liveness_interval: interval_or_default(
				"liveness_interval_ms",
				file.gateway.liveness_interval_ms,
				defaults.liveness_interval,
			),
			liveness_timeout: interval_or_default(
				"liveness_timeout_ms",
				file.gateway.liveness_timeout_ms,
				defaults.liveness_timeout,
			),
			upstream_event_capacity: file
				.gateway
				.upstream_event_capacity
				.filter(|v| *v > 0)
				.unwrap_or(defaults.upstream_event_capacity),
			reply_on_not_logged_in: file.gateway.reply_on_not_logged_in.unwrap_or(false),
		};

		let adapter = match file.upstream.adapter.as_deref() {
			None => UpstreamAdapterKind::default(),
			Some(v) => UpstreamAdapterKind::parse(v).unwrap_or_else(|| {
				warn!(adapter = %v, "upstream config: unknown adapter; using null");
				UpstreamAdapterKind::Null
			}),
		};

		let channels = file
			.channels
			.into_iter()
			.filter_map(|c| match (ChannelId::new(c.id.trim()), UpstreamChannelId::new(c.upstream_channel_id)) {
				(Ok(id), Ok(upstream_channel_id)) => Some(StaticChannel {
					name: c.name.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| id.to_string()),
					id,
					upstream_channel_id,
				}),
				(Err(e), _) | (_, Err(e)) => {
					warn!(id = %c.id, error = %e, "channels config: skipping invalid entry");
					None
				}
			})
			.collect();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				max_message_bytes: file
					.server
					.max_message_bytes
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
				session_queue_capacity: file
					.server
					.session_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_SESSION_QUEUE_CAPACITY),
			},
			gateway,
			directory: DirectorySettings {
				url: file.directory.url.filter(|s| !s.trim().is_empty()),
				platform: file
					.directory
					.platform
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_DIRECTORY_PLATFORM.to_string()),
			},
			upstream: UpstreamSettings {
				adapter,
				demo_emit_interval: file
					.upstream
					.demo_emit_interval_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(DEFAULT_DEMO_EMIT_INTERVAL),
			},
			channels,
		}
	}
}

fn interval_or_default(key: &str, ms: Option<u64>, default: Duration) -> Duration {
	match ms {
		None => default,
		Some(0) => {
			warn!(key, default_ms = default.as_millis() as u64, "gateway config: zero interval; using default");
			default
		}
		Some(ms) => Duration::from_millis(ms),
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("RELAY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("RELAY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty("API_URL") {
		cfg.directory.url = Some(v);
		info!("directory config: url overridden by env (API_URL)");
	}

	if let Some(v) = non_empty("RELAY_DIRECTORY_URL") {
		cfg.directory.url = Some(v);
		info!("directory config: url overridden by env");
	}

	if let Some(v) = non_empty("RELAY_RECONNECT_INTERVAL_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.gateway.reconnect_interval = interval_or_default("reconnect_interval_ms", Some(ms), cfg.gateway.reconnect_interval);
		info!(ms, "gateway config: reconnect_interval overridden by env");
	}

	if let Some(v) = non_empty("RELAY_LIVENESS_INTERVAL_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.gateway.liveness_interval = interval_or_default("liveness_interval_ms", Some(ms), cfg.gateway.liveness_interval);
		info!(ms, "gateway config: liveness_interval overridden by env");
	}

	if let Some(v) = non_empty("RELAY_LIVENESS_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.gateway.liveness_timeout = interval_or_default("liveness_timeout_ms", Some(ms), cfg.gateway.liveness_timeout);
		info!(ms, "gateway config: liveness_timeout overridden by env");
	}

	if let Some(v) = non_empty("RELAY_UPSTREAM_ADAPTER") {
		match UpstreamAdapterKind::parse(&v) {
			Some(adapter) => {
				cfg.upstream.adapter = adapter;
				info!(adapter = ?adapter, "upstream config: adapter overridden by env");
			}
			None => warn!(adapter = %v, "upstream config: unknown adapter in env; ignoring"),
		}
	}

	if cfg.gateway.liveness_interval > cfg.gateway.liveness_timeout {
		warn!(
			interval_ms = cfg.gateway.liveness_interval.as_millis() as u64,
			timeout_ms = cfg.gateway.liveness_timeout.as_millis() as u64,
			"gateway config: liveness_interval exceeds liveness_timeout; idle sessions may linger"
		);
	}
}
