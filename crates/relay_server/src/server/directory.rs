#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use relay_domain::{ChannelId, UpstreamChannelId};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::StaticChannel;
use crate::server::gateway::{Gateway, GatewayError};

const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of `GET <url>/member/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryMember {
	#[serde(deserialize_with = "string_or_number")]
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(rename = "livePlatform", default)]
	pub live_platform: Vec<LivePlatform>,
}

/// A live-platform entry. Entries for other platforms are never inspected, so both fields
/// tolerate null, missing or oddly typed values.
#[derive(Debug, Clone, Deserialize)]
pub struct LivePlatform {
	#[serde(rename = "type", default, deserialize_with = "lenient_string")]
	pub kind: Option<String>,
	#[serde(rename = "channelId", default, deserialize_with = "lenient_string")]
	pub channel_id: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
	match Value::deserialize(d)? {
		Value::String(s) => Ok(s),
		Value::Number(n) => Ok(n.to_string()),
		other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
	}
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
	Ok(match Value::deserialize(d)? {
		Value::String(s) => Some(s),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	})
}

/// Decode members one by one; a malformed member is skipped instead of failing the list.
pub fn parse_members(values: Vec<Value>) -> Vec<DirectoryMember> {
	values
		.into_iter()
		.enumerate()
		.filter_map(|(index, value)| match DirectoryMember::deserialize(value) {
			Ok(member) => Some(member),
			Err(e) => {
				warn!(index, error = %e, "directory: skipping malformed member");
				None
			}
		})
		.collect()
}

/// Fetch the member list and keep members live on `platform`.
pub async fn fetch_directory(base_url: &str, platform: &str) -> anyhow::Result<Vec<StaticChannel>> {
	let url = format!("{}/member/list", base_url.trim_end_matches('/'));
	let client = reqwest::Client::builder()
		.timeout(DIRECTORY_TIMEOUT)
		.build()
		.context("build directory http client")?;

	debug!(%url, "fetching channel directory");
	let values: Vec<Value> = client
		.get(&url)
		.send()
		.await
		.with_context(|| format!("GET {url}"))?
		.error_for_status()
		.with_context(|| format!("GET {url}"))?
		.json()
		.await
		.context("decode member list")?;
	let members = parse_members(values);

	let entries = entries_from_members(&members, platform);
	info!(%url, members = members.len(), channels = entries.len(), %platform, "channel directory fetched");
	Ok(entries)
}

/// First live platform of each member whose type matches `platform`; invalid ids are skipped.
pub fn entries_from_members(members: &[DirectoryMember], platform: &str) -> Vec<StaticChannel> {
	members
		.iter()
		.filter_map(|member| {
			let live = member
				.live_platform
				.iter()
				.find(|p| p.kind.as_deref() == Some(platform))?;
			let Some(channel_id) = live.channel_id.as_deref() else {
				warn!(member = %member.id, %platform, "directory: skipping member without a channelId");
				return None;
			};
			match (ChannelId::new(member.id.as_str()), UpstreamChannelId::new(channel_id)) {
				(Ok(id), Ok(upstream_channel_id)) => Some(StaticChannel {
					id,
					name: member.name.clone(),
					upstream_channel_id,
				}),
				(Err(e), _) | (_, Err(e)) => {
					warn!(member = %member.id, error = %e, "directory: skipping member with invalid ids");
					None
				}
			}
		})
		.collect()
}

/// Add every entry; duplicates are skipped. Returns how many channels were added.
pub fn seed_channels(gateway: &mut Gateway, entries: Vec<StaticChannel>) -> usize {
	let mut added = 0;
	for entry in entries {
		match gateway.add_channel(entry.id, entry.name, entry.upstream_channel_id) {
			Ok(()) => added += 1,
			Err(GatewayError::DuplicateChannel(id)) => {
				warn!(channel = %id, "duplicate channel id; keeping the first definition");
			}
			Err(e) => warn!(error = %e, "failed to add channel"),
		}
	}
	added
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::test_support::{TestGateway, channel_id};

	fn members(json: &str) -> Vec<DirectoryMember> {
		parse_members(serde_json::from_str(json).expect("member list is a JSON array"))
	}

	#[test]
	fn keeps_only_members_live_on_platform() {
		let list = members(
			r#"[
				{"id":"m1","name":"One","livePlatform":[{"type":"youtube","channelId":"yt1"},{"type":"afreeca","channelId":"bj1"}]},
				{"id":"m2","name":"Two","livePlatform":[{"type":"youtube","channelId":"yt2"}]},
				{"id":3,"name":"Three","livePlatform":[{"type":"afreeca","channelId":12345}]},
				{"id":"m4","name":"Four"},
				{"id":"","name":"Blank","livePlatform":[{"type":"afreeca","channelId":"bj5"}]}
			]"#,
		);

		let entries = entries_from_members(&list, "afreeca");
		let got: Vec<(&str, &str, &str)> = entries
			.iter()
			.map(|e| (e.id.as_str(), e.name.as_str(), e.upstream_channel_id.as_str()))
			.collect();
		assert_eq!(got, vec![("m1", "One", "bj1"), ("3", "Three", "12345")]);
	}

	#[test]
	fn unusable_entries_for_other_platforms_do_not_drop_the_list() {
		let list = members(
			r#"[
				{"id":"m1","name":"One","livePlatform":[{"type":"afreeca","channelId":"bj1"}]},
				{"id":"m2","name":"Two","livePlatform":[{"type":"youtube","channelId":null},{"type":"afreeca","channelId":"bj2"}]},
				{"id":"m3","name":"Three","livePlatform":[{"channelId":"yt3"},{"type":"afreeca","channelId":"bj3"}]},
				{"id":"m4","name":"Four","livePlatform":[{"type":"afreeca"}]},
				{"id":null,"name":"Broken","livePlatform":[{"type":"afreeca","channelId":"bj5"}]},
				{"id":"m6","name":"Six","livePlatform":[{"type":"afreeca","channelId":66}]}
			]"#,
		);
		assert_eq!(list.len(), 5);

		let ids: Vec<String> = entries_from_members(&list, "afreeca")
			.into_iter()
			.map(|e| format!("{}={}", e.id, e.upstream_channel_id))
			.collect();
		assert_eq!(ids, vec!["m1=bj1", "m2=bj2", "m3=bj3", "m6=66"]);
	}

	#[test]
	fn seeding_skips_duplicates_and_keeps_first() {
		let mut t = TestGateway::new();
		t.add_channel("c1");

		let entries = vec![
			StaticChannel {
				id: channel_id("c1"),
				name: "dup".to_string(),
				upstream_channel_id: UpstreamChannelId::new("x").unwrap(),
			},
			StaticChannel {
				id: channel_id("c2"),
				name: "Two".to_string(),
				upstream_channel_id: UpstreamChannelId::new("bj2").unwrap(),
			},
		];

		assert_eq!(seed_channels(&mut t.gateway, entries), 1);
		assert_eq!(t.gateway.channel_ids(), vec!["c1".to_string(), "c2".to_string()]);
		assert_eq!(t.gateway.channel(&channel_id("c1")).unwrap().display_name(), "c1 display");
	}
}
