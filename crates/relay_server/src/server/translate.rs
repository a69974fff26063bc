#![forbid(unsafe_code)]

//! Upstream event → outbound envelope mapping. Pure apart from the caller-supplied timestamp.

use relay_domain::ChannelId;
use relay_protocol::{Badge, DonationBody, MessagePart, OutboundEvent, PrivMsgBody, Profile};
use relay_upstream::{ChatEvent, ContentPart, DonationEvent, StreamMeta, SubscriptionTier};
use tracing::debug;

/// Sticker CDN prefix; the sticker reference is appended verbatim.
pub const STICKER_CDN_BASE: &str = "https://ogq-sticker-global-cdn-z01.sooplive.co.kr/sticker/";

pub const STREAMER_BADGE: &str = "streamer";
pub const MANAGER_BADGE: &str = "manager";
pub const TOPFAN_BADGE: &str = "topfan";
pub const FAN_BADGE: &str = "fan";

pub fn translate_chat(channel: &ChannelId, event: &ChatEvent, meta: Option<&StreamMeta>, timestamp_ms: i64) -> OutboundEvent {
	let mut badges = Vec::with_capacity(2);
	if let Some(badge) = subscription_badge(event.subscription, meta) {
		badges.push(badge);
	}
	if let Some(badge) = role_badge(event) {
		badges.push(badge);
	}

	OutboundEvent::Privmsg {
		channel_id: channel.clone(),
		body: PrivMsgBody {
			profile: Profile {
				user_id: event.user_id.clone(),
				nickname: event.nickname.clone(),
				color: event.color.clone(),
				color_darkmode: event.color_darkmode.clone(),
				badges,
			},
			message: message_parts(channel, event),
			timestamp: timestamp_ms,
		},
	}
}

/// Donations carry no role or subscription badges and no colors.
pub fn translate_donation(channel: &ChannelId, event: &DonationEvent, timestamp_ms: i64) -> OutboundEvent {
	OutboundEvent::Donation {
		channel_id: channel.clone(),
		body: DonationBody {
			kind: event.kind.clone(),
			profile: Profile {
				user_id: event.user_id.clone(),
				nickname: event.nickname.clone(),
				color: String::new(),
				color_darkmode: String::new(),
				badges: Vec::new(),
			},
			message: String::new(),
			count: event.count,
			fan_join_order: event.fan_club_order,
			img_url: event.image_name.clone(),
			timestamp: timestamp_ms,
		},
	}
}

/// `sub/<tier>` badge for subscribed users; the image is empty when no tier entry applies.
pub fn subscription_badge(tier: u32, meta: Option<&StreamMeta>) -> Option<Badge> {
	if tier == 0 {
		return None;
	}

	let img_url = meta
		.and_then(|m| resolve_tier_image(&m.subscription_tiers, tier))
		.unwrap_or_default()
		.to_string();

	Some(Badge {
		name: format!("sub/{tier}"),
		img_url,
	})
}

/// Image of the highest tier threshold not above `tier`.
pub fn resolve_tier_image(tiers: &[SubscriptionTier], tier: u32) -> Option<&str> {
	tiers
		.iter()
		.filter(|t| t.months <= tier)
		.max_by_key(|t| t.months)
		.map(|t| t.image.as_str())
}

/// At most one role badge: streamer > manager > topfan > fan.
pub fn role_badge(event: &ChatEvent) -> Option<Badge> {
	let name = if event.is_streamer {
		STREAMER_BADGE
	} else if event.is_manager {
		MANAGER_BADGE
	} else if event.is_topfan {
		TOPFAN_BADGE
	} else if event.is_fan {
		FAN_BADGE
	} else {
		return None;
	};
	Some(Badge::role(name))
}

fn message_parts(channel: &ChannelId, event: &ChatEvent) -> Vec<MessagePart> {
	let mut parts: Vec<MessagePart> = event
		.parts
		.iter()
		.map(|part| match part {
			ContentPart::Text(text) => MessagePart::Text { text: text.clone() },
			ContentPart::Emote(token) => {
				let img_url = match event.emotes.get(token) {
					Some(emote) => emote.mobile_img.clone(),
					None => {
						debug!(%channel, emote = %token, "emote missing from event table; sending without image");
						String::new()
					}
				};
				MessagePart::Emote {
					name: token.clone(),
					img_url,
				}
			}
		})
		.collect();

	if let Some(sticker) = event.sticker.as_deref().filter(|s| !s.is_empty()) {
		parts.push(MessagePart::Sticker {
			name: String::new(),
			img_url: format!("{STICKER_CDN_BASE}{sticker}"),
		});
	}

	parts
}
