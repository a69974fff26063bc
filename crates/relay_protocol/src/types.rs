#![forbid(unsafe_code)]

use core::fmt;

use relay_domain::ChannelId;
use serde::{Deserialize, Serialize};

/// Wire `type` discriminator shared by requests, replies and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
	Ping,
	Login,
	Join,
	Part,
	Chlist,
	Privmsg,
	Donation,
}

impl MessageType {
	/// Stable wire identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageType::Ping => "PING",
			MessageType::Login => "LOGIN",
			MessageType::Join => "JOIN",
			MessageType::Part => "PART",
			MessageType::Chlist => "CHLIST",
			MessageType::Privmsg => "PRIVMSG",
			MessageType::Donation => "DONATION",
		}
	}

	/// Parse a wire identifier. Matching is exact (upper case).
	pub fn from_wire(s: &str) -> Option<Self> {
		match s {
			"PING" => Some(MessageType::Ping),
			"LOGIN" => Some(MessageType::Login),
			"JOIN" => Some(MessageType::Join),
			"PART" => Some(MessageType::Part),
			"CHLIST" => Some(MessageType::Chlist),
			"PRIVMSG" => Some(MessageType::Privmsg),
			"DONATION" => Some(MessageType::Donation),
			_ => None,
		}
	}

	/// Whether subscribers may send this type to the gateway.
	pub const fn is_inbound(self) -> bool {
		!matches!(self, MessageType::Privmsg | MessageType::Donation)
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One entry of a JOIN/PART `channelIds` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
	Id(String),
	/// Non-string entry, kept as its JSON text. Never names a channel.
	NotAString(String),
}

impl From<&str> for ChannelRef {
	fn from(id: &str) -> Self {
		ChannelRef::Id(id.to_string())
	}
}

impl From<String> for ChannelRef {
	fn from(id: String) -> Self {
		ChannelRef::Id(id)
	}
}

/// A decoded subscriber request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
	Ping,
	Login { user_id: String },
	Join { channel_ids: Vec<ChannelRef> },
	Part { channel_ids: Vec<ChannelRef> },
	ChannelList,
}

impl Request {
	pub fn message_type(&self) -> MessageType {
		match self {
			Request::Ping => MessageType::Ping,
			Request::Login { .. } => MessageType::Login,
			Request::Join { .. } => MessageType::Join,
			Request::Part { .. } => MessageType::Part,
			Request::ChannelList => MessageType::Chlist,
		}
	}
}

/// Reply envelope: `{ type, body?, success? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
	#[serde(rename = "type")]
	pub kind: MessageType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<ReplyBody>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub success: Option<bool>,
}

impl Reply {
	/// Bare PING acknowledgement.
	pub fn ping() -> Self {
		Self {
			kind: MessageType::Ping,
			body: None,
			success: None,
		}
	}

	pub fn login(user_id: impl Into<String>) -> Self {
		Self {
			kind: MessageType::Login,
			body: Some(ReplyBody::Login(LoginBody { user_id: user_id.into() })),
			success: Some(true),
		}
	}

	/// JOIN/PART/CHLIST reply carrying a channel id list.
	pub fn channels(kind: MessageType, user_id: impl Into<String>, channel_ids: Vec<String>) -> Self {
		Self {
			kind,
			body: Some(ReplyBody::Channels(ChannelsBody {
				user_id: user_id.into(),
				channel_ids,
			})),
			success: Some(true),
		}
	}

	/// Explicit failure reply (`success: false`, no body).
	pub fn failure(kind: MessageType) -> Self {
		Self {
			kind,
			body: None,
			success: Some(false),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyBody {
	Channels(ChannelsBody),
	Login(LoginBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginBody {
	#[serde(rename = "userId")]
	pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelsBody {
	#[serde(rename = "userId")]
	pub user_id: String,
	#[serde(rename = "channelIds")]
	pub channel_ids: Vec<String>,
}

/// Outbound-only events relayed from an upstream session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum OutboundEvent {
	Privmsg {
		#[serde(rename = "channelId")]
		channel_id: ChannelId,
		body: PrivMsgBody,
	},
	Donation {
		#[serde(rename = "channelId")]
		channel_id: ChannelId,
		body: DonationBody,
	},
}

impl OutboundEvent {
	pub fn message_type(&self) -> MessageType {
		match self {
			OutboundEvent::Privmsg { .. } => MessageType::Privmsg,
			OutboundEvent::Donation { .. } => MessageType::Donation,
		}
	}

	pub fn channel_id(&self) -> &ChannelId {
		match self {
			OutboundEvent::Privmsg { channel_id, .. } | OutboundEvent::Donation { channel_id, .. } => channel_id,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivMsgBody {
	pub profile: Profile,
	pub message: Vec<MessagePart>,
	/// Gateway-local unix time in milliseconds.
	pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationBody {
	#[serde(rename = "type")]
	pub kind: String,
	pub profile: Profile,
	pub message: String,
	pub count: u64,
	#[serde(rename = "fanJoinOrder")]
	pub fan_join_order: u64,
	#[serde(rename = "imgUrl")]
	pub img_url: String,
	pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
	#[serde(rename = "userId")]
	pub user_id: String,
	pub nickname: String,
	pub color: String,
	#[serde(rename = "colorDarkmode")]
	pub color_darkmode: String,
	pub badges: Vec<Badge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
	pub name: String,
	#[serde(rename = "imgUrl")]
	pub img_url: String,
}

impl Badge {
	/// Role badge without an image (the client renders it from the name).
	pub fn role(name: &str) -> Self {
		Self {
			name: name.to_string(),
			img_url: String::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
	Text {
		text: String,
	},
	Emote {
		name: String,
		#[serde(rename = "imgUrl")]
		img_url: String,
	},
	Sticker {
		name: String,
		#[serde(rename = "imgUrl")]
		img_url: String,
	},
}
