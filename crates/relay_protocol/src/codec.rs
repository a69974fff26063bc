#![forbid(unsafe_code)]

use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{ChannelRef, MessageType, OutboundEvent, Reply, Request};

/// Default maximum inbound message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("message exceeds maximum size: len={len} max={max}")]
	MessageTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("malformed message: {0}")]
	Malformed(String),

	#[error("unknown message type: {0}")]
	UnknownType(String),

	#[error("message type {0} is outbound-only")]
	UnexpectedType(MessageType),

	#[error("{kind} is missing required field `{field}`")]
	MissingField {
		kind: MessageType,
		field: &'static str,
	},
}

/// Decode one inbound `{ type, body? }` message.
pub fn decode_request(text: &str, max_message_size: usize) -> Result<Request, ProtocolError> {
	if text.len() > max_message_size {
		return Err(ProtocolError::MessageTooLarge {
			len: text.len(),
			max: max_message_size,
		});
	}

	let value: Value = serde_json::from_str(text)?;
	let Value::Object(mut obj) = value else {
		return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
	};

	let kind = match obj.remove("type") {
		Some(Value::String(s)) => MessageType::from_wire(&s).ok_or(ProtocolError::UnknownType(s))?,
		Some(other) => return Err(ProtocolError::UnknownType(other.to_string())),
		None => return Err(ProtocolError::Malformed("missing `type`".to_string())),
	};

	if !kind.is_inbound() {
		return Err(ProtocolError::UnexpectedType(kind));
	}

	let body = match obj.remove("body") {
		Some(Value::Object(body)) => Some(body),
		Some(Value::Null) | None => None,
		Some(_) => return Err(ProtocolError::Malformed(format!("{kind} body must be an object"))),
	};

	match kind {
		MessageType::Ping => Ok(Request::Ping),
		MessageType::Chlist => Ok(Request::ChannelList),
		MessageType::Login => {
			let body = body.ok_or(ProtocolError::MissingField { kind, field: "body" })?;
			let user_id = coerce_user_id(kind, &body)?;
			Ok(Request::Login { user_id })
		}
		MessageType::Join => Ok(Request::Join {
			channel_ids: channel_id_list(kind, body)?,
		}),
		MessageType::Part => Ok(Request::Part {
			channel_ids: channel_id_list(kind, body)?,
		}),
		MessageType::Privmsg | MessageType::Donation => Err(ProtocolError::UnexpectedType(kind)),
	}
}

/// `userId` accepts strings verbatim and numbers/booleans in their textual form.
fn coerce_user_id(kind: MessageType, body: &Map<String, Value>) -> Result<String, ProtocolError> {
	match body.get("userId") {
		Some(Value::String(s)) => Ok(s.clone()),
		Some(Value::Number(n)) => Ok(n.to_string()),
		Some(Value::Bool(b)) => Ok(b.to_string()),
		Some(Value::Null) | None => Err(ProtocolError::MissingField { kind, field: "userId" }),
		Some(_) => Err(ProtocolError::Malformed(format!("{kind} userId must be a scalar"))),
	}
}

/// A non-array `channelIds` rejects the message; a non-string entry only rejects itself.
fn channel_id_list(kind: MessageType, body: Option<Map<String, Value>>) -> Result<Vec<ChannelRef>, ProtocolError> {
	let mut body = body.ok_or(ProtocolError::MissingField { kind, field: "body" })?;
	let Some(raw) = body.remove("channelIds") else {
		return Err(ProtocolError::MissingField {
			kind,
			field: "channelIds",
		});
	};

	let Value::Array(items) = raw else {
		return Err(ProtocolError::Malformed(format!("{kind} channelIds must be an array")));
	};

	Ok(items
		.into_iter()
		.map(|item| match item {
			Value::String(s) => ChannelRef::Id(s),
			other => ChannelRef::NotAString(other.to_string()),
		})
		.collect())
}

/// Encode a reply to its wire text.
pub fn encode_reply(reply: &Reply) -> Result<String, ProtocolError> {
	Ok(serde_json::to_string(reply)?)
}

/// Encode an outbound event to its wire text.
pub fn encode_event(event: &OutboundEvent) -> Result<String, ProtocolError> {
	Ok(serde_json::to_string(event)?)
}

/// Decode a reply (client side).
pub fn decode_reply(text: &str) -> Result<Reply, ProtocolError> {
	Ok(serde_json::from_str(text)?)
}

/// Decode an outbound event (client side).
pub fn decode_event(text: &str) -> Result<OutboundEvent, ProtocolError> {
	Ok(serde_json::from_str(text)?)
}
