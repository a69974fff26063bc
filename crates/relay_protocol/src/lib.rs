#![forbid(unsafe_code)]

pub mod codec;
pub mod types;

pub use codec::{
	DEFAULT_MAX_MESSAGE_SIZE, ProtocolError, decode_event, decode_reply, decode_request, encode_event, encode_reply,
};
pub use types::{
	Badge, ChannelRef, ChannelsBody, DonationBody, LoginBody, MessagePart, MessageType, OutboundEvent, PrivMsgBody,
	Profile, Reply, ReplyBody, Request,
};
