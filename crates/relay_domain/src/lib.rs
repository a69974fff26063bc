#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Gateway-unique channel identifier, as used on the wire (`channelId`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ChannelId(String);

impl ChannelId {
	/// Create a non-empty `ChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.to_string())
	}
}

impl AsRef<str> for ChannelId {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// Broadcast identifier on the upstream platform (the value handed to `connect`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct UpstreamChannelId(String);

impl UpstreamChannelId {
	/// Create a non-empty, whitespace-free `UpstreamChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("upstream channel id contains whitespace: {id}")));
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for UpstreamChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UpstreamChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UpstreamChannelId::new(s.to_string())
	}
}

/// Server-assigned identifier for one accepted subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct SessionId(u64);

impl SessionId {
	pub const fn new(raw: u64) -> Self {
		Self(raw)
	}
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}
