#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and keys from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("expected a positive integer, got: {0}")]
	NotPositive(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! positive_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "i64", into = "i64")]
		pub struct $name(i64);

		impl $name {
			/// Create an id; zero and negative values are rejected.
			pub fn new(id: i64) -> Result<Self, ParseIdError> {
				if id <= 0 {
					return Err(ParseIdError::NotPositive(id.to_string()));
				}
				Ok(Self(id))
			}

			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				if !s.bytes().all(|b| b.is_ascii_digit()) {
					return Err(ParseIdError::NotPositive(s.to_string()));
				}
				let id = s.parse::<i64>().map_err(|_| ParseIdError::NotPositive(s.to_string()))?;
				Self::new(id)
			}
		}

		impl TryFrom<i64> for $name {
			type Error = ParseIdError;

			fn try_from(id: i64) -> Result<Self, Self::Error> {
				Self::new(id)
			}
		}

		impl From<$name> for i64 {
			fn from(id: $name) -> i64 {
				id.0
			}
		}
	};
}

positive_id!(
	/// Authenticated user (worker) identifier.
	PrincipalId
);

positive_id!(
	/// Persisted chat room identifier.
	RoomId
);

positive_id!(
	/// Tenant scope for rooms and messages.
	OrganizationId
);

positive_id!(
	/// Persisted message identifier.
	MessageId
);

/// Unordered pair of principals identifying a private room.
///
/// Construction sorts the pair, so `(a, b)` and `(b, a)` compare equal and
/// render the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrivatePair {
	low: PrincipalId,
	high: PrincipalId,
}

impl PrivatePair {
	/// Prefix of every private room key.
	pub const PREFIX: &'static str = "private";

	/// Separator between key segments.
	pub const SEPARATOR: char = '_';

	pub fn new(a: PrincipalId, b: PrincipalId) -> Self {
		if a <= b { Self { low: a, high: b } } else { Self { low: b, high: a } }
	}

	/// Both members, ascending. Equal when a principal chats with itself.
	pub fn members(&self) -> [PrincipalId; 2] {
		[self.low, self.high]
	}

	/// The member that is not `principal`, if `principal` belongs to the pair.
	pub fn other(&self, principal: PrincipalId) -> Option<PrincipalId> {
		if self.low == principal {
			Some(self.high)
		} else if self.high == principal {
			Some(self.low)
		} else {
			None
		}
	}

	/// Canonical key, e.g. `private_5_10`.
	pub fn key(&self) -> String {
		format!(
			"{}{sep}{}{sep}{}",
			Self::PREFIX,
			self.low,
			self.high,
			sep = Self::SEPARATOR
		)
	}

	/// Parse a canonical key back into a pair. Unsorted keys are accepted and normalized.
	pub fn parse_key(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let rest = s
			.strip_prefix(Self::PREFIX)
			.and_then(|r| r.strip_prefix(Self::SEPARATOR))
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("expected private_<a>_<b>: {s}")))?;

		let (a, b) = rest
			.split_once(Self::SEPARATOR)
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("expected private_<a>_<b>: {s}")))?;

		Ok(Self::new(a.parse()?, b.parse()?))
	}
}

impl fmt::Display for PrivatePair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.key())
	}
}

/// Broadcast group key: the runtime fan-out scope of a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
	/// Prefix for group-room broadcast keys.
	pub const GROUP_PREFIX: &'static str = "group_";

	pub fn private(pair: &PrivatePair) -> Self {
		Self(pair.key())
	}

	pub fn group(room: RoomId) -> Self {
		Self(format!("{}{}", Self::GROUP_PREFIX, room))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for GroupKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// The two kinds of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomKind {
	Private { pair: PrivatePair },
	Group,
}

/// A persisted conversation scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub name: Option<String>,
	pub kind: RoomKind,
	pub organization: Option<OrganizationId>,
}

impl Room {
	pub fn is_private(&self) -> bool {
		matches!(self.kind, RoomKind::Private { .. })
	}

	pub fn private_pair(&self) -> Option<PrivatePair> {
		match self.kind {
			RoomKind::Private { pair } => Some(pair),
			RoomKind::Group => None,
		}
	}

	/// Broadcast key. A private room keeps its pair key whichever route reached it.
	pub fn group_key(&self) -> GroupKey {
		match &self.kind {
			RoomKind::Private { pair } => GroupKey::private(pair),
			RoomKind::Group => GroupKey::group(self.id),
		}
	}

	pub fn display_name(&self) -> String {
		match (&self.name, &self.kind) {
			(Some(name), _) if !name.trim().is_empty() => name.clone(),
			(_, RoomKind::Private { pair }) => pair.key(),
			(_, RoomKind::Group) => format!("room {}", self.id),
		}
	}
}

/// An authenticated user as seen by the chat core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
	pub id: PrincipalId,
	pub username: String,
	pub organization: Option<OrganizationId>,
}

impl Principal {
	pub fn new(id: PrincipalId, username: impl Into<String>) -> Self {
		Self {
			id,
			username: username.into(),
			organization: None,
		}
	}

	pub fn with_organization(mut self, organization: Option<OrganizationId>) -> Self {
		self.organization = organization;
		self
	}
}

/// An immutable chat message as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	pub id: MessageId,
	pub room: RoomId,
	pub sender_id: PrincipalId,
	pub sender_name: String,
	pub content: String,
	pub created_at: DateTime<Utc>,
	pub organization: Option<OrganizationId>,
}

/// A room as listed for one of its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
	pub room: Room,
	pub last_message_at: Option<DateTime<Utc>>,
	/// The other participant of a private room.
	pub other_member: Option<PrincipalId>,
}
