//! Room, membership and ban data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ParticipantId;

/// Validation errors raised by room value objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomValidationError {
    InvalidId,
    EmptyName,
    NameTooLong { max: usize },
    ZeroCapacity,
}

impl fmt::Display for RoomValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId => write!(f, "room id must be a valid UUID"),
            Self::EmptyName => write!(f, "room name must not be empty"),
            Self::NameTooLong { max } => write!(f, "room name must be at most {max} characters"),
            Self::ZeroCapacity => write!(f, "room capacity must be at least one"),
        }
    }
}

impl std::error::Error for RoomValidationError {}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = RoomValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| RoomValidationError::InvalidId)
            }
        }

        impl From<$name> for serde_json::Value {
            fn from(value: $name) -> Self {
                Self::String(value.to_string())
            }
        }
    };
}

uuid_id!(
    /// Stable room identifier.
    RoomId
);
uuid_id!(
    /// Identifier of a ban row, used for revocation.
    BanId
);

/// Maximum room name length.
pub const ROOM_NAME_MAX: usize = 64;

/// Trimmed, non-empty room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, RoomValidationError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(RoomValidationError::EmptyName);
        }
        if trimmed.chars().count() > ROOM_NAME_MAX {
            return Err(RoomValidationError::NameTooLong {
                max: ROOM_NAME_MAX,
            });
        }
        Ok(Self(trimmed.to_owned()))
    }
}

impl AsRef<str> for RoomName {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<RoomName> for String {
    fn from(value: RoomName) -> Self {
        value.0
    }
}

impl TryFrom<String> for RoomName {
    type Error = RoomValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Who may see a room in the listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

/// A chat room.
///
/// `occupant_count` is a cache. It is only ever rewritten from a fresh count
/// of membership rows, never incremented or decremented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: RoomName,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "owner_id")]
    pub owner: ParticipantId,
    pub capacity: u32,
    #[serde(default)]
    pub occupant_count: u32,
    #[serde(default)]
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

impl Room {
    /// Whether the cached count leaves space for one more occupant.
    ///
    /// Advisory only: concurrent joiners may all see space.
    #[must_use]
    pub fn has_space(&self) -> bool {
        self.occupant_count < self.capacity
    }
}

/// Parameters for creating a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomDraft {
    pub name: RoomName,
    pub description: Option<String>,
    pub capacity: u32,
    pub visibility: Visibility,
}

impl RoomDraft {
    pub fn new(name: impl AsRef<str>, capacity: u32) -> Result<Self, RoomValidationError> {
        if capacity == 0 {
            return Err(RoomValidationError::ZeroCapacity);
        }
        Ok(Self {
            name: RoomName::new(name)?,
            description: None,
            capacity,
            visibility: Visibility::Public,
        })
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        let trimmed = description.trim();
        self.description = (!trimmed.is_empty()).then(|| trimmed.to_owned());
        self
    }

    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }
}

/// The single room a participant occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Membership {
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
}

/// A standing ban on rejoining a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ban {
    pub id: BanId,
    pub room_id: RoomId,
    pub banned_id: ParticipantId,
    pub banned_by: ParticipantId,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-participant membership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affiliation {
    #[default]
    Unaffiliated,
    Member(RoomId),
}

impl Affiliation {
    #[must_use]
    pub const fn room(self) -> Option<RoomId> {
        match self {
            Self::Unaffiliated => None,
            Self::Member(room) => Some(room),
        }
    }
}
