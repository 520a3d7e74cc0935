//! Participant data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Position;

/// Validation errors raised by participant value objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantValidationError {
    InvalidId,
    EmptyHandle,
    HandleTooLong { max: usize },
    HandleContainsWhitespace,
    PositionOutOfBounds,
    MissingField { field: &'static str },
}

impl fmt::Display for ParticipantValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId => write!(f, "participant id must be a valid UUID"),
            Self::EmptyHandle => write!(f, "handle must not be empty"),
            Self::HandleTooLong { max } => write!(f, "handle must be at most {max} characters"),
            Self::HandleContainsWhitespace => write!(f, "handle must not contain whitespace"),
            Self::PositionOutOfBounds => {
                write!(f, "position coordinates must be finite and within [0, 1]")
            }
            Self::MissingField { field } => write!(f, "participant row is missing `{field}`"),
        }
    }
}

impl std::error::Error for ParticipantValidationError {}

/// Stable participant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    /// Sender id used for system announcements.
    pub const SYSTEM: Self = Self(Uuid::nil());

    /// Generate a new random [`ParticipantId`].
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

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ParticipantId {
    type Err = ParticipantValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ParticipantValidationError::InvalidId)
    }
}

impl From<ParticipantId> for serde_json::Value {
    fn from(value: ParticipantId) -> Self {
        Self::String(value.to_string())
    }
}

/// Case-insensitive display handle.
///
/// Handles are trimmed and lower-cased on construction so equality and
/// lookups never depend on the casing supplied by the identity provider.
///
/// # Examples
/// ```
/// use starfield::domain::Handle;
///
/// let handle = Handle::new("  Ada@Example.org ").expect("valid handle");
/// assert_eq!(handle.as_ref(), "ada@example.org");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

/// Maximum allowed handle length.
pub const HANDLE_MAX: usize = 254;

impl Handle {
    /// Validate and normalise a handle.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, ParticipantValidationError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ParticipantValidationError::EmptyHandle);
        }
        if trimmed.chars().count() > HANDLE_MAX {
            return Err(ParticipantValidationError::HandleTooLong { max: HANDLE_MAX });
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(ParticipantValidationError::HandleContainsWhitespace);
        }
        Ok(Self(trimmed.to_lowercase()))
    }

    /// Handle used as sender for system announcements.
    #[must_use]
    pub fn system() -> Self {
        Self("system".to_owned())
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<Handle> for String {
    fn from(value: Handle) -> Self {
        value.0
    }
}

impl TryFrom<String> for Handle {
    type Error = ParticipantValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// A participant as seen by this client.
///
/// ## Invariants
/// - `position` and `origin` lie in `[0, 1]²`.
/// - Participants are never deleted on sign-out, only flagged offline.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub handle: Handle,
    pub position: Position,
    /// First position ever assigned; restored on every sign-in.
    pub origin: Option<Position>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Participant {
    /// Build a participant from a complete or partial row. Missing position
    /// falls back to the origin, then to the centre of the view.
    pub fn from_row(row: &ParticipantRow) -> Result<Self, ParticipantValidationError> {
        let id = row
            .id
            .ok_or(ParticipantValidationError::MissingField { field: "id" })?;
        let handle = Handle::new(
            row.handle
                .as_deref()
                .ok_or(ParticipantValidationError::MissingField { field: "handle" })?,
        )?;
        let origin = row.origin()?;
        let position = row.position()?.or(origin).unwrap_or(Position::CENTER);
        Ok(Self {
            id,
            handle,
            position,
            origin,
            online: row.online.unwrap_or(false),
            last_seen: row.last_seen,
        })
    }

    /// Merge the fields present in `row`; remote values win. An invalid row
    /// leaves the participant untouched.
    pub fn merge(&mut self, row: &ParticipantRow) -> Result<(), ParticipantValidationError> {
        let handle = row.handle.as_deref().map(Handle::new).transpose()?;
        let position = row.position()?;
        let origin = row.origin()?;

        if let Some(handle) = handle {
            self.handle = handle;
        }
        if let Some(position) = position {
            self.position = position;
        }
        if let Some(origin) = origin {
            self.origin = Some(origin);
        }
        if let Some(online) = row.online {
            self.online = online;
        }
        if row.last_seen.is_some() {
            self.last_seen = row.last_seen;
        }
        Ok(())
    }
}

/// Wire image of a participant row. Every field is optional so partial
/// pushes can be merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRow {
    #[serde(default)]
    pub id: Option<ParticipantId>,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub origin_x: Option<f64>,
    #[serde(default)]
    pub origin_y: Option<f64>,
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl ParticipantRow {
    fn position(&self) -> Result<Option<Position>, ParticipantValidationError> {
        pair(self.x, self.y)
    }

    fn origin(&self) -> Result<Option<Position>, ParticipantValidationError> {
        pair(self.origin_x, self.origin_y)
    }

    /// Lower-cased handle, used by the legacy handle-matching path.
    #[must_use]
    pub fn handle_key(&self) -> Option<String> {
        self.handle.as_deref().map(|h| h.trim().to_lowercase())
    }
}

fn pair(x: Option<f64>, y: Option<f64>) -> Result<Option<Position>, ParticipantValidationError> {
    match (x, y) {
        (Some(x), Some(y)) => Position::new(x, y)
            .map(Some)
            .map_err(|_| ParticipantValidationError::PositionOutOfBounds),
        _ => Ok(None),
    }
}
