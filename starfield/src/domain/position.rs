//! Positions in the shared unit square and the per-session drift vector.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::ParticipantId;

/// Raised when a coordinate is non-finite or outside `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOutOfBounds;

impl fmt::Display for PositionOutOfBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coordinates must be finite and within [0, 1]")
    }
}

impl std::error::Error for PositionOutOfBounds {}

/// A point in the unit square.
///
/// # Examples
/// ```
/// use starfield::domain::Position;
///
/// assert!(Position::new(0.2, 0.8).is_ok());
/// assert!(Position::new(1.2, 0.8).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    x: f64,
    y: f64,
}

impl Position {
    /// Centre of the view.
    pub const CENTER: Self = Self { x: 0.5, y: 0.5 };

    pub fn new(x: f64, y: f64) -> Result<Self, PositionOutOfBounds> {
        if in_unit_range(x) && in_unit_range(y) {
            Ok(Self { x, y })
        } else {
            Err(PositionOutOfBounds)
        }
    }

    #[must_use]
    pub const fn x(&self) -> f64 {
        self.x
    }

    #[must_use]
    pub const fn y(&self) -> f64 {
        self.y
    }

    /// Uniform point in `[0.1, 0.9]²`, used as a first-time origin.
    pub fn random_origin<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            x: rng.gen_range(0.1..=0.9),
            y: rng.gen_range(0.1..=0.9),
        }
    }

    /// Advance by `drift`, wrapping each axis independently.
    ///
    /// A coordinate that rises above 1 restarts at 0; one that falls below 0
    /// restarts at 1. The result always lies in the unit square.
    #[must_use]
    pub fn drifted(self, drift: DriftVector) -> Self {
        Self {
            x: wrap(self.x + drift.dx),
            y: wrap(self.y + drift.dy),
        }
    }
}

fn in_unit_range(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

fn wrap(value: f64) -> f64 {
    if value > 1.0 {
        0.0
    } else if value < 0.0 {
        1.0
    } else {
        value
    }
}

/// Fixed per-session velocity applied on each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftVector {
    pub dx: f64,
    pub dy: f64,
}

impl DriftVector {
    #[must_use]
    pub const fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }

    /// Derive a drift vector from the participant and the session start.
    ///
    /// The same inputs always give the same vector, so trajectories can be
    /// replayed. Components lie in `[-scale / 2, scale / 2)`.
    ///
    /// # Examples
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use starfield::domain::{DriftVector, ParticipantId};
    ///
    /// let id = ParticipantId::random();
    /// let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid");
    /// assert_eq!(
    ///     DriftVector::for_session(id, start, 0.01),
    ///     DriftVector::for_session(id, start, 0.01),
    /// );
    /// ```
    #[must_use]
    pub fn for_session(
        participant: ParticipantId,
        session_start: DateTime<Utc>,
        scale: f64,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(participant.as_uuid().as_bytes());
        hasher.update(session_start.timestamp_micros().to_le_bytes());
        let seed: [u8; 32] = hasher.finalize().into();
        let mut rng = SmallRng::from_seed(seed);
        Self {
            dx: (rng.r#gen::<f64>() - 0.5) * scale,
            dy: (rng.r#gen::<f64>() - 0.5) * scale,
        }
    }
}
