//! Follow graph and friendship signals.
//!
//! Friendship is derived: two participants are friends when each follows
//! the other. When a follow completes a pair the store records a friendship
//! event, which clients turn into a short-lived glow.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::domain::ports::{Procedure, Record, RemoteStore, Table};
use crate::domain::records::decode;
use crate::domain::{Error, ParticipantId};

/// A mutual friend as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Friend {
    #[serde(rename = "friend_id")]
    pub id: ParticipantId,
    pub handle: String,
}

#[derive(Debug, Deserialize)]
struct FriendshipEventRow {
    first_id: ParticipantId,
    second_id: ParticipantId,
}

#[derive(Debug, Deserialize)]
struct FollowOutcome {
    #[serde(default)]
    mutual: bool,
}

/// Transient visual signal for a newly formed friendship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendshipGlow {
    pub first: ParticipantId,
    pub second: ParticipantId,
    pub expires_at: DateTime<Utc>,
}

impl FriendshipGlow {
    #[must_use]
    pub fn involves(&self, participant: ParticipantId) -> bool {
        self.first == participant || self.second == participant
    }
}

/// Live friendship glows.
#[derive(Debug, Clone)]
pub struct GlowBoard {
    glows: Vec<FriendshipGlow>,
    lifetime: TimeDelta,
}

impl GlowBoard {
    #[must_use]
    pub fn new(lifetime: Duration) -> Self {
        Self {
            glows: Vec::new(),
            lifetime: TimeDelta::from_std(lifetime).unwrap_or_else(|_| TimeDelta::seconds(5)),
        }
    }

    /// Start a glow from a pushed friendship event row.
    pub fn ingest(&mut self, row: &Record, now: DateTime<Utc>) -> Result<FriendshipGlow, Error> {
        let event: FriendshipEventRow = decode(Table::FriendshipEvents, row)?;
        let glow = FriendshipGlow {
            first: event.first_id,
            second: event.second_id,
            expires_at: now + self.lifetime,
        };
        self.glows.retain(|g| {
            !(g.involves(glow.first) && g.involves(glow.second))
        });
        self.glows.push(glow);
        Ok(glow)
    }

    /// Drop expired glows.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.glows.retain(|g| g.expires_at > now);
    }

    #[must_use]
    pub fn active(&self) -> &[FriendshipGlow] {
        &self.glows
    }

    #[must_use]
    pub fn is_glowing(&self, participant: ParticipantId) -> bool {
        self.glows.iter().any(|g| g.involves(participant))
    }

    pub fn clear(&mut self) {
        self.glows.clear();
    }
}

/// Follow and friend lookups.
#[derive(Clone)]
pub struct SocialService<S> {
    store: Arc<S>,
}

impl<S> SocialService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S> SocialService<S>
where
    S: RemoteStore,
{
    /// Follow `target`. Returns whether the follow made the pair mutual.
    pub async fn follow(&self, actor: ParticipantId, target: ParticipantId) -> Result<bool, Error> {
        if actor == target {
            return Err(Error::invalid_request("you cannot follow yourself"));
        }
        let value = self
            .store
            .call_procedure(
                Procedure::Follow,
                json!({ "follower_id": actor, "followee_id": target }),
            )
            .await?;
        let outcome: FollowOutcome = serde_json::from_value(value)
            .map_err(|err| Error::internal(format!("unexpected follow result: {err}")))?;
        Ok(outcome.mutual)
    }

    pub async fn mutual_friends(&self, actor: ParticipantId) -> Result<Vec<Friend>, Error> {
        let value = self
            .store
            .call_procedure(Procedure::MutualFriends, json!({ "participant_id": actor }))
            .await?;
        serde_json::from_value(value)
            .map_err(|err| Error::internal(format!("unexpected friend list: {err}")))
    }
}
