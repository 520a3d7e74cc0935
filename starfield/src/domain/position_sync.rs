//! Position synchronisation for the local participant.
//!
//! Ticks move the local participant optimistically and persist the result
//! with a write nobody awaits. Each write reports back through an outcome
//! channel drained by the owning event loop, which keeps the latest failure
//! observable through [`PositionSynchronizer::last_sync_error`]. Failed writes
//! are never rolled back; the next tick writes a newer position anyway.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::participant_view::ViewChange;
use crate::domain::ports::{Filter, Procedure, RemoteStore, RemoteStoreError, Table};
use crate::domain::records::{columns, decode, record};
use crate::domain::{
    DriftVector, Error, ParticipantId, ParticipantRow, ParticipantValidationError,
    ParticipantView, Position, Session,
};

/// Result of one background position write.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Session generation the write was issued under.
    pub generation: u64,
    pub participant: ParticipantId,
    pub position: Position,
    pub result: Result<(), RemoteStoreError>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveSession {
    participant: ParticipantId,
    drift: DriftVector,
}

/// Drives the local participant's drift and merges remote positions.
pub struct PositionSynchronizer<S> {
    store: Arc<S>,
    drift_scale: f64,
    outcomes: mpsc::UnboundedSender<SyncOutcome>,
    session: Option<ActiveSession>,
    generation: u64,
    last_sync_error: Option<Error>,
}

impl<S> PositionSynchronizer<S> {
    pub fn new(
        store: Arc<S>,
        drift_scale: f64,
        outcomes: mpsc::UnboundedSender<SyncOutcome>,
    ) -> Self {
        Self {
            store,
            drift_scale,
            outcomes,
            session: None,
            generation: 0,
            last_sync_error: None,
        }
    }

    /// Start drifting for a new session. Outcomes of writes issued under an
    /// earlier session are discarded from now on.
    pub fn begin_session(&mut self, session: &Session) {
        self.generation = self.generation.wrapping_add(1);
        let drift = DriftVector::for_session(session.participant_id, session.started_at, self.drift_scale);
        debug!(participant = %session.participant_id, dx = drift.dx, dy = drift.dy, "drift assigned");
        self.session = Some(ActiveSession {
            participant: session.participant_id,
            drift,
        });
        self.last_sync_error = None;
    }

    /// Stop drifting. In-flight writes may still land remotely but their
    /// outcomes are ignored.
    pub fn end_session(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.session = None;
    }

    #[must_use]
    pub fn drift(&self) -> Option<DriftVector> {
        self.session.map(|s| s.drift)
    }

    /// Replace the drift vector of the active session.
    pub fn set_drift(&mut self, drift: DriftVector) {
        if let Some(session) = self.session.as_mut() {
            session.drift = drift;
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Most recent background write failure, cleared by the next success.
    #[must_use]
    pub fn last_sync_error(&self) -> Option<&Error> {
        self.last_sync_error.as_ref()
    }

    /// Apply a write outcome. Returns `false` when the outcome belongs to an
    /// ended session and was dropped.
    pub fn record_outcome(&mut self, outcome: SyncOutcome) -> bool {
        if outcome.generation != self.generation {
            debug!(
                participant = %outcome.participant,
                generation = outcome.generation,
                "discarding position write outcome from ended session"
            );
            return false;
        }
        match outcome.result {
            Ok(()) => self.last_sync_error = None,
            Err(error) => {
                warn!(participant = %outcome.participant, error = %error, "position write failed");
                self.last_sync_error = Some(Error::from(error));
            }
        }
        true
    }

    /// Merge a pushed participant row into the view.
    pub fn on_remote_change(
        &self,
        row: &ParticipantRow,
        view: &mut ParticipantView,
    ) -> Result<ViewChange, ParticipantValidationError> {
        view.upsert_row(row)
    }
}

impl<S> PositionSynchronizer<S>
where
    S: RemoteStore + 'static,
{
    /// Restore the participant's origin, assigning and persisting a fresh one
    /// on first sign-in. The local view is moved to the origin.
    pub async fn initialize_position(
        &self,
        participant: ParticipantId,
        view: &mut ParticipantView,
    ) -> Result<Position, Error> {
        let rows = self
            .store
            .select_where(
                Table::Participants,
                &Filter::all().column_eq(columns::ID, participant),
                None,
            )
            .await?;
        let stored: Option<ParticipantRow> = rows
            .first()
            .map(|row| decode(Table::Participants, row))
            .transpose()?;
        let existing = stored.as_ref().and_then(stored_origin);

        let origin = match existing {
            Some(origin) => origin,
            None => {
                let mut rng = SmallRng::from_entropy();
                Position::random_origin(&mut rng)
            }
        };

        let mut values = record(json!({
            "id": participant,
            "x": origin.x(),
            "y": origin.y(),
        }));
        if stored.as_ref().is_none_or(|row| row.origin_x.is_none() || row.origin_y.is_none()) {
            values.insert(columns::ORIGIN_X.to_owned(), json!(origin.x()));
            values.insert(columns::ORIGIN_Y.to_owned(), json!(origin.y()));
            debug!(%participant, x = origin.x(), y = origin.y(), "origin assigned");
        }
        self.store
            .upsert_row(Table::Participants, &[columns::ID], values)
            .await?;

        if let Some(mut local) = view.get(participant).cloned() {
            local.position = origin;
            local.origin = Some(origin);
            view.insert(local);
        }
        Ok(origin)
    }

    /// Advance the local participant by one drift step.
    ///
    /// Returns the new position, or `None` when there is no active session
    /// or the local participant is unknown or offline.
    pub fn tick(&mut self, view: &mut ParticipantView) -> Option<Position> {
        let session = self.session?;
        let local = view.get(session.participant)?;
        if !local.online {
            return None;
        }
        let next = local.position.drifted(session.drift);
        view.set_local_position(next);
        view.remember_write(next);

        let store = Arc::clone(&self.store);
        let outcomes = self.outcomes.clone();
        let generation = self.generation;
        let participant = session.participant;
        tokio::spawn(async move {
            let args = json!({ "participant_id": participant, "x": next.x(), "y": next.y() });
            let result = store
                .call_procedure(Procedure::UpdatePosition, args)
                .await
                .map(|_| ());
            let outcome = SyncOutcome {
                generation,
                participant,
                position: next,
                result,
            };
            if outcomes.send(outcome).is_err() {
                debug!(%participant, "position outcome dropped after teardown");
            }
        });
        Some(next)
    }

    /// Move every participant back to its origin.
    pub async fn reset_positions(&self, view: &mut ParticipantView) -> Result<(), Error> {
        self.store
            .call_procedure(Procedure::ResetPositions, json!({}))
            .await?;
        if let Some(origin) = view.local().and_then(|local| local.origin) {
            view.set_local_position(origin);
        }
        Ok(())
    }
}

fn stored_origin(row: &ParticipantRow) -> Option<Position> {
    let (x, y) = match (row.origin_x, row.origin_y) {
        (Some(x), Some(y)) => (x, y),
        _ => (row.x?, row.y?),
    };
    Position::new(x, y).ok()
}

#[cfg(test)]
#[path = "position_sync_tests.rs"]
mod tests;
