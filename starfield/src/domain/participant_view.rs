//! Local view of every known participant.
//!
//! Rows are keyed by participant id. A row without an id falls back to a
//! match on the lower-cased handle, which only exists for older rows that
//! predate stable ids. Remote values win on conflict. The one exception is
//! an echo of a position the local participant wrote itself: by the time it
//! arrives the participant has usually drifted on, so it is ignored. Any
//! other remote position for the local participant, such as a reset issued
//! by another client, replaces the local one and becomes the new drift base.

use std::collections::VecDeque;

use crate::domain::{Participant, ParticipantId, ParticipantRow, ParticipantValidationError, Position};

/// Own position writes remembered for echo suppression.
const REMEMBERED_WRITES: usize = 64;

/// What an upsert did to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChange {
    Inserted,
    Updated,
}

/// Ordered list of participants, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticipantView {
    participants: Vec<Participant>,
    local: Option<ParticipantId>,
    written: VecDeque<Position>,
}

impl ParticipantView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or clear) the participant whose position is driven locally.
    /// Remembered writes belong to the previous participant and are dropped.
    pub fn set_local(&mut self, local: Option<ParticipantId>) {
        self.local = local;
        self.written.clear();
    }

    /// Remember a position the local participant persisted, so its echo is
    /// not mistaken for a remote move.
    pub fn remember_write(&mut self, position: Position) {
        if self.written.len() == REMEMBERED_WRITES {
            self.written.pop_front();
        }
        self.written.push_back(position);
    }

    fn is_own_echo(&self, row: &ParticipantRow) -> bool {
        let (Some(x), Some(y)) = (row.x, row.y) else {
            return false;
        };
        Position::new(x, y).is_ok_and(|position| self.written.contains(&position))
    }

    #[must_use]
    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local
    }

    #[must_use]
    pub fn local(&self) -> Option<&Participant> {
        self.local.and_then(|id| self.get(id))
    }

    #[must_use]
    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    #[must_use]
    pub fn all(&self) -> &[Participant] {
        &self.participants
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Merge a pushed or fetched row into the view.
    pub fn upsert_row(&mut self, row: &ParticipantRow) -> Result<ViewChange, ParticipantValidationError> {
        let index = match row.id {
            Some(id) => self.participants.iter().position(|p| p.id == id),
            None => {
                let key = row.handle_key();
                self.participants
                    .iter()
                    .position(|p| key.as_deref() == Some(p.handle.as_ref()))
            }
        };

        match index {
            Some(index) => {
                let Some(existing_id) = self.participants.get(index).map(|p| p.id) else {
                    return Err(ParticipantValidationError::MissingField { field: "id" });
                };
                let row = if Some(existing_id) == self.local && self.is_own_echo(row) {
                    without_position(row)
                } else {
                    row.clone()
                };
                let Some(existing) = self.participants.get_mut(index) else {
                    return Err(ParticipantValidationError::MissingField { field: "id" });
                };
                existing.merge(&row)?;
                Ok(ViewChange::Updated)
            }
            None => {
                self.participants.push(Participant::from_row(row)?);
                Ok(ViewChange::Inserted)
            }
        }
    }

    /// Insert or replace a participant wholesale.
    pub fn insert(&mut self, participant: Participant) {
        match self.participants.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => self.participants.push(participant),
        }
    }

    pub fn remove(&mut self, id: ParticipantId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.id != id);
        self.participants.len() != before
    }

    /// Replace the view with a full fetch. Malformed rows are skipped and
    /// reported; the local participant keeps its own position unless the
    /// fetched one was written by someone else.
    pub fn replace_all(&mut self, rows: &[ParticipantRow]) -> Vec<ParticipantValidationError> {
        let previous_local = self.local().cloned();
        let mut errors = Vec::new();
        let mut next = Vec::with_capacity(rows.len());
        for row in rows {
            match Participant::from_row(row) {
                Ok(mut participant) => {
                    if let Some(local) = previous_local.as_ref().filter(|l| l.id == participant.id)
                        && self.is_own_echo(row)
                    {
                        participant.position = local.position;
                    }
                    next.push(participant);
                }
                Err(error) => errors.push(error),
            }
        }
        if let Some(local) = previous_local {
            if !next.iter().any(|p| p.id == local.id) {
                next.push(local);
            }
        }
        self.participants = next;
        errors
    }

    /// Optimistically move the local participant.
    pub fn set_local_position(&mut self, position: Position) -> bool {
        let Some(local) = self.local else {
            return false;
        };
        match self.participants.iter_mut().find(|p| p.id == local) {
            Some(participant) => {
                participant.position = position;
                true
            }
            None => false,
        }
    }

    pub fn set_online(&mut self, id: ParticipantId, online: bool) -> bool {
        match self.participants.iter_mut().find(|p| p.id == id) {
            Some(participant) => {
                participant.online = online;
                true
            }
            None => false,
        }
    }

    /// Handles of online participants other than the local one.
    pub fn online_others(&self) -> impl Iterator<Item = &Participant> {
        self.participants
            .iter()
            .filter(move |p| p.online && Some(p.id) != self.local)
    }
}

fn without_position(row: &ParticipantRow) -> ParticipantRow {
    ParticipantRow {
        x: None,
        y: None,
        ..row.clone()
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use rstest::{fixture, rstest};

    use super::*;

    fn row(id: ParticipantId, handle: &str, x: f64) -> ParticipantRow {
        ParticipantRow {
            id: Some(id),
            handle: Some(handle.to_owned()),
            x: Some(x),
            y: Some(0.5),
            online: Some(true),
            ..ParticipantRow::default()
        }
    }

    #[fixture]
    fn view() -> ParticipantView {
        ParticipantView::new()
    }

    #[rstest]
    fn duplicate_insert_yields_single_entry(mut view: ParticipantView) {
        let id = ParticipantId::random();
        let pushed = row(id, "vega", 0.3);
        assert_eq!(view.upsert_row(&pushed), Ok(ViewChange::Inserted));
        let once = view.clone();
        assert_eq!(view.upsert_row(&pushed), Ok(ViewChange::Updated));
        assert_eq!(view, once);
        assert_eq!(view.len(), 1);
    }

    #[rstest]
    fn remote_values_win_for_others(mut view: ParticipantView) {
        let id = ParticipantId::random();
        view.upsert_row(&row(id, "vega", 0.3)).expect("insert");
        view.upsert_row(&row(id, "vega", 0.7)).expect("update");
        let stored = view.get(id).expect("present");
        assert!((stored.position.x() - 0.7).abs() < f64::EPSILON);
    }

    fn at(x: f64) -> Position {
        Position::new(x, 0.5).expect("valid position")
    }

    #[rstest]
    fn echo_of_own_write_keeps_local_position(mut view: ParticipantView) {
        let id = ParticipantId::random();
        view.upsert_row(&row(id, "me", 0.3)).expect("insert");
        view.set_local(Some(id));
        view.remember_write(at(0.35));
        view.set_local_position(at(0.4));

        let mut echo = row(id, "me", 0.35);
        echo.online = Some(false);
        view.upsert_row(&echo).expect("update");
        let stored = view.get(id).expect("present");
        assert_eq!(stored.position, at(0.4));
        assert!(!stored.online);
    }

    #[rstest]
    fn foreign_write_moves_local_participant(mut view: ParticipantView) {
        let id = ParticipantId::random();
        view.upsert_row(&row(id, "me", 0.3)).expect("insert");
        view.set_local(Some(id));
        view.remember_write(at(0.4));
        view.set_local_position(at(0.4));

        view.upsert_row(&row(id, "me", 0.2)).expect("reset from elsewhere");
        assert_eq!(view.local().expect("local").position, at(0.2));
    }

    #[rstest]
    fn changing_local_participant_forgets_writes(mut view: ParticipantView) {
        let id = ParticipantId::random();
        view.upsert_row(&row(id, "me", 0.3)).expect("insert");
        view.set_local(Some(id));
        view.remember_write(at(0.6));
        view.set_local(Some(id));

        view.upsert_row(&row(id, "me", 0.6)).expect("update");
        assert_eq!(view.local().expect("local").position, at(0.6));
    }

    #[rstest]
    fn rows_without_id_match_by_lowercased_handle(mut view: ParticipantView) {
        let id = ParticipantId::random();
        view.upsert_row(&row(id, "vega", 0.3)).expect("insert");
        let legacy = ParticipantRow {
            handle: Some("VEGA".to_owned()),
            online: Some(false),
            ..ParticipantRow::default()
        };
        assert_eq!(view.upsert_row(&legacy), Ok(ViewChange::Updated));
        assert!(!view.get(id).expect("present").online);
    }

    #[rstest]
    fn unknown_rows_without_id_are_rejected(mut view: ParticipantView) {
        let legacy = ParticipantRow {
            handle: Some("ghost".to_owned()),
            ..ParticipantRow::default()
        };
        assert!(view.upsert_row(&legacy).is_err());
        assert!(view.is_empty());
    }

    #[rstest]
    fn replace_all_keeps_local_participant(mut view: ParticipantView) {
        let me = ParticipantId::random();
        let other = ParticipantId::random();
        view.upsert_row(&row(me, "me", 0.3)).expect("insert");
        view.set_local(Some(me));
        view.remember_write(at(0.8));

        let errors = view.replace_all(&[row(other, "other", 0.1), row(me, "me", 0.8)]);
        assert!(errors.is_empty());
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(me).expect("local").position, at(0.3));

        view.replace_all(&[row(other, "other", 0.2), row(me, "me", 0.15)]);
        assert_eq!(view.get(me).expect("local").position, at(0.15));

        view.replace_all(&[row(other, "other", 0.2)]);
        assert!(view.get(me).is_some());
    }

    #[rstest]
    fn online_others_excludes_self_and_offline(mut view: ParticipantView) {
        let me = ParticipantId::random();
        let away = ParticipantId::random();
        let here = ParticipantId::random();
        view.upsert_row(&row(me, "me", 0.3)).expect("insert");
        view.upsert_row(&row(away, "away", 0.3)).expect("insert");
        view.upsert_row(&row(here, "here", 0.3)).expect("insert");
        view.set_local(Some(me));
        view.set_online(away, false);
        let ids: Vec<_> = view.online_others().map(|p| p.id).collect();
        assert_eq!(ids, vec![here]);
    }
}
