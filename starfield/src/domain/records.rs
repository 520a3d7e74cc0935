//! Conversions between domain values and store rows.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::Error;
use crate::domain::ports::{Record, Table};

/// Column names shared by services and adapters.
pub mod columns {
    pub const ID: &str = "id";
    pub const HANDLE: &str = "handle";
    pub const X: &str = "x";
    pub const Y: &str = "y";
    pub const ORIGIN_X: &str = "origin_x";
    pub const ORIGIN_Y: &str = "origin_y";
    pub const ONLINE: &str = "online";
    pub const LAST_SEEN: &str = "last_seen";
    pub const OWNER_ID: &str = "owner_id";
    pub const OCCUPANT_COUNT: &str = "occupant_count";
    pub const VISIBILITY: &str = "visibility";
    pub const CREATED_AT: &str = "created_at";
    pub const PARTICIPANT_ID: &str = "participant_id";
    pub const ROOM_ID: &str = "room_id";
    pub const BANNED_ID: &str = "banned_id";
    pub const SENDER_ID: &str = "sender_id";
    pub const RECEIVER_ID: &str = "receiver_id";
    pub const FOLLOWER_ID: &str = "follower_id";
    pub const FOLLOWEE_ID: &str = "followee_id";
}

/// Unwrap a JSON object built with `json!`. Non-objects yield an empty row.
#[must_use]
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// Serialise a value into a row.
pub fn encode<T: Serialize>(table: Table, value: &T) -> Result<Record, Error> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::internal(format!(
            "{table} row must be an object, got {other}"
        ))),
        Err(err) => Err(Error::internal(format!("failed to encode {table} row: {err}"))),
    }
}

/// Deserialise a row.
pub fn decode<T: DeserializeOwned>(table: Table, row: &Record) -> Result<T, Error> {
    serde_json::from_value(Value::Object(row.clone()))
        .map_err(|err| Error::internal(format!("malformed {table} row: {err}")))
}

/// Deserialise every row, logging and skipping malformed ones.
pub fn decode_all<T: DeserializeOwned>(table: Table, rows: &[Record]) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(table, row) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(%table, error = %error, "skipping malformed row");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::domain::{Membership, ParticipantId, RoomId};

    #[rstest]
    fn decode_all_skips_malformed_rows() {
        let good = record(json!({
            "participant_id": ParticipantId::random(),
            "room_id": RoomId::random(),
        }));
        let bad = record(json!({ "participant_id": "not-a-uuid" }));
        let decoded: Vec<Membership> = decode_all(Table::Memberships, &[good, bad]);
        assert_eq!(decoded.len(), 1);
    }

    #[rstest]
    fn encode_rejects_scalars() {
        let err = encode(Table::Rooms, &3).expect_err("scalar is not a row");
        assert_eq!(err.code(), crate::domain::ErrorCode::InternalError);
    }
}
