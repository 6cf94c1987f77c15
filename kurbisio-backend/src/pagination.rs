//! Keyset pagination cursors.
//!
//! The cursor is opaque to clients: base64 over `created_at|leaf_id`, the
//! same tuple listings are ordered by. A page is fetched with
//! `(created_at, leaf_id) > (cursor)` so concurrent inserts never shift
//! already-seen rows.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::NaiveDateTime;
use uuid::Uuid;

/// Response header carrying the cursor for the next page; its absence
/// signals end-of-stream.
pub const NEXT_TOKEN_HEADER: &str = "Pagination-Next-Token";

/// Query parameter the client echoes the cursor back in.
pub const NEXT_TOKEN_PARAM: &str = "next_token";

/// Query parameter engaging pagination.
pub const LIMIT_PARAM: &str = "limit";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: NaiveDateTime,
    pub id: Uuid,
}

impl Cursor {
    pub fn encode(&self) -> String {
        BASE64.encode(format!(
            "{}|{}",
            self.created_at.format(TIMESTAMP_FORMAT),
            self.id
        ))
    }

    /// Decode a client-supplied cursor. Garbage yields `None`; callers
    /// treat that as a bad request.
    pub fn decode(token: &str) -> Option<Self> {
        let raw = BASE64.decode(token).ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let (ts, id) = raw.split_once('|')?;
        let created_at = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()?;
        let id = Uuid::parse_str(id).ok()?;
        Some(Self { created_at, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let cursor = Cursor {
            created_at: chrono::DateTime::from_timestamp(1_700_000_000, 42_000)
                .unwrap()
                .naive_utc(),
            id: Uuid::new_v4(),
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Cursor::decode("not-base64!").is_none());
        assert!(Cursor::decode(&BASE64.encode("no-separator")).is_none());
        assert!(Cursor::decode(&BASE64.encode("2024-01-01T00:00:00.000000|not-a-uuid")).is_none());
    }
}
