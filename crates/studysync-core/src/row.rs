//! Parse-and-validate boundary for raw backend rows.
//!
//! The row store and change feed deliver untyped JSON. Everything is parsed
//! into strongly-typed records here, at the edge; a row that does not match
//! the expected shape is rejected with a [`ParseError`] and the caller skips
//! and logs it rather than aborting the whole page or feed batch.

use serde_json::Value;
use thiserror::Error;

use crate::types::{DraftMessage, Message, Profile};

/// A backend row did not match the expected record shape.
#[derive(Debug, Error)]
#[error("malformed {record} row: {source}")]
pub struct ParseError {
    /// Record kind that failed to parse.
    pub record: &'static str,
    /// Underlying deserialization failure.
    #[source]
    pub source: serde_json::Error,
}

fn parse<T: serde::de::DeserializeOwned>(
    record: &'static str,
    row: &Value,
) -> Result<T, ParseError> {
    serde_json::from_value(row.clone()).map_err(|source| ParseError { record, source })
}

/// Parse a joined message row (author snapshot embedded as `author`).
///
/// This is the shape the paginated history query returns.
pub fn message_from_row(row: &Value) -> Result<Message, ParseError> {
    parse("message", row)
}

/// Parse a flat message row (author by `author_id` only).
///
/// This is the shape insert confirmations and change-feed payloads carry;
/// the author snapshot is resolved separately.
pub fn draft_from_row(row: &Value) -> Result<DraftMessage, ParseError> {
    parse("draft message", row)
}

/// Parse a profile row.
pub fn profile_from_row(row: &Value) -> Result<Profile, ParseError> {
    parse("profile", row)
}
