//! Error types shared by the whole driver.
//!
//! Each layer owns a narrow error enum ([`ProtocolError`] for the message codec,
//! [`CodecError`](crate::value::CodecError) for cell values) and everything is
//! funnelled into [`Error`] at the public API.
use std::{io, time::Duration};

use thiserror::Error;

use crate::{protocol::MessageKind, value::CodecError};

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the message codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty datagram")]
    Empty,

    #[error("unknown message type tag '{0:#04x}'")]
    UnknownKind(u8),

    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("{0} trailing bytes after {1:?} message")]
    TrailingBytes(usize, MessageKind),
}

/// Errors surfaced to callers of the driver.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(
        "datagram lost: no {kind:?} #{sequence_number} for query '{query_id}' within {}ms",
        waited.as_millis()
    )]
    DatagramLost {
        query_id: String,
        sequence_number: u32,
        kind: MessageKind,
        waited: Duration,
    },

    #[error("authentication failed: wrong user or password")]
    Authentication,

    #[error("value codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid connection string '{url}': {reason}")]
    Url { url: String, reason: String },

    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),

    #[error("query identifier '{0}' is already registered")]
    DuplicateQuery(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("query is closed")]
    QueryClosed,

    #[error("result cursor is closed")]
    CursorClosed,

    #[error("parameter index {index} out of range (query has {count} parameters)")]
    ParameterIndex { index: usize, count: usize },

    #[error("parameter {0} is not bound")]
    UnboundParameter(usize),

    #[error("unexpected {0:?} message")]
    UnexpectedResponse(MessageKind),
}

impl Error {
    /// True when the error reports a lost datagram, the only failure a caller
    /// may reasonably answer by re-running the query.
    pub fn is_datagram_lost(&self) -> bool {
        matches!(self, Error::DatagramLost { .. })
    }
}
