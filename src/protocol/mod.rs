//! Datagram session protocol.
//!
//! This module defines the messages exchanged between a sleet client and a query
//! server, how they are framed inside a single datagram, and the machinery that
//! receives datagrams in the background and hands them to the query waiting for
//! them.
//!
//! # Overview
//!
//! The transport is connectionless: datagrams can be lost, duplicated or reordered,
//! and a logical message must fit in one datagram. Reliability is layered on top
//! with two fields carried by every message:
//!
//! - a query identifier, scoping the message to one in-flight query;
//! - a sequence number, assigned by the client and strictly increasing over the
//!   lifetime of the query. A request numbered `n` is answered by a response
//!   numbered `n + 1`.
//!
//! A response is only accepted when its `(query id, sequence number, kind)` triple
//! is exactly the one being awaited; everything else is dropped.
//!
//! # Key Components
//!
//! - [`Message`]: a framed protocol message.
//! - [`Transport`]: abstraction over a datagram socket, implemented for [`UdpSocket`](std::net::UdpSocket).
//! - [`BatchDecoder`] / [`BatchEncoder`]: conversion between row batches and typed rows.
//!
//! # Binary Format
//!
//! ```text
//! +------+----------------+-----------------+------------------+
//! | kind |    query id    | sequence number |  kind payload    |
//! +------+----------------+-----------------+------------------+
//!  1 byte  u64 len + UTF-8       u32            fixed fields
//! ```
//!
//! Everything after the tag byte is bincode with big-endian fixed-width integers;
//! collections are written as a `u64` count followed by the elements.
//!
//! # See Also
//!
//! - [`session`](crate::session): owns the transport and the receiver thread.
use bincode::config::{BigEndian, Configuration, Fixint, Limit};

mod batch;
mod listener;
mod message;
mod transport;

pub use batch::{BatchDecoder, BatchEncoder};
pub use message::{
    Body, ColumnDescriptor, ExecuteQueryRequest, Message, MessageKind, MetaData, Parameter,
    QueryRequest, ResponseWithValues, StatementType,
};
pub use transport::{SHUTDOWN, Transport};

pub(crate) use listener::{Inboxes, spawn};
pub(crate) use transport::bind_for;

/// Largest payload a UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub(crate) type WireConfig = Configuration<BigEndian, Fixint, Limit<MAX_DATAGRAM_SIZE>>;

pub(crate) fn wire_config() -> WireConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_DATAGRAM_SIZE>()
}
