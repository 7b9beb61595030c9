//! Connection options.
//!
//! A session is described by a connection string of the form
//!
//! ```text
//! sleet:udp://<host>:<port>[/<database>][;key=value]*
//! ```
//!
//! Recognized keys are `datagramSize` (bytes), `timeout` (base timeout in ms),
//! `timeoutMargin` (ms), `sequenceGap` and `inboxCapacity`. Unknown keys are
//! ignored with a warning.
//!
//! # Example
//! ```rust
//! use sleet::ConnectOptions;
//!
//! let options: ConnectOptions = "sleet:udp://127.0.0.1:7414;datagramSize=1200".parse().unwrap();
//! assert_eq!(options.port, 7414);
//! assert_eq!(options.datagram_size, 1200);
//! ```
use std::{
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};

use log::warn;

use crate::{
    error::{Error, Result},
    protocol::MAX_DATAGRAM_SIZE,
};

pub const URL_PREFIX: &str = "sleet:udp://";

/// The only account accepted by [`Session::connect`](crate::Session::connect).
pub const USER: &str = "sleet";
pub const PASSWORD: &str = "passw0rd";

pub const DEFAULT_DATAGRAM_SIZE: usize = 1450;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_TIMEOUT_MARGIN: Duration = Duration::from_millis(1000);
pub const DEFAULT_SEQUENCE_GAP: u32 = 5;
pub const DEFAULT_INBOX_CAPACITY: usize = 5;

/// Smallest sequence gap that cannot collide with a pipelined fetch.
///
/// At most one NextValuesRequest is in flight per query: if the last accepted
/// response is `s`, the outstanding request is `s + 1` and its answer `s + 2`.
/// A jump to `s + g` awaits `s + g + 1`, disjoint from both when `g >= 2`.
pub const MIN_SEQUENCE_GAP: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    /// Largest datagram the session should send; bigger messages are logged.
    pub datagram_size: usize,
    /// Bound on the first round trip of every query.
    pub first_timeout: Duration,
    /// Added to measured round trips to form the adaptive timeout.
    pub timeout_margin: Duration,
    /// Sequence number jump used on re-execution and close.
    pub sequence_gap: u32,
    pub inbox_capacity: usize,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            database: None,
            datagram_size: DEFAULT_DATAGRAM_SIZE,
            first_timeout: DEFAULT_TIMEOUT,
            timeout_margin: DEFAULT_TIMEOUT_MARGIN,
            sequence_gap: DEFAULT_SEQUENCE_GAP,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    pub fn datagram_size(mut self, bytes: usize) -> Self {
        self.datagram_size = bytes;
        self
    }

    pub fn first_timeout(mut self, timeout: Duration) -> Self {
        self.first_timeout = timeout;
        self
    }

    pub fn timeout_margin(mut self, margin: Duration) -> Self {
        self.timeout_margin = margin;
        self
    }

    pub fn sequence_gap(mut self, gap: u32) -> Self {
        self.sequence_gap = gap;
        self
    }

    pub fn inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    /// Checks value ranges, returning the reason of the first violation.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.datagram_size == 0 || self.datagram_size > MAX_DATAGRAM_SIZE {
            return Err(format!(
                "datagramSize must be within 1..={MAX_DATAGRAM_SIZE}, got {}",
                self.datagram_size
            ));
        }
        if self.sequence_gap < MIN_SEQUENCE_GAP {
            return Err(format!(
                "sequenceGap must be at least {MIN_SEQUENCE_GAP}, got {}",
                self.sequence_gap
            ));
        }
        if self.inbox_capacity == 0 {
            return Err("inboxCapacity must be at least 1".into());
        }
        if self.first_timeout.is_zero() {
            return Err("timeout must be positive".into());
        }
        Ok(())
    }

    /// Resolves the server address.
    pub fn server_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Url {
                url: format!("{}:{}", self.host, self.port),
                reason: "host did not resolve to any address".into(),
            })
    }

    fn set(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        let number = |value: &str| {
            value
                .parse::<u64>()
                .map_err(|_| format!("'{key}' expects a non-negative integer, got '{value}'"))
        };

        match key {
            "datagramSize" => self.datagram_size = number(value)? as usize,
            "timeout" => self.first_timeout = Duration::from_millis(number(value)?),
            "timeoutMargin" => self.timeout_margin = Duration::from_millis(number(value)?),
            "sequenceGap" => {
                self.sequence_gap = u32::try_from(number(value)?)
                    .map_err(|_| format!("'{key}' is out of range"))?
            }
            "inboxCapacity" => self.inbox_capacity = number(value)? as usize,
            _ => warn!("ignoring unknown connection parameter '{key}'"),
        }
        Ok(())
    }
}

impl FromStr for ConnectOptions {
    type Err = Error;

    fn from_str(url: &str) -> Result<Self> {
        let invalid = |reason: String| Error::Url {
            url: url.to_string(),
            reason,
        };

        let rest = url
            .strip_prefix(URL_PREFIX)
            .ok_or_else(|| invalid(format!("expected '{URL_PREFIX}' prefix")))?;

        let mut parts = rest.split(';');
        let location = parts.next().unwrap_or_default();
        let (authority, database) = match location.split_once('/') {
            Some((authority, db)) if !db.is_empty() => (authority, Some(db.to_string())),
            Some((authority, _)) => (authority, None),
            None => (location, None),
        };

        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected '<host>:<port>'".into()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host".into()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| invalid(format!("invalid port '{port}'")))?;

        let mut options = ConnectOptions::new(host, port);
        options.database = database;

        for param in parts.filter(|p| !p.is_empty()) {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected key=value, got '{param}'")))?;
            options.set(key.trim(), value.trim()).map_err(&invalid)?;
        }

        options.validate().map_err(invalid)?;
        Ok(options)
    }
}

/// Gate applied before any socket is opened.
pub fn check_credentials(user: &str, password: &str) -> Result<()> {
    if user == USER && password == PASSWORD {
        Ok(())
    } else {
        Err(Error::Authentication)
    }
}
