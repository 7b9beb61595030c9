//! Sessions: one transport, one listener thread, many queries.
//!
//! A [`Session`] owns the datagram transport and the receiver thread that routes
//! replies into per-query inboxes. Queries hold a reference-counted handle on the
//! session internals and perform their own bounded waits on their inbox.
use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
    },
    thread::JoinHandle,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, trace, warn};

use crate::{
    cursor::ResultCursor,
    error::{Error, Result},
    options::{ConnectOptions, check_credentials},
    protocol::{
        self, Inboxes, MAX_DATAGRAM_SIZE, Message, MessageKind, SHUTDOWN, StatementType,
        Transport,
    },
    query::{PreparedQuery, QueryCore},
    value::{BincodeCodec, ValueCodec},
};

/// Round-trip timeout estimator of one query.
///
/// The first wait is bounded by a fixed conservative timeout. Every measured round
/// trip then raises the estimate to `rtt + margin` if that is larger, so the
/// estimate never shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveTimeout {
    first: Duration,
    margin: Duration,
    estimate: Option<Duration>,
}

impl AdaptiveTimeout {
    pub fn new(first: Duration, margin: Duration) -> Self {
        Self {
            first,
            margin,
            estimate: None,
        }
    }

    /// Bound for the next wait.
    pub fn current(&self) -> Duration {
        self.estimate.unwrap_or(self.first)
    }

    /// Folds in one successful round trip.
    pub fn observe(&mut self, rtt: Duration) {
        let candidate = rtt.saturating_add(self.margin);
        self.estimate = Some(match self.estimate {
            Some(estimate) => estimate.max(candidate),
            None => candidate,
        });
    }
}

/// State shared by a session, its queries and its shutdown handles.
pub(crate) struct Shared {
    transport: Arc<dyn Transport>,
    inboxes: Arc<Inboxes>,
    server: SocketAddr,
    options: ConnectOptions,
    codec: Arc<dyn ValueCodec>,
    counter: AtomicU64,
    closed: AtomicBool,
    /// Set once the sentinel has actually reached the listener's port.
    stopped: AtomicBool,
    query_timeout: Mutex<Option<Duration>>,
}

impl Shared {
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn codec(&self) -> Arc<dyn ValueCodec> {
        self.codec.clone()
    }

    /// Closed by the caller, or by the listener giving up on the transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.inboxes.is_closed()
    }

    /// Session-wide timeout override, if any.
    pub fn query_timeout(&self) -> Option<Duration> {
        *self
            .query_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_query_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("{millis:x}-{n}")
    }

    /// Registers an inbox under a fresh query identifier.
    pub fn open_query(&self) -> Result<(String, Receiver<Message>)> {
        let query_id = self.next_query_id();
        // Registration and closing serialize on the inbox table, so a close
        // racing with this call either refuses it or disconnects the inbox.
        let inbox = self
            .inboxes
            .register(&query_id, self.options.inbox_capacity)
            .ok_or_else(|| {
                if self.inboxes.is_closed() {
                    Error::SessionClosed
                } else {
                    Error::DuplicateQuery(query_id.clone())
                }
            })?;
        debug!("opened query '{query_id}'");
        Ok((query_id, inbox))
    }

    pub fn close_query(&self, query_id: &str) {
        if self.inboxes.unregister(query_id) {
            debug!("closed query '{query_id}'");
        }
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let datagram = message.encode()?;
        if datagram.len() > self.options.datagram_size {
            warn!(
                "{:?} #{} for query '{}' is {} bytes, above the {} byte datagram size",
                message.kind(),
                message.sequence_number,
                message.query_id,
                datagram.len(),
                self.options.datagram_size
            );
        }
        trace!(
            "sending {:?} #{} for query '{}'",
            message.kind(),
            message.sequence_number,
            message.query_id
        );
        self.transport.send_to(&datagram, self.server)?;
        Ok(())
    }

    /// Waits for the message `(query_id, sequence_number, kind)`.
    ///
    /// Anything else taken from the inbox is discarded. The whole wait, including
    /// discarded messages, is bounded by `timeout`.
    pub fn await_matching(
        &self,
        inbox: &Receiver<Message>,
        query_id: &str,
        sequence_number: u32,
        kind: MessageKind,
        timeout: Duration,
    ) -> Result<Message> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match inbox.recv_timeout(remaining) {
                Ok(message)
                    if message.sequence_number == sequence_number && message.kind() == kind =>
                {
                    return Ok(message);
                }
                Ok(message) => warn!(
                    "query '{query_id}' discarded {:?} #{} while awaiting {kind:?} #{sequence_number}",
                    message.kind(),
                    message.sequence_number
                ),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::DatagramLost {
                        query_id: query_id.to_string(),
                        sequence_number,
                        kind,
                        waited: timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Error::SessionClosed),
            }
        }
    }

    /// Marks the session closed and stops the listener with the sentinel.
    ///
    /// The sentinel is sent again on every call until one send succeeds, so a
    /// failed attempt can be retried through [`Session::close`].
    fn shutdown(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Wakes every waiting query with a disconnect.
            self.inboxes.close();
            info!("session to {} closed", self.server);
        }
        if self.is_stopped() {
            return Ok(());
        }

        let own = self.transport.loopback_addr()?;
        self.transport.send_to(&SHUTDOWN, own)?;
        self.stopped.store(true, Ordering::Release);
        debug!("stop sentinel sent to {own}");
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Stops a session from another thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Shared>);

impl ShutdownHandle {
    pub fn shutdown(&self) -> Result<()> {
        self.0.shutdown()
    }
}

/// A connection to one query server.
pub struct Session {
    shared: Arc<Shared>,
    listener: Option<JoinHandle<()>>,
}

impl Session {
    /// Checks credentials, parses `url` and opens a UDP session.
    ///
    /// # Example
    /// ```rust,no_run
    /// use sleet::{PASSWORD, Session, USER};
    ///
    /// let session = Session::connect("sleet:udp://127.0.0.1:7414", USER, PASSWORD).unwrap();
    /// let mut cursor = session.query("select * from t").unwrap();
    /// while let Some(row) = cursor.next().unwrap() {
    ///     println!("{row}");
    /// }
    /// ```
    pub fn connect(url: &str, user: &str, password: &str) -> Result<Self> {
        check_credentials(user, password)?;
        Self::open(url.parse()?)
    }

    /// Opens a UDP session without the credential check.
    pub fn open(options: ConnectOptions) -> Result<Self> {
        let server = options.server_addr()?;
        let socket = protocol::bind_for(server)?;
        Self::with_transport(Arc::new(socket), server, options)
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        server: SocketAddr,
        options: ConnectOptions,
    ) -> Result<Self> {
        Self::with_codec(transport, server, options, Arc::new(BincodeCodec))
    }

    /// Opens a session over any transport, with a custom value codec.
    pub fn with_codec(
        transport: Arc<dyn Transport>,
        server: SocketAddr,
        options: ConnectOptions,
        codec: Arc<dyn ValueCodec>,
    ) -> Result<Self> {
        options.validate().map_err(|reason| Error::Url {
            url: format!("{}:{}", options.host, options.port),
            reason,
        })?;

        let inboxes = Arc::new(Inboxes::default());
        let listener = protocol::spawn(transport.clone(), inboxes.clone(), MAX_DATAGRAM_SIZE)?;
        info!(
            "session to {server} opened from {:?}",
            transport.local_addr().ok()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                inboxes,
                server,
                options,
                codec,
                counter: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                query_timeout: Mutex::new(None),
            }),
            listener: Some(listener),
        })
    }

    /// Sends `sql` for preparation and returns the prepared query.
    pub fn prepare(&self, sql: &str) -> Result<PreparedQuery> {
        PreparedQuery::prepare(self.shared.clone(), sql)
    }

    /// Runs `sql` once. The cursor owns the query and closes it when the rows run
    /// out, when it is closed or when it is dropped.
    pub fn query(&self, sql: &str) -> Result<ResultCursor<'static>> {
        let (core, first) = QueryCore::open(self.shared.clone(), sql, StatementType::Statement)?;
        ResultCursor::owned(core, first)
    }

    /// Overrides the adaptive timeout of every query of this session.
    pub fn set_query_timeout(&self, timeout: Option<Duration>) {
        *self
            .shared
            .query_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.shared.query_timeout()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shared.clone())
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.shared.options
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.shared.server
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.transport.local_addr()?)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, query_id: &str) -> bool {
        self.shared.inboxes.is_registered(query_id)
    }

    /// Stops the listener and releases its hold on the transport.
    ///
    /// Closing twice is a no-op. If the sentinel cannot be sent the listener is
    /// left running detached and the error is returned; a later close sends the
    /// sentinel again.
    pub fn close(&mut self) -> Result<()> {
        let stopped = self.shared.shutdown();
        let Some(handle) = self.listener.take() else {
            return stopped;
        };

        if !self.shared.is_stopped() && !handle.is_finished() {
            // Joining a listener that never got the sentinel would block forever.
            warn!("listener not stopped, detaching it");
            return stopped;
        }
        if handle.join().is_err() {
            warn!("listener thread panicked");
        }
        stopped
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("error closing session on drop: {e}");
        }
    }
}
