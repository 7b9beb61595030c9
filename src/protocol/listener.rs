//! Background receiver for a session.
//!
//! The listener owns nothing but a handle on the transport: it reads datagrams,
//! decodes them and routes each one to the inbox registered under its query
//! identifier. Routing is best-effort; a full inbox or an unknown query drops the
//! message, which the waiting side then observes as a lost datagram.
use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, info, warn};

use super::{Message, SHUTDOWN, Transport};

/// Outcome of handing a message to the inbox table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Delivered,
    InboxFull,
    Unregistered,
}

/// Per-query inboxes, keyed by query identifier.
///
/// This is the only structure shared between caller threads and the listener.
/// Once closed it stays empty: registration is refused under the same lock that
/// closing takes, so no inbox can outlive the close.
#[derive(Debug, Default)]
pub(crate) struct Inboxes {
    map: Mutex<HashMap<String, SyncSender<Message>>>,
    closed: AtomicBool,
}

impl Inboxes {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SyncSender<Message>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a bounded inbox; `None` if the identifier is already taken or
    /// the table is closed.
    pub fn register(&self, query_id: &str, capacity: usize) -> Option<Receiver<Message>> {
        let mut map = self.lock();
        if self.is_closed() || map.contains_key(query_id) {
            return None;
        }
        let (tx, rx) = mpsc::sync_channel(capacity);
        map.insert(query_id.to_string(), tx);
        Some(rx)
    }

    pub fn unregister(&self, query_id: &str) -> bool {
        self.lock().remove(query_id).is_some()
    }

    pub fn is_registered(&self, query_id: &str) -> bool {
        self.lock().contains_key(query_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drops every inbox, waking all waiters with a disconnect, and refuses
    /// further registrations.
    pub fn close(&self) {
        let mut map = self.lock();
        self.closed.store(true, Ordering::Release);
        map.clear();
    }

    pub fn route(&self, message: Message) -> Routed {
        let map = self.lock();
        let Some(inbox) = map.get(&message.query_id) else {
            return Routed::Unregistered;
        };
        match inbox.try_send(message) {
            Ok(()) => Routed::Delivered,
            Err(TrySendError::Full(_)) => Routed::InboxFull,
            Err(TrySendError::Disconnected(_)) => Routed::Unregistered,
        }
    }
}

/// Starts the receiver thread for a session.
pub(crate) fn spawn(
    transport: Arc<dyn Transport>,
    inboxes: Arc<Inboxes>,
    buffer_size: usize,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("sleet-listener".into())
        .spawn(move || listen(transport, inboxes, buffer_size))
}

fn listen(transport: Arc<dyn Transport>, inboxes: Arc<Inboxes>, buffer_size: usize) {
    let mut buf = vec![0; buffer_size];
    info!("listener started on {:?}", transport.local_addr().ok());

    loop {
        let len = match transport.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if is_transient(&e) => {
                warn!("receive failed: {e}");
                continue;
            }
            Err(e) => {
                error!("listener stopping on transport error: {e}");
                // Nothing will be routed any more; waiters must not mistake
                // this for lost datagrams.
                inboxes.close();
                break;
            }
        };

        let datagram = &buf[..len];
        if datagram == SHUTDOWN {
            break;
        }

        match Message::decode(datagram) {
            Ok(message) => {
                let (query_id, seq, kind) =
                    (message.query_id.clone(), message.sequence_number, message.kind());
                match inboxes.route(message) {
                    Routed::Delivered => {}
                    Routed::InboxFull => {
                        debug!("inbox of query '{query_id}' full, dropped {kind:?} #{seq}")
                    }
                    Routed::Unregistered => {
                        debug!("no query '{query_id}' registered, dropped {kind:?} #{seq}")
                    }
                }
            }
            Err(e) => warn!("discarding undecodable datagram ({len} bytes): {e}"),
        }
    }

    // Dropping our handle releases the transport once the session lets go of it.
    drop(transport);
    info!("listener stopped");
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        protocol::{Body, ResponseWithValues},
        testing::LoopbackTransport,
    };

    use super::*;

    fn response(query_id: &str, seq: u32) -> Message {
        Message::new(query_id, seq, Body::NextValuesResponse(ResponseWithValues::end()))
    }

    #[test]
    fn routes_to_registered_inbox_only() {
        let transport = Arc::new(LoopbackTransport::silent());
        let inboxes = Arc::new(Inboxes::default());
        let inbox = inboxes.register("a", 5).unwrap();
        let handle = spawn(transport.clone(), inboxes.clone(), 1024).unwrap();

        transport.inject(&response("b", 2).encode().unwrap());
        transport.inject(&[0xee, 0x01]);
        transport.inject(&response("a", 2).encode().unwrap());

        let got = inbox.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, response("a", 2));
        assert!(inbox.try_recv().is_err());

        transport.inject(&SHUTDOWN);
        handle.join().unwrap();
    }

    #[test]
    fn full_inbox_drops_without_blocking() {
        let inboxes = Inboxes::default();
        let inbox = inboxes.register("a", 1).unwrap();

        assert_eq!(inboxes.route(response("a", 1)), Routed::Delivered);
        assert_eq!(inboxes.route(response("a", 3)), Routed::InboxFull);
        assert_eq!(inbox.try_recv().unwrap().sequence_number, 1);
    }

    #[test]
    fn register_rejects_duplicates() {
        let inboxes = Inboxes::default();
        assert!(inboxes.register("a", 1).is_some());
        assert!(inboxes.register("a", 1).is_none());
        assert!(inboxes.unregister("a"));
        assert_eq!(inboxes.route(response("a", 1)), Routed::Unregistered);
    }

    #[test]
    fn fatal_receive_error_closes_inboxes() {
        let transport = Arc::new(LoopbackTransport::silent());
        let inboxes = Arc::new(Inboxes::default());
        let inbox = inboxes.register("a", 5).unwrap();
        let handle = spawn(transport.clone(), inboxes.clone(), 64).unwrap();

        transport.fail_recv(io::ErrorKind::PermissionDenied);
        handle.join().unwrap();

        assert!(inboxes.is_closed());
        assert!(!inboxes.is_registered("a"));
        assert!(matches!(
            inbox.recv_timeout(Duration::from_secs(1)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        ));
        assert!(inboxes.register("b", 5).is_none());
    }

    #[test]
    fn transient_receive_error_keeps_listening() {
        let transport = Arc::new(LoopbackTransport::silent());
        let inboxes = Arc::new(Inboxes::default());
        let inbox = inboxes.register("a", 5).unwrap();
        let handle = spawn(transport.clone(), inboxes.clone(), 1024).unwrap();

        transport.fail_recv(io::ErrorKind::ConnectionReset);
        transport.inject(&response("a", 2).encode().unwrap());
        assert_eq!(inbox.recv_timeout(Duration::from_secs(2)).unwrap(), response("a", 2));
        assert!(!inboxes.is_closed());

        transport.inject(&SHUTDOWN);
        handle.join().unwrap();
    }

    #[test]
    fn closed_table_refuses_registration() {
        let inboxes = Inboxes::default();
        let inbox = inboxes.register("a", 1).unwrap();

        inboxes.close();
        assert!(inboxes.register("b", 1).is_none());
        assert_eq!(inboxes.route(response("a", 1)), Routed::Unregistered);
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn sentinel_stops_listener_and_releases_transport() {
        let transport = Arc::new(LoopbackTransport::silent());
        let handle = spawn(transport.clone(), Arc::new(Inboxes::default()), 64).unwrap();
        assert_eq!(Arc::strong_count(&transport), 2);

        let own = transport.loopback_addr().unwrap();
        transport.send_to(&SHUTDOWN, own).unwrap();
        handle.join().unwrap();

        assert_eq!(Arc::strong_count(&transport), 1);
    }
}
