//! In-memory transport and scripted servers for unit tests.
use std::{
    io,
    iter::Peekable,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    vec,
};

use crate::{
    protocol::{
        BatchEncoder, Body, ColumnDescriptor, Message, MetaData, ResponseWithValues, StatementType,
        Transport,
    },
    row::Row,
    value::{BincodeCodec, ValueCodec},
};

pub(crate) type Responder = Box<dyn FnMut(&Message) -> Vec<Message> + Send>;

/// One receive: a datagram, or an error the listener observes from `recv`.
type Delivery = Result<Vec<u8>, io::ErrorKind>;

/// A transport whose "server" is a closure: every datagram sent to a foreign
/// address is decoded, recorded and answered by the responder. Datagrams sent to
/// the transport's own address are looped back, like the shutdown sentinel.
pub(crate) struct LoopbackTransport {
    local: SocketAddr,
    tx: Mutex<Sender<Delivery>>,
    rx: Mutex<Receiver<Delivery>>,
    responder: Mutex<Responder>,
    requests: Mutex<Vec<Message>>,
    sends_fail: AtomicBool,
}

pub(crate) fn server_addr() -> SocketAddr {
    "192.0.2.1:7414".parse().unwrap()
}

impl LoopbackTransport {
    pub fn new(responder: impl FnMut(&Message) -> Vec<Message> + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            local: "127.0.0.1:40000".parse().unwrap(),
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            responder: Mutex::new(Box::new(responder)),
            requests: Mutex::new(Vec::new()),
            sends_fail: AtomicBool::new(false),
        }
    }

    /// A server that never answers.
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Delivers a raw datagram to the receiving side.
    pub fn inject(&self, datagram: &[u8]) {
        self.tx.lock().unwrap().send(Ok(datagram.to_vec())).unwrap();
    }

    /// Makes the next `recv` fail with `kind`.
    pub fn fail_recv(&self, kind: io::ErrorKind) {
        self.tx.lock().unwrap().send(Err(kind)).unwrap();
    }

    /// Makes every `send_to`, including loopback, fail while set.
    pub fn fail_sends(&self, fail: bool) {
        self.sends_fail.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<Message> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for LoopbackTransport {
    fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()> {
        if self.sends_fail.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::NetworkUnreachable));
        }
        if target == self.local {
            self.inject(datagram);
            return Ok(());
        }

        let request = Message::decode(datagram).expect("client sent an undecodable datagram");
        self.requests.lock().unwrap().push(request.clone());
        let replies = {
            let mut responder = self.responder.lock().unwrap();
            (responder.as_mut())(&request)
        };
        for reply in replies {
            self.inject(&reply.encode().unwrap());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let datagram = self
            .rx
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?
            .map_err(io::Error::from)?;
        buf[..datagram.len()].copy_from_slice(&datagram);
        Ok(datagram.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// A responder serving a fixed table, split into batches of at most `budget`
/// payload bytes. Every request numbered `n` is answered with `n + 1`.
pub(crate) fn table_server(
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Row>,
    parameter_count: u32,
    budget: usize,
) -> Responder {
    let columns: Arc<[ColumnDescriptor]> = columns.into();
    let codec: Arc<dyn ValueCodec> = Arc::new(BincodeCodec);
    let mut encoder = BatchEncoder::new(columns.clone(), codec);
    let mut pending: Peekable<vec::IntoIter<Row>> = Vec::new().into_iter().peekable();

    Box::new(move |request: &Message| {
        let start = |encoder: &mut BatchEncoder, pending: &mut Peekable<vec::IntoIter<Row>>| {
            encoder.reset();
            *pending = rows.clone().into_iter().peekable();
            encoder.encode(pending, budget).unwrap()
        };

        let body = match &request.body {
            Body::QueryRequest(req) => {
                let values = match req.statement_type {
                    StatementType::Statement => Some(start(&mut encoder, &mut pending)),
                    StatementType::Prepared => None,
                };
                Body::MetaData(MetaData {
                    parameter_count,
                    columns: columns.to_vec(),
                    values,
                })
            }
            Body::ExecuteQueryRequest(_) => {
                Body::ExecuteQueryResponse(start(&mut encoder, &mut pending))
            }
            Body::NextValuesRequest => {
                let batch = if pending.peek().is_some() {
                    encoder.encode(&mut pending, budget).unwrap()
                } else {
                    ResponseWithValues::end()
                };
                Body::NextValuesResponse(batch)
            }
            _ => return Vec::new(),
        };

        vec![Message::new(
            request.query_id.clone(),
            request.sequence_number + 1,
            body,
        )]
    })
}
