//! Streaming access to the rows of an executed query.
use std::ops::{Deref, DerefMut};

use log::{debug, warn};

use crate::{
    error::{Error, Result},
    protocol::{BatchDecoder, ColumnDescriptor, ResponseWithValues},
    query::QueryCore,
    row::Row,
};

/// The query a cursor reads from: borrowed from a [`PreparedQuery`](crate::PreparedQuery)
/// or owned by a one-shot statement.
enum Handle<'q> {
    Borrowed(&'q mut QueryCore),
    Owned(Box<QueryCore>),
}

impl Deref for Handle<'_> {
    type Target = QueryCore;

    fn deref(&self) -> &Self::Target {
        match self {
            Handle::Borrowed(core) => core,
            Handle::Owned(core) => core,
        }
    }
}

impl DerefMut for Handle<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Handle::Borrowed(core) => core,
            Handle::Owned(core) => core,
        }
    }
}

/// Rows of one value stream, decoded batch by batch.
///
/// As soon as a batch that is not the last one is accepted, the request for the
/// following batch is sent, so it travels while the caller works through the
/// current rows.
pub struct ResultCursor<'q> {
    query: Handle<'q>,
    decoder: BatchDecoder,
    row: Row,
    finished: bool,
    closed: bool,
}

impl<'q> ResultCursor<'q> {
    pub(crate) fn borrowed(query: &'q mut QueryCore, first: ResponseWithValues) -> Result<Self> {
        Self::new(Handle::Borrowed(query), first)
    }

    fn new(query: Handle<'q>, first: ResponseWithValues) -> Result<Self> {
        let decoder = BatchDecoder::new(query.columns().clone(), query.codec());
        let mut cursor = Self {
            query,
            decoder,
            row: Row::default(),
            finished: false,
            closed: false,
        };
        cursor.accept(first, true)?;
        Ok(cursor)
    }

    fn accept(&mut self, batch: ResponseWithValues, fresh: bool) -> Result<()> {
        let is_last = batch.is_last;
        debug!(
            "query '{}' accepted batch of {} rows (last: {is_last})",
            self.query.query_id(),
            batch.row_count
        );

        if fresh {
            self.decoder.start(batch);
        } else {
            self.decoder.push(batch);
        }
        if !is_last {
            self.query.request_next()?;
        }
        Ok(())
    }

    /// Moves to the next row, fetching batches as needed.
    fn advance(&mut self) -> Result<bool> {
        loop {
            if self.finished {
                return Ok(false);
            }
            if self.decoder.decode_row(&mut self.row)? {
                return Ok(true);
            }
            if self.decoder.is_last() {
                self.finish();
                return Ok(false);
            }
            let batch = self.query.await_next()?;
            self.accept(batch, false)?;
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Handle::Owned(core) = &mut self.query
            && let Err(e) = core.close()
        {
            warn!("failed to close query '{}': {e}", core.query_id());
        }
    }

    /// Returns the next row, or `None` once the stream has ended.
    ///
    /// The returned row is overwritten by the following call.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<&Row>> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        Ok(self.advance()?.then_some(&self.row))
    }

    /// Drains the remaining rows.
    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next()? {
            rows.push(row.clone());
        }
        Ok(rows)
    }

    pub fn metadata(&self) -> &[ColumnDescriptor] {
        self.query.columns()
    }

    pub fn query_id(&self) -> &str {
        self.query.query_id()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stops reading. A one-shot statement is closed on the server as well.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.finished = true;
        match &mut self.query {
            Handle::Owned(core) => core.close(),
            Handle::Borrowed(_) => Ok(()),
        }
    }
}

impl ResultCursor<'static> {
    pub(crate) fn owned(query: QueryCore, first: Option<ResponseWithValues>) -> Result<Self> {
        let first = first.unwrap_or_else(|| {
            warn!("no rows sent with statement '{}'", query.query_id());
            ResponseWithValues::end()
        });
        Self::new(Handle::Owned(Box::new(query)), first)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::UdpSocket,
        sync::Arc,
        thread,
        time::Duration,
    };

    use crate::{
        ConnectOptions, Session,
        protocol::{Body, Message, MessageKind, MetaData},
        session::tests::{session_with, test_options},
        testing::{LoopbackTransport, Responder, table_server},
        value::{BincodeCodec, SqlType, Value, ValueCodec},
    };

    use super::*;

    fn two_columns() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::new("ID", SqlType::Integer),
            ColumnDescriptor::new("NAME", SqlType::Varchar),
        ]
    }

    fn table(n: i32) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let name = if i % 3 == 1 { Value::Null } else { Value::Text(format!("row{i}")) };
                Row::new(vec![Value::Integer(i), name])
            })
            .collect()
    }

    fn kinds(transport: &LoopbackTransport) -> Vec<MessageKind> {
        transport.requests().iter().map(Message::kind).collect()
    }

    /// Replies to the prepare and execute with the same fixed batch.
    fn canned(batch: ResponseWithValues) -> Responder {
        Box::new(move |request: &Message| {
            let body = match request.body {
                Body::QueryRequest(_) => Body::MetaData(MetaData {
                    parameter_count: 0,
                    columns: two_columns(),
                    values: None,
                }),
                Body::ExecuteQueryRequest(_) => Body::ExecuteQueryResponse(batch.clone()),
                _ => return Vec::new(),
            };
            vec![Message::new(
                request.query_id.clone(),
                request.sequence_number + 1,
                body,
            )]
        })
    }

    #[test]
    fn three_rows_with_one_null() {
        let mut payload = Vec::new();
        for (t, v) in [
            (SqlType::Integer, Value::Integer(1)),
            (SqlType::Integer, Value::Integer(2)),
            (SqlType::Varchar, Value::Text("b".into())),
            (SqlType::Integer, Value::Integer(3)),
            (SqlType::Varchar, Value::Text("c".into())),
        ] {
            BincodeCodec.encode(t, &v, &mut payload).unwrap();
        }
        let batch = ResponseWithValues {
            is_last: true,
            row_count: 3,
            null_indices: vec![1],
            payload,
        };

        let transport = Arc::new(LoopbackTransport::new(canned(batch)));
        let session = session_with(&transport, test_options());
        let mut query = session.prepare("select * from t").unwrap();
        let mut cursor = query.execute().unwrap();

        let first = cursor.next().unwrap().unwrap().clone();
        assert_eq!(first, Row::new(vec![Value::Integer(1), Value::Null]));
        assert_eq!(cursor.next().unwrap().unwrap()[1], Value::Text("b".into()));
        assert_eq!(cursor.next().unwrap().unwrap()[0], Value::Integer(3));
        assert!(cursor.next().unwrap().is_none());
        assert!(cursor.next().unwrap().is_none());
        assert!(cursor.is_finished());

        // Last batch: nothing was pipelined.
        assert!(!kinds(&transport).contains(&MessageKind::NextValuesRequest));
    }

    #[test]
    fn next_batch_is_requested_before_it_is_needed() {
        let transport = Arc::new(LoopbackTransport::new(table_server(two_columns(), table(5), 0, 24)));
        let session = session_with(&transport, test_options());
        let mut query = session.prepare("select * from t").unwrap();
        let mut cursor = query.execute().unwrap();

        // Only the first batch has been accepted, yet the second is on its way.
        assert_eq!(
            kinds(&transport),
            vec![
                MessageKind::QueryRequest,
                MessageKind::ExecuteQueryRequest,
                MessageKind::NextValuesRequest
            ]
        );

        assert_eq!(cursor.fetch_all().unwrap(), table(5));
        let fetches = kinds(&transport)
            .into_iter()
            .filter(|k| *k == MessageKind::NextValuesRequest)
            .count();
        assert!(fetches >= 2);
    }

    #[test]
    fn one_shot_statement_closes_when_exhausted() {
        let transport = Arc::new(LoopbackTransport::new(table_server(two_columns(), table(4), 0, 24)));
        let session = session_with(&transport, test_options());

        let mut cursor = session.query("select * from t").unwrap();
        let query_id = cursor.query_id().to_string();
        assert_eq!(cursor.fetch_all().unwrap(), table(4));

        let requests = transport.requests();
        let last = requests.last().unwrap();
        assert_eq!(last.kind(), MessageKind::CloseRequest);
        assert!(!session.is_registered(&query_id));

        cursor.close().unwrap();
        drop(cursor);
        assert_eq!(transport.requests().len(), requests.len());
    }

    #[test]
    fn close_is_idempotent() {
        let transport = Arc::new(LoopbackTransport::new(table_server(two_columns(), table(4), 0, 24)));
        let session = session_with(&transport, test_options());

        let mut cursor = session.query("select * from t").unwrap();
        assert!(cursor.next().unwrap().is_some());
        cursor.close().unwrap();
        cursor.close().unwrap();
        drop(cursor);

        let closes = kinds(&transport)
            .into_iter()
            .filter(|k| *k == MessageKind::CloseRequest)
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn next_after_close_fails() {
        let transport = Arc::new(LoopbackTransport::new(table_server(two_columns(), table(2), 0, 512)));
        let session = session_with(&transport, test_options());
        let mut query = session.prepare("select * from t").unwrap();

        let mut cursor = query.execute().unwrap();
        cursor.close().unwrap();
        assert!(matches!(cursor.next(), Err(Error::CursorClosed)));
    }

    #[test]
    fn lost_batch_surfaces_as_datagram_lost() {
        let mut server = table_server(two_columns(), table(4), 0, 24);
        let transport = Arc::new(LoopbackTransport::new(move |request: &Message| {
            match request.body {
                Body::NextValuesRequest => Vec::new(),
                _ => server(request),
            }
        }));
        let options = test_options().timeout_margin(Duration::from_millis(50));
        let session = session_with(&transport, options);

        let mut cursor = session.query("select * from t").unwrap();
        assert!(cursor.next().unwrap().is_some());
        let err = cursor.next().unwrap_err();
        assert!(err.is_datagram_lost(), "{err}");
    }

    #[test]
    fn end_to_end_over_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let mut respond = table_server(two_columns(), table(9), 0, 40);

        let handle = thread::spawn(move || {
            let mut buf = vec![0; 65_536];
            loop {
                let (len, peer) = server.recv_from(&mut buf).unwrap();
                let request = Message::decode(&buf[..len]).unwrap();
                if request.kind() == MessageKind::CloseRequest {
                    break;
                }
                for reply in respond(&request) {
                    server.send_to(&reply.encode().unwrap(), peer).unwrap();
                }
            }
        });

        let options = ConnectOptions::new("127.0.0.1", addr.port());
        let mut session = Session::open(options).unwrap();
        let mut cursor = session.query("select * from t").unwrap();

        assert_eq!(cursor.metadata().len(), 2);
        assert_eq!(cursor.fetch_all().unwrap(), table(9));
        drop(cursor);

        handle.join().unwrap();
        session.close().unwrap();
    }
}
