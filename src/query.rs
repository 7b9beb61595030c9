//! Query execution state machine.
//!
//! Every request a query sends is numbered one past the last response it accepted,
//! and is answered one number later. Two requests break that rule: re-execution
//! and close jump ahead by the session's sequence gap, so they can never be
//! confused with the single NextValuesRequest a cursor may have pipelined.
use std::{
    sync::{Arc, mpsc::Receiver},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    cursor::ResultCursor,
    error::{Error, Result},
    protocol::{
        Body, ColumnDescriptor, ExecuteQueryRequest, Message, MessageKind, MetaData, Parameter,
        QueryRequest, ResponseWithValues, StatementType,
    },
    session::{AdaptiveTimeout, Shared},
    value::{SqlType, Value, ValueCodec},
};

/// Lifecycle of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Created,
    Prepared,
    Executing,
    StreamingRows,
    Closed,
}

/// Protocol state of one query: identifier, inbox and sequence numbering.
pub(crate) struct QueryCore {
    shared: Arc<Shared>,
    query_id: String,
    inbox: Receiver<Message>,
    /// Sequence number of the last accepted response.
    sequence: u32,
    /// Whether a NextValuesRequest is in flight at `sequence + 1`.
    pipelined: bool,
    executed: bool,
    state: QueryState,
    timeout: AdaptiveTimeout,
    timeout_override: Option<Duration>,
    columns: Arc<[ColumnDescriptor]>,
    parameter_count: usize,
}

impl QueryCore {
    /// Registers a new query and sends `sql` to the server.
    ///
    /// Returns the query together with the first batch of rows, which only
    /// [`StatementType::Statement`] replies carry.
    pub fn open(
        shared: Arc<Shared>,
        sql: &str,
        statement_type: StatementType,
    ) -> Result<(Self, Option<ResponseWithValues>)> {
        let (query_id, inbox) = shared.open_query()?;
        let options = shared.options();
        let timeout = AdaptiveTimeout::new(options.first_timeout, options.timeout_margin);

        let mut core = Self {
            shared,
            query_id,
            inbox,
            sequence: 0,
            pipelined: false,
            executed: false,
            state: QueryState::Created,
            timeout,
            timeout_override: None,
            columns: Vec::new().into(),
            parameter_count: 0,
        };

        let request = Body::QueryRequest(QueryRequest {
            statement_type,
            query: sql.to_string(),
        });
        let reply = core.round_trip(request, 1, MessageKind::MetaData)?;
        let kind = reply.kind();
        let Body::MetaData(MetaData {
            parameter_count,
            columns,
            values,
        }) = reply.body
        else {
            return Err(Error::UnexpectedResponse(kind));
        };

        core.columns = columns.into();
        core.parameter_count = parameter_count as usize;
        core.state = QueryState::Prepared;
        debug!(
            "query '{}' prepared: {} columns, {} parameters",
            core.query_id,
            core.columns.len(),
            core.parameter_count
        );

        if statement_type == StatementType::Statement {
            core.executed = true;
            core.state = QueryState::StreamingRows;
        }
        Ok((core, values))
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn columns(&self) -> &Arc<[ColumnDescriptor]> {
        &self.columns
    }

    pub fn codec(&self) -> Arc<dyn ValueCodec> {
        self.shared.codec()
    }

    /// Bound for the next wait: explicit overrides first, then the estimate.
    pub fn wait_timeout(&self) -> Duration {
        self.timeout_override
            .or_else(|| self.shared.query_timeout())
            .unwrap_or_else(|| self.timeout.current())
    }

    fn send(&self, sequence_number: u32, body: Body) -> Result<()> {
        if self.state == QueryState::Closed {
            return Err(Error::QueryClosed);
        }
        self.shared
            .send(&Message::new(self.query_id.clone(), sequence_number, body))
    }

    fn await_reply(&mut self, sequence_number: u32, kind: MessageKind) -> Result<Message> {
        let started = Instant::now();
        let reply = self.shared.await_matching(
            &self.inbox,
            &self.query_id,
            sequence_number,
            kind,
            self.wait_timeout(),
        )?;
        self.timeout.observe(started.elapsed());
        self.sequence = sequence_number;
        Ok(reply)
    }

    /// Sends `body` at `sequence + step` and waits for its reply one number later.
    fn round_trip(&mut self, body: Body, step: u32, kind: MessageKind) -> Result<Message> {
        let request = self.sequence.wrapping_add(step);
        self.send(request, body)?;
        self.await_reply(request.wrapping_add(1), kind)
    }

    /// Runs the query, returning the first batch of the new value stream.
    pub fn execute(&mut self, parameters: Vec<Parameter>) -> Result<ResponseWithValues> {
        if self.state == QueryState::Closed {
            return Err(Error::QueryClosed);
        }

        let step = if self.executed || self.pipelined {
            self.shared.options().sequence_gap
        } else {
            1
        };
        // Whatever was pipelined for the previous stream is abandoned.
        self.executed = true;
        self.pipelined = false;
        self.state = QueryState::Executing;

        let reply = self.round_trip(
            Body::ExecuteQueryRequest(ExecuteQueryRequest { parameters }),
            step,
            MessageKind::ExecuteQueryResponse,
        )?;
        self.state = QueryState::StreamingRows;
        reply
            .into_values()
            .ok_or(Error::UnexpectedResponse(MessageKind::ExecuteQueryResponse))
    }

    /// Asks for the next batch without waiting for it.
    pub fn request_next(&mut self) -> Result<()> {
        if self.pipelined {
            return Ok(());
        }
        self.send(self.sequence.wrapping_add(1), Body::NextValuesRequest)?;
        self.pipelined = true;
        Ok(())
    }

    /// Waits for the next batch, requesting it first if nothing is in flight.
    pub fn await_next(&mut self) -> Result<ResponseWithValues> {
        self.request_next()?;
        let reply = self.await_reply(
            self.sequence.wrapping_add(2),
            MessageKind::NextValuesResponse,
        )?;
        self.pipelined = false;
        reply
            .into_values()
            .ok_or(Error::UnexpectedResponse(MessageKind::NextValuesResponse))
    }

    /// Sends a CloseRequest and drops the inbox. Closing twice sends nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.state == QueryState::Closed {
            return Ok(());
        }
        self.state = QueryState::Closed;

        let sequence_number = self.sequence.wrapping_add(self.shared.options().sequence_gap);
        let sent = self.shared.send(&Message::new(
            self.query_id.clone(),
            sequence_number,
            Body::CloseRequest,
        ));
        self.shared.close_query(&self.query_id);

        match sent {
            Err(Error::SessionClosed) => Ok(()),
            other => other,
        }
    }
}

impl Drop for QueryCore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close query '{}': {e}", self.query_id);
        }
    }
}

/// A query prepared once and executable many times.
pub struct PreparedQuery {
    core: QueryCore,
    parameters: Vec<Option<Parameter>>,
}

impl PreparedQuery {
    pub(crate) fn prepare(shared: Arc<Shared>, sql: &str) -> Result<Self> {
        let (core, values) = QueryCore::open(shared, sql, StatementType::Prepared)?;
        if values.is_some() {
            debug!("ignoring rows sent with prepared query '{}'", core.query_id());
        }
        let parameters = vec![None; core.parameter_count];
        Ok(Self { core, parameters })
    }

    pub fn query_id(&self) -> &str {
        self.core.query_id()
    }

    pub fn state(&self) -> QueryState {
        self.core.state()
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        self.core.columns()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    fn slot(&mut self, index: usize) -> Result<&mut Option<Parameter>> {
        let count = self.parameters.len();
        index
            .checked_sub(1)
            .and_then(|i| self.parameters.get_mut(i))
            .ok_or(Error::ParameterIndex { index, count })
    }

    /// Binds the 1-based parameter `index`, declared with the value's own type.
    pub fn bind(&mut self, index: usize, value: Value) -> Result<()> {
        match value.sql_type() {
            Some(sql_type) => self.bind_typed(index, sql_type, value),
            // Untyped null; the server takes its type from the statement.
            None => self.bind_null(index, SqlType::Varchar),
        }
    }

    /// Binds `value` under an explicit declared type.
    pub fn bind_typed(&mut self, index: usize, sql_type: SqlType, value: Value) -> Result<()> {
        if value.is_null() {
            return self.bind_null(index, sql_type);
        }
        let mut bytes = Vec::new();
        self.core.codec().encode(sql_type, &value, &mut bytes)?;
        *self.slot(index)? = Some(Parameter {
            sql_type,
            value: Some(bytes),
        });
        Ok(())
    }

    pub fn bind_null(&mut self, index: usize, sql_type: SqlType) -> Result<()> {
        *self.slot(index)? = Some(Parameter {
            sql_type,
            value: None,
        });
        Ok(())
    }

    pub fn clear_parameters(&mut self) {
        self.parameters.fill(None);
    }

    /// Overrides the adaptive timeout for this query.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.core.timeout_override = timeout;
    }

    /// Bound currently applied to each wait.
    pub fn timeout(&self) -> Duration {
        self.core.wait_timeout()
    }

    /// Executes the query with the bound parameters.
    ///
    /// Executing again while a previous cursor still had a fetch in flight is safe;
    /// stale batches of the old stream are discarded.
    pub fn execute(&mut self) -> Result<ResultCursor<'_>> {
        let parameters = self
            .parameters
            .iter()
            .enumerate()
            .map(|(i, p)| p.clone().ok_or(Error::UnboundParameter(i + 1)))
            .collect::<Result<Vec<_>>>()?;

        let first = self.core.execute(parameters)?;
        ResultCursor::borrowed(&mut self.core, first)
    }

    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }
}
