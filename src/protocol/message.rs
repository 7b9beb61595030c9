use bincode::{Decode, Encode, decode_from_std_read, encode_into_std_write};

use crate::{error::ProtocolError, value::SqlType};

use super::wire_config;

/// Leading type tag of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    QueryRequest,
    MetaData,
    ExecuteQueryRequest,
    ExecuteQueryResponse,
    NextValuesRequest,
    NextValuesResponse,
    CloseRequest,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(MessageKind::QueryRequest),
            0x1 => Ok(MessageKind::MetaData),
            0x2 => Ok(MessageKind::ExecuteQueryRequest),
            0x3 => Ok(MessageKind::ExecuteQueryResponse),
            0x4 => Ok(MessageKind::NextValuesRequest),
            0x5 => Ok(MessageKind::NextValuesResponse),
            0x6 => Ok(MessageKind::CloseRequest),
            tag => Err(ProtocolError::UnknownKind(tag)),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(value: MessageKind) -> Self {
        match value {
            MessageKind::QueryRequest => 0x0,
            MessageKind::MetaData => 0x1,
            MessageKind::ExecuteQueryRequest => 0x2,
            MessageKind::ExecuteQueryResponse => 0x3,
            MessageKind::NextValuesRequest => 0x4,
            MessageKind::NextValuesResponse => 0x5,
            MessageKind::CloseRequest => 0x6,
        }
    }
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum StatementType {
    /// Run once; the MetaData reply already carries the first batch of rows.
    Statement,
    /// Prepare only; rows come back from each ExecuteQueryRequest.
    Prepared,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct QueryRequest {
    pub statement_type: StatementType,
    pub query: String,
}

/// One bound parameter; `value` holds the codec encoding, `None` is SQL NULL.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Parameter {
    pub sql_type: SqlType,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct ExecuteQueryRequest {
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub scale: i32,
    pub precision: i32,
    pub display_size: i32,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
            scale: 0,
            precision: 0,
            display_size: 0,
        }
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// Result shape of a prepared or executed query.
#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct MetaData {
    pub parameter_count: u32,
    pub columns: Vec<ColumnDescriptor>,
    /// First batch of rows, only present in replies to [`StatementType::Statement`].
    pub values: Option<ResponseWithValues>,
}

/// A batch of rows.
///
/// `payload` is the concatenation of every non-null cell, row-major.
/// `null_indices` lists the flat offsets of null cells, counted from the start
/// of the query's value stream and ascending across batches.
#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct ResponseWithValues {
    pub is_last: bool,
    pub row_count: u32,
    pub null_indices: Vec<u64>,
    pub payload: Vec<u8>,
}

impl ResponseWithValues {
    /// A batch with no rows that ends the stream.
    pub fn end() -> Self {
        Self {
            is_last: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    QueryRequest(QueryRequest),
    MetaData(MetaData),
    ExecuteQueryRequest(ExecuteQueryRequest),
    ExecuteQueryResponse(ResponseWithValues),
    NextValuesRequest,
    NextValuesResponse(ResponseWithValues),
    CloseRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub query_id: String,
    pub sequence_number: u32,
    pub body: Body,
}

impl Message {
    pub fn new(query_id: impl Into<String>, sequence_number: u32, body: Body) -> Self {
        Self {
            query_id: query_id.into(),
            sequence_number,
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            Body::QueryRequest(_) => MessageKind::QueryRequest,
            Body::MetaData(_) => MessageKind::MetaData,
            Body::ExecuteQueryRequest(_) => MessageKind::ExecuteQueryRequest,
            Body::ExecuteQueryResponse(_) => MessageKind::ExecuteQueryResponse,
            Body::NextValuesRequest => MessageKind::NextValuesRequest,
            Body::NextValuesResponse(_) => MessageKind::NextValuesResponse,
            Body::CloseRequest => MessageKind::CloseRequest,
        }
    }

    /// Row batch carried by the message, if any.
    pub fn into_values(self) -> Option<ResponseWithValues> {
        match self.body {
            Body::ExecuteQueryResponse(values) | Body::NextValuesResponse(values) => Some(values),
            Body::MetaData(meta) => meta.values,
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let config = wire_config();
        let mut out = Vec::with_capacity(64);

        out.push(self.kind().into());
        encode_into_std_write(&self.query_id, &mut out, config)?;
        encode_into_std_write(self.sequence_number, &mut out, config)?;
        match &self.body {
            Body::QueryRequest(req) => encode_into_std_write(req, &mut out, config)?,
            Body::MetaData(meta) => encode_into_std_write(meta, &mut out, config)?,
            Body::ExecuteQueryRequest(req) => encode_into_std_write(req, &mut out, config)?,
            Body::ExecuteQueryResponse(values) | Body::NextValuesResponse(values) => {
                encode_into_std_write(values, &mut out, config)?
            }
            Body::NextValuesRequest | Body::CloseRequest => 0,
        };

        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, mut input) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        let kind = MessageKind::try_from(tag)?;
        let config = wire_config();

        let query_id: String = decode_from_std_read(&mut input, config)?;
        let sequence_number: u32 = decode_from_std_read(&mut input, config)?;
        let body = match kind {
            MessageKind::QueryRequest => Body::QueryRequest(decode_from_std_read(&mut input, config)?),
            MessageKind::MetaData => Body::MetaData(decode_from_std_read(&mut input, config)?),
            MessageKind::ExecuteQueryRequest => {
                Body::ExecuteQueryRequest(decode_from_std_read(&mut input, config)?)
            }
            MessageKind::ExecuteQueryResponse => {
                Body::ExecuteQueryResponse(decode_from_std_read(&mut input, config)?)
            }
            MessageKind::NextValuesRequest => Body::NextValuesRequest,
            MessageKind::NextValuesResponse => {
                Body::NextValuesResponse(decode_from_std_read(&mut input, config)?)
            }
            MessageKind::CloseRequest => Body::CloseRequest,
        };

        if !input.is_empty() {
            return Err(ProtocolError::TrailingBytes(input.len(), kind));
        }

        Ok(Self {
            query_id,
            sequence_number,
            body,
        })
    }
}
