//! Conversion between [`ResponseWithValues`] batches and typed rows.
//!
//! Null cells are not part of the payload. Their flat offsets travel in a separate
//! ascending list, and decoding is a merge of two cursors: the null index list and
//! the column position. The flat offset keeps running across the batches of one
//! value stream, so a decoder (or encoder) is only reset when a new stream starts.
//!
//! Servers that restart their offsets at zero for every batch are not compatible
//! with this convention: from the second batch on, their indices fall behind the
//! running offset, and the decoder skips them with a warning instead of marking
//! cells null.
use std::{iter::Peekable, sync::Arc, vec};

use log::{debug, warn};

use crate::{
    row::Row,
    value::{CodecError, Value, ValueCodec},
};

use super::{ColumnDescriptor, ResponseWithValues};

/// Decodes rows out of successive batches of one query.
pub struct BatchDecoder {
    columns: Arc<[ColumnDescriptor]>,
    codec: Arc<dyn ValueCodec>,
    offset: u64,
    payload: Vec<u8>,
    position: usize,
    nulls: Peekable<vec::IntoIter<u64>>,
    rows_left: u32,
    is_last: bool,
}

impl BatchDecoder {
    pub fn new(columns: Arc<[ColumnDescriptor]>, codec: Arc<dyn ValueCodec>) -> Self {
        Self {
            columns,
            codec,
            offset: 0,
            payload: Vec::new(),
            position: 0,
            nulls: Vec::new().into_iter().peekable(),
            rows_left: 0,
            is_last: true,
        }
    }

    /// Starts a new value stream with its first batch.
    pub fn start(&mut self, batch: ResponseWithValues) {
        self.offset = 0;
        self.load(batch);
    }

    /// Continues the current stream with its next batch.
    pub fn push(&mut self, batch: ResponseWithValues) {
        if self.rows_left > 0 {
            warn!("{} undecoded rows discarded by next batch", self.rows_left);
        }
        self.load(batch);
    }

    fn load(&mut self, batch: ResponseWithValues) {
        self.payload = batch.payload;
        self.position = 0;
        self.nulls = batch.null_indices.into_iter().peekable();
        self.rows_left = batch.row_count;
        self.is_last = batch.is_last;
    }

    /// Whether the batch being decoded is flagged as the last of its stream.
    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn rows_left(&self) -> u32 {
        self.rows_left
    }

    /// Flat offset of the next cell to be decoded.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decodes the next row of the current batch into `row`.
    ///
    /// Returns `false`, leaving `row` untouched, once the batch is exhausted.
    pub fn decode_row(&mut self, row: &mut Row) -> Result<bool, CodecError> {
        if self.rows_left == 0 {
            return Ok(false);
        }
        row.reset(self.columns.len());

        for (i, column) in self.columns.iter().enumerate() {
            while let Some(stale) = self.nulls.next_if(|&n| n < self.offset) {
                warn!("ignoring out-of-order null index {stale} (at offset {})", self.offset);
            }

            row.0[i] = if self.nulls.next_if_eq(&self.offset).is_some() {
                Value::Null
            } else {
                let mut input = &self.payload[self.position..];
                let value = self.codec.decode(column.sql_type, &mut input)?;
                self.position = self.payload.len() - input.len();
                match value {
                    // An empty string is serialized as a lone NUL character.
                    Value::Text(s) if column.sql_type.is_text() && s == "\0" => {
                        Value::Text(String::new())
                    }
                    value => value,
                }
            };
            self.offset += 1;
        }

        self.rows_left -= 1;
        if self.rows_left == 0 && self.position != self.payload.len() {
            debug!(
                "{} payload bytes left after last row of batch",
                self.payload.len() - self.position
            );
        }
        Ok(true)
    }
}

/// Packs rows into batches under a byte budget; the server half of [`BatchDecoder`].
pub struct BatchEncoder {
    columns: Arc<[ColumnDescriptor]>,
    codec: Arc<dyn ValueCodec>,
    offset: u64,
    scratch: Vec<u8>,
}

/// Bytes a null index adds to a batch.
const NULL_INDEX_SIZE: usize = size_of::<u64>();

impl BatchEncoder {
    pub fn new(columns: Arc<[ColumnDescriptor]>, codec: Arc<dyn ValueCodec>) -> Self {
        Self {
            columns,
            codec,
            offset: 0,
            scratch: Vec::new(),
        }
    }

    /// Restarts flat offsets for a new value stream.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Moves rows from `rows` into one batch until `budget` bytes of payload and
    /// null indices are used. At least one row is always taken so the stream makes
    /// progress; the batch is flagged last once `rows` is drained.
    pub fn encode<I>(
        &mut self,
        rows: &mut Peekable<I>,
        budget: usize,
    ) -> Result<ResponseWithValues, CodecError>
    where
        I: Iterator<Item = Row>,
    {
        let mut batch = ResponseWithValues::default();
        let mut used = 0;

        while let Some(row) = rows.peek() {
            self.scratch.clear();
            let mut nulls = Vec::new();
            for (i, column) in self.columns.iter().enumerate() {
                let cell = self.offset + i as u64;
                match row.get(i) {
                    None | Some(Value::Null) => nulls.push(cell),
                    Some(value) => self.codec.encode(column.sql_type, value, &mut self.scratch)?,
                }
            }

            let cost = self.scratch.len() + nulls.len() * NULL_INDEX_SIZE;
            if batch.row_count > 0 && used + cost > budget {
                break;
            }
            if cost > budget {
                warn!("row of {cost} bytes exceeds batch budget of {budget} bytes");
            }

            used += cost;
            batch.payload.extend_from_slice(&self.scratch);
            batch.null_indices.extend(nulls);
            batch.row_count += 1;
            self.offset += self.columns.len() as u64;
            rows.next();
        }

        batch.is_last = rows.peek().is_none();
        Ok(batch)
    }
}
