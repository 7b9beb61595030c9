use std::{fmt, ops::Index};

use crate::value::Value;

/// One decoded row. Cursors reuse the same buffer from row to row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(pub(crate) Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, column: usize) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub(crate) fn reset(&mut self, columns: usize) {
        self.0.resize(columns, Value::Null);
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, column: usize) -> &Self::Output {
        &self.0[column]
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

impl From<Vec<Value>> for Row {
    fn from(value: Vec<Value>) -> Self {
        Self(value)
    }
}
