pub mod cli;
pub mod cursor;
pub mod error;
pub mod options;
pub mod protocol;
pub mod query;
pub mod row;
pub mod session;
pub mod value;

#[cfg(test)]
mod testing;

pub use cli::{Command, prompt, read_script};
pub use cursor::ResultCursor;
pub use error::{Error, ProtocolError, Result};
pub use options::{ConnectOptions, PASSWORD, USER};
pub use query::{PreparedQuery, QueryState};
pub use row::Row;
pub use session::{AdaptiveTimeout, Session, ShutdownHandle};
pub use value::{BincodeCodec, CodecError, SqlType, Value, ValueCodec};
