pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, Result, SERIALIZATION_FAILURE, SqlState};
pub use types::{Column, DataType, Row, Schema};
pub use value::Value;
