//! Data models shared by the database layer and the row pipeline.

mod row;
mod value;

pub use row::Row;
pub use value::{ParamType, Value};
