//! Data models shared by the engine boundary and the scope API.
//!
//! This module re-exports all model types used throughout the crate.

pub mod row;
pub mod value;

pub use row::{ExecResult, Row, Rows};
pub use value::{FromValue, Value};
