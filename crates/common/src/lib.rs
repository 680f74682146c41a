//! Shared error definitions and utilities used across all squire crates.

pub mod error;

pub use error::{Error, FromMessage, Result, SquireError};
