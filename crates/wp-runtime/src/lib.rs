//! Bridge wire runtime for wrightplay.
//!
//! The pieces both bridge peers share: the remote-value graph and its
//! serialized form, evaluate-source normalization, the closed set of bridge
//! message shapes, and the transports those messages travel over.

pub mod error;
pub mod expr;
pub mod message;
pub mod remote;
pub mod transport;

pub use error::{Error, Result};
