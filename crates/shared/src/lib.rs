//! Shared wire types for the chat relay server and its clients.

pub mod error;
pub mod protocol;

pub use error::*;
pub use protocol::*;
