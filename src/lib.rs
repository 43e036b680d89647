//! # parley
//!
//! A chat server speaking a line-oriented text protocol, with files moved over a
//! separate binary transfer port.
//!
//! This library provides the wire vocabulary, the storage gateway and the async
//! server that ties them together.

pub mod constants;
pub mod db;
pub mod error;
pub mod logger;
pub mod protocol;

pub mod file;
pub mod server;
pub mod service;

pub use error::{Error, Result};
pub use protocol::{ProtocolRead, ProtocolWrite};
