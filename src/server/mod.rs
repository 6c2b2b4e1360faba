//! Connection-accepting server
//!
//! This module provides:
//! - The accept loop and per-connection coroutines
//! - The handler trait a protocol layer implements
//! - Connection resources disposed through the resource manager

pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionContext};
pub use handler::ConnectionHandler;
pub use listener::{Server, ServerHandle};
