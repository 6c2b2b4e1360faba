//! # livecore
//!
//! Coroutine runtime and live stream fan-out core for media servers.
//!
//! A publisher's messages are wrapped once in a reference-counted
//! [`SharedMessage`], cached in the source's [`GopCache`] and enqueued into a
//! private bounded queue per [`Consumer`]. A slow consumer loses its own oldest
//! messages and resyncs at the next keyframe; the publisher never blocks.
//!
//! Connections run as coroutines on a [`Scheduler`]. Each one is linked into a
//! [`ResourceManager`] and removes itself as its last action; the manager
//! disposes it on a separate reclamation coroutine.
//!
//! ```no_run
//! use livecore::{ConnectionContext, ConnectionHandler, Server, ServerConfig};
//! use tokio::net::TcpStream;
//!
//! struct Handler;
//!
//! impl ConnectionHandler for Handler {
//!     async fn serve(&self, ctx: &ConnectionContext, _stream: TcpStream) -> livecore::Result<()> {
//!         tracing::info!(session_id = ctx.session_id, "connected");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> livecore::Result<()> {
//! let server = std::sync::Arc::new(Server::new(ServerConfig::default(), Handler)?);
//! server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

pub mod consumer;
pub mod coroutine;
pub mod error;
pub mod media;
pub mod registry;
pub mod resource;
pub mod server;
pub mod stats;

pub use consumer::{Consumer, ConsumerWait, MessageQueue};
pub use coroutine::{Condition, Coroutine, Mutex, Runnable, Scheduler, SchedulerConfig, WaitResult};
pub use error::{Error, Result};
pub use media::{GopCache, JitterAlgorithm, MessageKind, SharedMessage};
pub use registry::{LiveSource, Publisher, Reloadable, StreamConfig, StreamKey, StreamRegistry};
pub use resource::{DisposingHandler, Resource, ResourceManager, ResourceState};
pub use server::{ConnectionContext, ConnectionHandler, Server, ServerConfig};
pub use stats::{ConsumerStats, ServerStats, StreamStats};
