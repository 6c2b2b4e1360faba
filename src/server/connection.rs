//! Accepted connection as a managed resource

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;

use crate::coroutine::CoroutineHandle;
use crate::registry::StreamRegistry;
use crate::resource::Resource;

/// What a handler knows about its connection
#[derive(Clone)]
pub struct ConnectionContext {
    /// Unique session id
    pub session_id: u64,
    /// Remote address
    pub peer_addr: SocketAddr,
    /// Registry to publish to and subscribe from
    pub registry: Arc<StreamRegistry>,
    /// When the connection was accepted
    pub connected_at: Instant,
}

impl ConnectionContext {
    pub fn new(session_id: u64, peer_addr: SocketAddr, registry: Arc<StreamRegistry>) -> Self {
        Self {
            session_id,
            peer_addr,
            registry,
            connected_at: Instant::now(),
        }
    }

    /// Time since accept
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("session_id", &self.session_id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// One accepted connection
///
/// Holds its connection-limit permit until the resource manager disposes it.
pub struct Connection {
    ctx: ConnectionContext,
    coroutine: Mutex<Option<CoroutineHandle>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Connection {
    pub(crate) fn new(ctx: ConnectionContext, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            ctx,
            coroutine: Mutex::new(None),
            _permit: permit,
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub fn session_id(&self) -> u64 {
        self.ctx.session_id
    }

    pub(crate) fn attach(&self, handle: CoroutineHandle) {
        *self.coroutine.lock() = Some(handle);
    }

    /// Interrupt the connection's coroutine; false if it has none or is gone
    pub fn interrupt(&self) -> bool {
        match self.coroutine.lock().as_ref() {
            Some(handle) => handle.interrupt(),
            None => false,
        }
    }
}

impl Resource for Connection {
    fn id(&self) -> u64 {
        self.ctx.session_id
    }

    fn desc(&self) -> String {
        format!("connection {} from {}", self.ctx.session_id, self.ctx.peer_addr)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("ctx", &self.ctx).finish()
    }
}
