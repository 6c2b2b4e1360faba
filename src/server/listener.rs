//! Server listener
//!
//! Runs the TCP accept loop as a coroutine and spawns one coroutine per
//! connection. Every connection is linked into the resource manager before
//! its coroutine starts, and removes itself as its last action.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::coroutine::{self, Coroutine, Scheduler, SchedulerConfig};
use crate::error::Result;
use crate::registry::StreamRegistry;
use crate::resource::ResourceManager;
use crate::stats::ServerStats;

use super::config::ServerConfig;
use super::connection::{Connection, ConnectionContext};
use super::handler::ConnectionHandler;

/// Media server core
pub struct Server<H: ConnectionHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    registry: Arc<StreamRegistry>,
    manager: Arc<ResourceManager<Connection>>,
    scheduler: Scheduler,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    started_at: Instant,
}

impl<H: ConnectionHandler> Server<H> {
    /// Create a server on the ambient runtime
    pub fn new(config: ServerConfig, handler: H) -> Result<Self> {
        let scheduler = Scheduler::current_with(
            SchedulerConfig::named("server").max_coroutines(config.max_coroutines),
        )?;
        Ok(Self::with_scheduler(config, handler, scheduler))
    }

    /// Create a server running its coroutines on `scheduler`
    pub fn with_scheduler(config: ServerConfig, handler: H, scheduler: Scheduler) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            registry: Arc::new(StreamRegistry::with_config(config.registry.clone())),
            manager: Arc::new(ResourceManager::new("connections")),
            config,
            handler: Arc::new(handler),
            scheduler,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
            total_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Get a reference to the stream registry
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Get a reference to the connection manager
    pub fn connections(&self) -> &Arc<ResourceManager<Connection>> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind and start the accept loop, reclaimer and registry cleanup
    pub async fn listen(self: &Arc<Self>) -> Result<ServerHandle<H>> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Server listening");

        let reclaimer = self.manager.start(&self.scheduler)?;
        let cleanup = self.registry.spawn_cleanup_task(&self.scheduler)?;

        let server = Arc::clone(self);
        let accept = self
            .scheduler
            .spawn("accept", async move { server.accept_loop(listener).await })?;

        Ok(ServerHandle {
            server: Arc::clone(self),
            local_addr,
            accept,
            reclaimer,
            cleanup,
        })
    }

    /// Run the server until `shutdown` resolves
    pub async fn run_until<F>(self: &Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handle = self.listen().await?;
        shutdown.await;
        tracing::info!("Shutdown signal received");
        handle.shutdown().await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match coroutine::interruptible(listener.accept()).await {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(e) if e.is_interrupted() => {
                    tracing::debug!("Accept loop interrupted");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    coroutine::yield_now().await;
                }
            }
        }
    }

    fn handle_connection(self: &Arc<Self>, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = match &self.connection_semaphore {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            },
            None => None,
        };

        // Generate session ID
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(session_id = session_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(session_id = session_id, error = %e, "Failed to configure socket");
                return;
            }
        }

        let ctx = ConnectionContext::new(session_id, peer_addr, Arc::clone(&self.registry));
        let conn = Arc::new(Connection::new(ctx, permit));

        if let Err(e) = self.manager.add(Arc::clone(&conn)) {
            tracing::error!(session_id = session_id, error = %e, "Failed to register connection");
            return;
        }

        let server = Arc::clone(self);
        let ctx = conn.context().clone();
        let mut exit = RemoveOnExit {
            manager: Arc::clone(&self.manager),
            session_id,
            finished: false,
        };
        let spawned = self
            .scheduler
            .spawn(format!("conn-{}", session_id), async move {
                server.serve_connection(ctx, socket).await;
                exit.finish();
                Ok(())
            });

        match spawned {
            // Detached; the connection removes itself when done
            Ok(co) => conn.attach(co.handle()),
            // The dropped future's guard unlinks the connection
            Err(e) => tracing::warn!(session_id = session_id, error = %e, "Failed to spawn connection"),
        }
    }

    async fn serve_connection(&self, ctx: ConnectionContext, socket: TcpStream) {
        if self.handler.on_connection(&ctx).await {
            let result = self.handler.serve(&ctx, socket).await;

            match &result {
                Ok(()) => {}
                Err(e) if e.is_interrupted() || e.is_disconnected() => {
                    tracing::debug!(session_id = ctx.session_id, error = %e, "Connection ended");
                }
                Err(e) => {
                    tracing::warn!(session_id = ctx.session_id, error = %e, "Connection error");
                }
            }

            self.handler.on_disconnect(&ctx, &result).await;
        } else {
            tracing::debug!(session_id = ctx.session_id, "Connection refused by handler");
        }

        tracing::debug!(
            session_id = ctx.session_id,
            duration_ms = ctx.duration().as_millis() as u64,
            "Connection closed"
        );
    }

    /// Snapshot of server counters
    ///
    /// Leaves `active_streams` unset; counting sources takes the registry
    /// lock, see [`Server::full_stats`].
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.manager.len() as u64,
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            pending_disposal: self.manager.pending() as u64,
            active_streams: None,
            coroutines: self.scheduler.live() as u64,
            uptime: self.started_at.elapsed(),
        }
    }

    /// Server counters including the number of live sources
    pub async fn full_stats(&self) -> Result<ServerStats> {
        let mut stats = self.stats();
        stats.active_streams = Some(self.registry.stream_count().await? as u64);
        Ok(stats)
    }
}

/// Removes a connection from the manager when its coroutine ends
///
/// Runs on normal return and when a panicking handler drops the coroutine.
struct RemoveOnExit {
    manager: Arc<ResourceManager<Connection>>,
    session_id: u64,
    finished: bool,
}

impl RemoveOnExit {
    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for RemoveOnExit {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(session_id = self.session_id, "Connection coroutine aborted");
        }
        self.manager.remove(self.session_id);
    }
}

/// A listening server
pub struct ServerHandle<H: ConnectionHandler> {
    server: Arc<Server<H>>,
    local_addr: SocketAddr,
    accept: Coroutine<()>,
    reclaimer: Coroutine<()>,
    cleanup: Coroutine<()>,
}

impl<H: ConnectionHandler> ServerHandle<H> {
    /// Bound address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server(&self) -> &Arc<Server<H>> {
        &self.server
    }

    /// Stop accepting, interrupt every connection and wait for disposal
    pub async fn shutdown(mut self) -> Result<()> {
        self.accept.stop().await?;

        let connections = self.server.manager.resources();
        for conn in &connections {
            conn.interrupt();
        }
        drop(connections);

        let deadline = Instant::now() + self.server.config.shutdown_timeout;
        while !self.server.manager.is_empty() && Instant::now() < deadline {
            coroutine::sleep(std::time::Duration::from_millis(10)).await?;
        }

        // Unlink stragglers here so none disposes itself after the reclaimer stops
        let remaining = self.server.manager.resources();
        if !remaining.is_empty() {
            tracing::warn!(remaining = remaining.len(), "Connections still active at shutdown");
            for conn in remaining {
                self.server.manager.remove(conn.session_id());
            }
        }

        self.cleanup.stop().await?;
        self.reclaimer.stop().await?;

        tracing::info!(addr = %self.local_addr, "Server stopped");
        Ok(())
    }
}
