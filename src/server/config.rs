//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::registry::{RegistryConfig, StreamConfig};

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Maximum live coroutines on the server scheduler (0 = unlimited)
    pub max_coroutines: usize,

    /// How long shutdown waits for connections to unwind
    pub shutdown_timeout: Duration,

    /// Stream registry settings, including per-stream defaults
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1935)),
            max_connections: 0, // Unlimited
            tcp_nodelay: true,  // Important for low latency
            max_coroutines: 0,
            shutdown_timeout: Duration::from_secs(5),
            registry: RegistryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set the coroutine budget
    pub fn max_coroutines(mut self, max: usize) -> Self {
        self.max_coroutines = max;
        self
    }

    /// Set the shutdown timeout
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set registry settings
    pub fn registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Set default per-stream settings
    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.registry.stream = stream;
        self
    }
}
