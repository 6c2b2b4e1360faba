//! Connection handler trait
//!
//! The seam between the core and a wire protocol. The server owns accept,
//! connection limits, coroutine spawning and disposal; the handler owns the
//! bytes on the socket.

use std::future::Future;

use tokio::net::TcpStream;

use crate::error::Result;

use super::connection::ConnectionContext;

/// Protocol driver for one accepted connection
///
/// Every method runs on the connection's own coroutine, so `serve` may block
/// on socket I/O and consumer waits. Use [`interruptible`] around raw socket
/// operations so shutdown can unwind the connection.
///
/// [`interruptible`]: crate::coroutine::interruptible
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called before serving
    ///
    /// Return `false` to close the connection immediately.
    fn on_connection(&self, _ctx: &ConnectionContext) -> impl Future<Output = bool> + Send {
        async { true }
    }

    /// Drive the connection until the peer leaves or an error occurs
    fn serve(
        &self,
        ctx: &ConnectionContext,
        stream: TcpStream,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Called after `serve` returns, with its result
    fn on_disconnect(
        &self,
        _ctx: &ConnectionContext,
        _result: &Result<()>,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}
