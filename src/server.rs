//! The TCP acceptor and per-connection read loop.
//!
//! The acceptor and every connection state machine run on the async
//! scheduler; request execution runs on the worker pool. A connection
//! task owns its socket until dispatch, at which point the socket, the
//! parsed request and the pool lease move to a worker thread and the
//! acceptor side never touches the connection again.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

use crate::parser::request::Parser;
use crate::pool::Pool;
use crate::worker::{self, Job};
use crate::Config;


/// A bound SCGI server ready to accept connections.
pub struct Server {
    listener: TcpListener,
    config: Arc<Config>,
    pool: Pool<Job>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Validates the configuration and binds the listening socket.
    ///
    /// # Errors
    /// Returns an error for an invalid configuration or a failed bind.
    pub async fn bind(config: Config) -> io::Result<Self> {
        if let Err(reason) = config.validate() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, reason));
        }
        let listener = TcpListener::bind((config.addr.as_str(), config.port)).await?;
        let pool = Pool::new(&config, worker::handle);
        Ok(Self { listener, config: Arc::new(config), pool })
    }

    /// The address the server actually bound, useful with port 0.
    ///
    /// # Errors
    /// Forwards errors from the socket address lookup.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the surrounding task is cancelled.
    ///
    /// # Errors
    /// Returns an error only if the local address cannot be determined;
    /// per-connection failures are logged and absorbed.
    pub async fn run(self) -> io::Result<()> {
        let local = self.local_addr()?;
        tracing::info!(%local, "SCGI server listening");

        loop {
            let (socket, remote) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::info!(error = %e, "accept failed");
                    continue;
                },
            };

            let config = self.config.clone();
            let pool = self.pool.clone();
            let span = tracing::error_span!("scgi_connection", %remote);
            tokio::spawn(
                async move {
                    tracing::debug!("connection accepted");
                    if let Err(e) = serve_connection(socket, config, pool).await {
                        tracing::debug!(error = %e, "connection dropped");
                    }
                }
                .instrument(span),
            );
        }
    }
}

/// Drives one connection from first byte to dispatch.
///
/// Every read re-arms the idle timeout. A timeout, premature EOF or
/// framing error closes the socket without a response; a complete request
/// is handed to a leased worker together with the socket.
async fn serve_connection(
    mut socket: TcpStream,
    config: Arc<Config>,
    pool: Pool<Job>,
) -> io::Result<()> {
    let mut parser = Parser::new();
    let mut buf = [0; 8192];

    loop {
        let read = socket.read(&mut buf);
        let n = match config.conn_keepalive {
            Some(idle) => match tokio::time::timeout(idle, read).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!("idle timeout");
                    return Ok(());
                },
            },
            None => read.await?,
        };
        if n == 0 {
            tracing::debug!("EOF before request completed");
            return Ok(());
        }

        match parser.advance(&buf[..n]) {
            Ok(true) => break,
            Ok(false) => {},
            Err(e) => {
                tracing::debug!(error = %e, "malformed request");
                return Ok(());
            },
        }
    }
    let Ok(request) = parser.into_request() else {
        return Ok(());
    };

    // Dispatch: stop reading, acquire a worker, move the socket over
    let lease = pool.acquire().await;
    let socket = socket.into_std()?;
    socket.set_nonblocking(false)?;
    tracing::debug!(worker = lease.id(), "request dispatched");
    pool.dispatch(lease, Job { socket, request, config });
    Ok(())
}
