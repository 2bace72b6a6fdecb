//! Server: listen/serve/stop lifecycle around a stream listener.
//!
//! `listen` binds, `serve` drives the accept loop, `stop` tears down in
//! order: stop accepting, drain the worker pool, release the logger. The
//! three are separate steps so a caller can bind before serving (e.g. to
//! learn an ephemeral port).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use gangway_core::config::ServerConfig;
use gangway_core::{logging, Error, Result, ServerOptions};

use crate::pool::WorkerPool;
use crate::task::{TaskContext, TaskTemplate};

/// Stream server driving the accept → pool dispatch loop.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    template: TaskTemplate,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    next_connection: AtomicU64,
}

impl Server {
    /// Resolve configuration, initialize logging and the worker pool, and
    /// bind the listener.
    ///
    /// Fails fast with a configuration error on malformed options and a
    /// bind error when the address cannot be bound; nothing is retried.
    pub async fn listen(options: &ServerOptions, template: TaskTemplate) -> Result<Self> {
        let config = options.resolve()?;
        logging::init_from_config(&config.logger);

        let pool = Arc::new(WorkerPool::new(config.workers));

        let listener = TcpListener::bind((config.address.as_str(), config.port))
            .await
            .map_err(|e| Error::Bind {
                message: format!("could not bind {}:{}: {}", config.address, config.port, e),
            })?;

        info!(
            addr = %listener.local_addr()?,
            workers = config.workers,
            "listening"
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            listener,
            pool,
            template,
            shutdown,
            stopped: AtomicBool::new(false),
            next_connection: AtomicU64::new(0),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The worker pool shared by this server.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The resolved configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections until stopped.
    ///
    /// Accept-error policy:
    /// - poll timeout (keep-alive period elapsed): transient, logged, loop
    ///   continues;
    /// - shutdown observed: clean return;
    /// - anything else: fatal, returned to the caller.
    ///
    /// A connection that cannot be admitted to the pool is rejected and
    /// logged; the loop keeps accepting.
    pub async fn serve(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            debug!("server already stopped");
            return Ok(());
        }
        let keep_alive = self.config.keep_alive();
        info!("starting server");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    debug!("listener closed");
                    return Ok(());
                }

                polled = tokio::time::timeout(keep_alive, self.listener.accept()) => {
                    let accepted = match polled {
                        Err(_elapsed) => {
                            debug!("accept timed out");
                            continue;
                        }
                        Ok(accepted) => accepted,
                    };

                    match accepted {
                        Ok((conn, peer)) => self.dispatch(conn, peer).await,
                        Err(e) if is_transient_accept(&e) => {
                            debug!(error = %e, "transient accept error");
                        }
                        Err(e) => {
                            if *shutdown_rx.borrow() {
                                debug!("listener closed");
                                return Ok(());
                            }
                            error!(error = %e, "could not accept connection");
                            return Err(Error::Io(e));
                        }
                    }
                }
            }
        }
    }

    /// Wrap an accepted connection as a task and submit it to the pool.
    async fn dispatch(&self, conn: tokio::net::TcpStream, peer: SocketAddr) {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        info!(connection, addr = %peer, "accepted connection");

        let cx = TaskContext::new(connection, peer);
        let task = self.template.bind(conn, peer);
        if let Err(e) = self.pool.add(cx, task).await {
            // The connection drops here; the peer observes a close.
            error!(connection, addr = %peer, error = %e, "connection rejected");
        }
    }

    /// Stop the server: stop accepting, drain the pool, release the logger.
    ///
    /// Safe to call once per listen/serve cycle; duplicate calls are no-ops.
    /// Shutdown errors are logged, not re-raised, so teardown always
    /// completes.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("stop already requested");
            return Ok(());
        }

        info!("stopping server");
        // send_replace stores the signal even when no serve loop is
        // subscribed yet, so a later serve call still observes it.
        self.shutdown.send_replace(true);

        self.pool.stop().await;

        // The tracing subscriber has no teardown of its own; a sink with a
        // real shutdown path would surface its error here.
        Ok(())
    }
}

/// Timeout-class accept errors are retried, everything else is fatal.
fn is_transient_accept(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_accept_classification() {
        assert!(is_transient_accept(&std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out"
        )));
        assert!(is_transient_accept(&std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "eintr"
        )));
        assert!(!is_transient_accept(&std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied"
        )));
    }
}
