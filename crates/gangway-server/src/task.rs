//! Task: the unit of pool work around one accepted connection.
//!
//! A [`TaskTemplate`] binds a shared handler and argument list once per
//! server; the accept loop stamps it onto each accepted connection to
//! produce a [`Task`] the pool can execute and finalize. The finalizer
//! always closes the connection, so no handler can leak its socket on an
//! error path.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error};

use gangway_core::Result;

/// Ordered list of opaque call arguments bound to a task. Handlers downcast
/// the entries they expect.
pub type TaskArgs = Arc<Vec<Box<dyn Any + Send + Sync>>>;

/// Correlation data for one accepted connection, passed explicitly down the
/// call chain.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    /// Monotonically increasing connection index, scoped to the server.
    pub connection: u64,
    /// Remote peer address.
    pub remote_addr: SocketAddr,
}

impl TaskContext {
    /// Create a context for a freshly accepted connection.
    pub fn new(connection: u64, remote_addr: SocketAddr) -> Self {
        Self {
            connection,
            remote_addr,
        }
    }
}

/// Connection handler invoked by the pool for each accepted connection.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one connection. The connection is closed by the task
    /// finalizer after this returns, success or not.
    async fn handle(
        &self,
        cx: &TaskContext,
        conn: &mut TcpStream,
        args: &TaskArgs,
    ) -> Result<()>;
}

/// Shared handler descriptor stamped onto every accepted connection.
#[derive(Clone)]
pub struct TaskTemplate {
    handler: Arc<dyn Handler>,
    args: TaskArgs,
}

impl TaskTemplate {
    /// Create a template around a handler with no bound arguments.
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            args: Arc::new(Vec::new()),
        }
    }

    /// Bind an ordered argument list passed to every invocation.
    pub fn with_args(mut self, args: Vec<Box<dyn Any + Send + Sync>>) -> Self {
        self.args = Arc::new(args);
        self
    }

    /// Bind the template to a specific connection.
    pub fn bind(&self, conn: TcpStream, peer: SocketAddr) -> Task {
        Task {
            conn,
            peer,
            handler: Arc::clone(&self.handler),
            args: Arc::clone(&self.args),
        }
    }
}

/// One connection plus the handler that serves it.
pub struct Task {
    conn: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
    args: TaskArgs,
}

impl Task {
    /// Remote peer address of the bound connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Execute the handler, then finalize. Called by the worker pool.
    pub async fn run(mut self, cx: TaskContext) {
        let result = self.do_work(&cx).await;
        self.on_finish(&cx, result).await;
    }

    /// Invoke the handler with the connection and bound arguments.
    async fn do_work(&mut self, cx: &TaskContext) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        handler.handle(cx, &mut self.conn, &self.args).await
    }

    /// Log a handler error and unconditionally close the connection.
    /// A close error other than "not connected" is logged, never raised.
    async fn on_finish(mut self, cx: &TaskContext, result: Result<()>) {
        if let Err(e) = result {
            error!(
                connection = cx.connection,
                addr = %self.peer,
                error = %e,
                "connection handler failed"
            );
        }

        match self.conn.shutdown().await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
            Err(e) => {
                error!(
                    connection = cx.connection,
                    addr = %self.peer,
                    error = %e,
                    "could not close connection"
                );
            }
        }
        debug!(connection = cx.connection, addr = %self.peer, "connection closed");
    }
}
