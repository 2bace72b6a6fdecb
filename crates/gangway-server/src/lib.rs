//! gangway-server: Concurrent server harness and protocol server.
//!
//! Provides:
//! - Task: the unit of pool work around one accepted connection
//! - WorkerPool: bounded concurrent executor with explicit admission control
//! - Server: listen/serve/stop lifecycle around a stream listener
//! - ProtocolServer: authenticated handshake plus channel/request dispatch
//!   on top of the harness

pub mod pool;
pub mod protocol;
pub mod server;
pub mod task;

pub use pool::WorkerPool;
pub use protocol::{
    ChannelContext, ChannelHandler, HandlerRegistry, NoReply, ProtocolServer, RejectUnknown,
    RequestDispatch, RequestHandler,
};
pub use server::Server;
pub use task::{Handler, Task, TaskArgs, TaskContext, TaskTemplate};
