//! Protocol server: authenticated handshake plus two-level dispatch.
//!
//! Built by composition on the base [`crate::Server`]: the bound connection
//! handler upgrades each accepted stream through the external secure
//! transport, then multiplexes logical channels and, per channel, logical
//! requests onto caller-registered handlers.

mod connection;
mod handlers;

pub use connection::ProtocolServer;
pub use handlers::{HandlerRegistry, NoReply, RejectUnknown, RequestDispatch};

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use gangway_core::transport::{ChannelData, NewChannel, Request};
use gangway_core::Result;

use crate::task::TaskContext;

/// Correlation data for one logical channel, passed explicitly down the
/// call chain.
#[derive(Debug, Clone, Copy)]
pub struct ChannelContext {
    /// Connection index, scoped to the server.
    pub connection: u64,
    /// Channel index, monotonically increasing per connection.
    pub channel: u64,
    /// Remote peer address.
    pub remote_addr: SocketAddr,
}

impl ChannelContext {
    /// Derive a channel context from its connection's task context.
    pub fn new(cx: &TaskContext, channel: u64) -> Self {
        Self {
            connection: cx.connection,
            channel,
            remote_addr: cx.remote_addr,
        }
    }
}

/// Handles one incoming channel-open proposal.
///
/// The handler receives the channel exactly once and must accept or reject
/// it; returning without answering is a protocol violation toward the peer.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Handle the channel for its whole lifetime.
    async fn handle(&self, cx: &ChannelContext, channel: Box<dyn NewChannel>) -> Result<()>;
}

/// Handles one request received on an accepted channel.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle the request; `channel` is the data stream it arrived on.
    async fn handle(
        &self,
        cx: &ChannelContext,
        channel: Arc<dyn ChannelData>,
        request: Request,
    ) -> Result<()>;
}
