//! Protocol server: handshake orchestration and channel dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use gangway_core::auth::{AuthChain, DEFAULT_SUPPORTED_KEY_TYPES};
use gangway_core::transport::{Handshake, NewChannel, ServerSession, Transport};
use gangway_core::{Keystore, Result, ServerOptions};

use super::handlers::{HandlerRegistry, RequestDispatch};
use super::{ChannelContext, ChannelHandler, RequestHandler};
use crate::server::Server;
use crate::task::{Handler, TaskArgs, TaskContext, TaskTemplate};

/// Remote-access protocol server.
///
/// Composed on the base [`Server`]: every accepted connection is upgraded
/// through the external secure transport with the keystore's host key and
/// the standard authentication chain, then multiplexed into channels and
/// requests against this server's handler registry.
pub struct ProtocolServer {
    server: Server,
    registry: Arc<HandlerRegistry>,
}

impl std::fmt::Debug for ProtocolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolServer").finish_non_exhaustive()
    }
}

impl ProtocolServer {
    /// Bind a protocol server.
    ///
    /// Fails up front when the keystore has no host key: a server that
    /// cannot prove its identity must not accept a single handshake.
    pub async fn listen(
        options: &ServerOptions,
        keystore: Arc<Keystore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let supported = DEFAULT_SUPPORTED_KEY_TYPES
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self::listen_with_key_types(options, keystore, transport, supported).await
    }

    /// Bind a protocol server accepting the given public-key algorithms.
    pub async fn listen_with_key_types(
        options: &ServerOptions,
        keystore: Arc<Keystore>,
        transport: Arc<dyn Transport>,
        supported_key_types: Vec<String>,
    ) -> Result<Self> {
        // Checked before any handshake can be attempted.
        keystore.host_key()?;

        let registry = Arc::new(HandlerRegistry::new());
        let auth = Arc::new(AuthChain::standard(
            Arc::clone(&keystore),
            supported_key_types,
        ));

        let handler = Arc::new(ProtocolHandler {
            keystore,
            transport,
            auth,
            registry: Arc::clone(&registry),
        });
        let server = Server::listen(options, TaskTemplate::new(handler)).await?;

        Ok(Self { server, registry })
    }

    /// Register a handler for a channel type.
    pub fn register_channel_handler(&self, channel_type: &str, handler: Arc<dyn ChannelHandler>) {
        self.registry.register_channel(channel_type, handler);
    }

    /// Register a handler for a request type.
    pub fn register_request_handler(&self, request_type: &str, handler: Arc<dyn RequestHandler>) {
        self.registry.register_request(request_type, handler);
    }

    /// Replace the fallback channel handler.
    pub fn set_default_channel_handler(&self, handler: Arc<dyn ChannelHandler>) {
        self.registry.set_default_channel(handler);
    }

    /// Replace the fallback request handler.
    pub fn set_default_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.registry.set_default_request(handler);
    }

    /// A channel handler that accepts the channel and serves its requests
    /// from this server's request table. Register it for the channel types
    /// the application wants served.
    pub fn request_dispatch(&self) -> Arc<dyn ChannelHandler> {
        Arc::new(RequestDispatch::new(&self.registry))
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Accept and serve connections until stopped.
    pub async fn serve(&self) -> Result<()> {
        self.server.serve().await
    }

    /// Stop the server; see [`Server::stop`].
    pub async fn stop(&self) -> Result<()> {
        self.server.stop().await
    }
}

// =============================================================================
// Connection Handler
// =============================================================================

/// The connection handler bound into the base server's task template.
struct ProtocolHandler {
    keystore: Arc<Keystore>,
    transport: Arc<dyn Transport>,
    auth: Arc<AuthChain>,
    registry: Arc<HandlerRegistry>,
}

#[async_trait]
impl Handler for ProtocolHandler {
    async fn handle(
        &self,
        cx: &TaskContext,
        conn: &mut TcpStream,
        _args: &TaskArgs,
    ) -> Result<()> {
        let host_key = self.keystore.host_key()?;
        let handshake = Handshake {
            host_key,
            auth: Arc::clone(&self.auth),
        };

        let mut session = self.transport.establish(conn, handshake).await?;
        info!(
            connection = cx.connection,
            addr = %session.remote_addr(),
            user = %session.username(),
            "session established"
        );

        let result = self.dispatch_channels(cx, session.as_mut()).await;
        if let Err(e) = session.close().await {
            debug!(connection = cx.connection, error = %e, "session close failed");
        }
        result
    }
}

impl ProtocolHandler {
    /// Outer dispatch loop: multiplex incoming channels onto handler tasks.
    ///
    /// Each channel runs on its own task tagged with its channel index; the
    /// loop keeps accepting further channels without waiting, but does not
    /// return before every spawned channel task has completed, so connection
    /// teardown cannot race ahead of in-flight channel work.
    async fn dispatch_channels(
        &self,
        cx: &TaskContext,
        session: &mut (dyn ServerSession + '_),
    ) -> Result<()> {
        let mut channels = JoinSet::new();
        let mut index: u64 = 0;

        loop {
            let proposal = match session.next_channel().await {
                Ok(Some(proposal)) => proposal,
                Ok(None) => break,
                Err(e) => {
                    // The session is gone; the channels already spawned
                    // still get their join below.
                    debug!(connection = cx.connection, error = %e, "channel stream ended");
                    break;
                }
            };

            let ccx = ChannelContext::new(cx, index);
            index += 1;

            let handler = self.registry.channel_handler(proposal.channel_type());
            debug!(
                connection = ccx.connection,
                channel = ccx.channel,
                channel_type = proposal.channel_type(),
                "dispatching channel"
            );

            channels.spawn(async move {
                if let Err(e) = handler.handle(&ccx, proposal).await {
                    error!(
                        connection = ccx.connection,
                        channel = ccx.channel,
                        error = %e,
                        "channel handler failed"
                    );
                }
            });
        }

        while let Some(joined) = channels.join_next().await {
            if let Err(e) = joined {
                warn!(connection = cx.connection, error = %e, "channel task panicked");
            }
        }

        debug!(connection = cx.connection, channels = index, "connection dispatch finished");
        Ok(())
    }
}
