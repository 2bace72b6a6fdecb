//! Handler registry and the built-in default handlers.
//!
//! The registry is per server instance: two protocol servers in one process
//! never share dispatch tables. Both tables carry a default entry used for
//! unrecognized type strings.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use gangway_core::transport::{ChannelData, NewChannel, RejectReason, Request};
use gangway_core::Result;

use super::{ChannelContext, ChannelHandler, RequestHandler};

// =============================================================================
// Registry
// =============================================================================

/// Per-server dispatch tables for channel and request handlers.
pub struct HandlerRegistry {
    channel_handlers: RwLock<HashMap<String, Arc<dyn ChannelHandler>>>,
    request_handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    default_channel: RwLock<Arc<dyn ChannelHandler>>,
    default_request: RwLock<Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    /// Create a registry with the built-in defaults: unknown channel types
    /// are rejected, unknown request types get a negative reply.
    pub fn new() -> Self {
        Self {
            channel_handlers: RwLock::new(HashMap::new()),
            request_handlers: RwLock::new(HashMap::new()),
            default_channel: RwLock::new(Arc::new(RejectUnknown)),
            default_request: RwLock::new(Arc::new(NoReply)),
        }
    }

    /// Register a handler for a channel type, replacing any previous one.
    pub fn register_channel(&self, channel_type: &str, handler: Arc<dyn ChannelHandler>) {
        self.channel_handlers
            .write()
            .expect("registry lock poisoned")
            .insert(channel_type.to_string(), handler);
    }

    /// Register a handler for a request type, replacing any previous one.
    pub fn register_request(&self, request_type: &str, handler: Arc<dyn RequestHandler>) {
        self.request_handlers
            .write()
            .expect("registry lock poisoned")
            .insert(request_type.to_string(), handler);
    }

    /// Replace the fallback channel handler.
    pub fn set_default_channel(&self, handler: Arc<dyn ChannelHandler>) {
        *self.default_channel.write().expect("registry lock poisoned") = handler;
    }

    /// Replace the fallback request handler.
    pub fn set_default_request(&self, handler: Arc<dyn RequestHandler>) {
        *self.default_request.write().expect("registry lock poisoned") = handler;
    }

    /// Handler for a channel type, falling back to the default.
    pub fn channel_handler(&self, channel_type: &str) -> Arc<dyn ChannelHandler> {
        let handlers = self.channel_handlers.read().expect("registry lock poisoned");
        match handlers.get(channel_type) {
            Some(handler) => Arc::clone(handler),
            None => Arc::clone(&self.default_channel.read().expect("registry lock poisoned")),
        }
    }

    /// Handler for a request type, falling back to the default.
    pub fn request_handler(&self, request_type: &str) -> Arc<dyn RequestHandler> {
        let handlers = self.request_handlers.read().expect("registry lock poisoned");
        match handlers.get(request_type) {
            Some(handler) => Arc::clone(handler),
            None => Arc::clone(&self.default_request.read().expect("registry lock poisoned")),
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Default Handlers
// =============================================================================

/// Fallback channel handler: rejects the proposal as an unknown type.
pub struct RejectUnknown;

#[async_trait]
impl ChannelHandler for RejectUnknown {
    async fn handle(&self, cx: &ChannelContext, channel: Box<dyn NewChannel>) -> Result<()> {
        warn!(
            connection = cx.connection,
            channel = cx.channel,
            channel_type = channel.channel_type(),
            "rejecting channel of unknown type"
        );
        channel
            .reject(RejectReason::UnknownChannelType, "unknown channel type")
            .await
    }
}

/// Channel handler that accepts the channel and dispatches its requests
/// against the registry's request table.
///
/// Requests are read in arrival order and handed to one concurrent task
/// each; the channel is finished only once every spawned request task has
/// completed. Request-handler errors are logged and contained.
pub struct RequestDispatch {
    registry: Weak<HandlerRegistry>,
}

impl RequestDispatch {
    /// Create a dispatcher over a registry. The reference is weak so a
    /// registry that stores its own dispatcher does not leak.
    pub fn new(registry: &Arc<HandlerRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }
}

#[async_trait]
impl ChannelHandler for RequestDispatch {
    async fn handle(&self, cx: &ChannelContext, channel: Box<dyn NewChannel>) -> Result<()> {
        let accepted = channel.accept().await?;
        let data = accepted.channel;
        let mut requests = accepted.requests;

        let mut tasks = JoinSet::new();
        let mut index: u64 = 0;
        while let Some(request) = requests.recv().await {
            let Some(registry) = self.registry.upgrade() else {
                break;
            };
            let handler = registry.request_handler(request.request_type());
            debug!(
                connection = cx.connection,
                channel = cx.channel,
                request = index,
                request_type = request.request_type(),
                "dispatching request"
            );

            let ccx = *cx;
            let data = Arc::clone(&data);
            tasks.spawn(async move {
                if let Err(e) = handler.handle(&ccx, data, request).await {
                    error!(
                        connection = ccx.connection,
                        channel = ccx.channel,
                        error = %e,
                        "request handler failed"
                    );
                }
            });
            index += 1;
        }

        // Join every spawned request before the channel counts as finished.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(
                    connection = cx.connection,
                    channel = cx.channel,
                    error = %e,
                    "request task panicked"
                );
            }
        }

        data.close().await
    }
}

/// Fallback request handler: logs the request and answers negatively so the
/// peer is never left waiting on a wanted reply.
pub struct NoReply;

#[async_trait]
impl RequestHandler for NoReply {
    async fn handle(
        &self,
        cx: &ChannelContext,
        _channel: Arc<dyn ChannelData>,
        request: Request,
    ) -> Result<()> {
        debug!(
            connection = cx.connection,
            channel = cx.channel,
            request_type = request.request_type(),
            payload = ?request.payload(),
            want_reply = request.want_reply(),
            "no handler for request type"
        );
        request.reply(false, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;

    #[async_trait]
    impl ChannelHandler for Marker {
        async fn handle(&self, _cx: &ChannelContext, _channel: Box<dyn NewChannel>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_falls_back_to_default() {
        let registry = HandlerRegistry::new();
        let marker: Arc<dyn ChannelHandler> = Arc::new(Marker);
        registry.register_channel("session", Arc::clone(&marker));

        assert!(Arc::ptr_eq(&registry.channel_handler("session"), &marker));
        // Unregistered types resolve to the default, not to a registered one.
        assert!(!Arc::ptr_eq(&registry.channel_handler("direct-tcpip"), &marker));
    }

    #[test]
    fn registries_are_independent_per_instance() {
        let a = HandlerRegistry::new();
        let b = HandlerRegistry::new();
        let marker: Arc<dyn ChannelHandler> = Arc::new(Marker);
        a.register_channel("session", Arc::clone(&marker));

        assert!(Arc::ptr_eq(&a.channel_handler("session"), &marker));
        assert!(!Arc::ptr_eq(&b.channel_handler("session"), &marker));
    }
}
