//! Secure-transport abstraction.
//!
//! The cryptographic transport (key exchange, encryption, wire framing) is an
//! external collaborator. This module defines the traits through which the
//! protocol server consumes it as a completed cryptographic channel:
//!
//! - [`Transport`] upgrades an accepted stream into an authenticated
//!   [`ServerSession`], driving the caller's [`AuthChain`] during the
//!   negotiation.
//! - [`ServerSession`] yields incoming logical channels.
//! - [`NewChannel`] is a channel-open proposal that must be accepted or
//!   rejected; accepting yields the channel data stream and its request
//!   stream.
//!
//! Requests within one channel are delivered in arrival order; ordering
//! across channels is not guaranteed.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ssh_key::private::PrivateKey;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::auth::{AuthChain, Permissions};
use crate::error::{Error, Result};

// =============================================================================
// Channel Open
// =============================================================================

/// Why a channel-open proposal was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No handler recognizes the declared channel type.
    UnknownChannelType,
    /// Policy forbids the channel.
    Prohibited,
    /// The channel target could not be reached.
    ConnectFailed,
    /// The server is out of capacity for channels.
    ResourceShortage,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RejectReason::UnknownChannelType => "unknown channel type",
            RejectReason::Prohibited => "administratively prohibited",
            RejectReason::ConnectFailed => "connect failed",
            RejectReason::ResourceShortage => "resource shortage",
        };
        f.write_str(name)
    }
}

/// An incoming channel-open proposal.
///
/// Every proposal must be answered: accepted into an [`AcceptedChannel`] or
/// rejected with a [`RejectReason`]. Dropping a proposal unanswered is a
/// transport-visible protocol violation.
#[async_trait]
pub trait NewChannel: Send {
    /// The channel type string declared by the peer.
    fn channel_type(&self) -> &str;

    /// Opaque type-specific payload attached to the open proposal.
    fn extra_data(&self) -> &[u8];

    /// Accept the channel.
    async fn accept(self: Box<Self>) -> Result<AcceptedChannel>;

    /// Reject the channel with a reason and human-readable message.
    async fn reject(self: Box<Self>, reason: RejectReason, message: &str) -> Result<()>;
}

/// An accepted channel: its byte stream plus its request stream.
pub struct AcceptedChannel {
    /// Bidirectional data stream of the channel.
    pub channel: Arc<dyn ChannelData>,
    /// Inbound requests, delivered in arrival order.
    pub requests: mpsc::Receiver<Request>,
}

/// Byte-level I/O on an accepted channel.
#[async_trait]
pub trait ChannelData: Send + Sync {
    /// Send data to the peer.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Receive the next data block; `None` when the peer closed the channel.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

// =============================================================================
// Requests
// =============================================================================

/// Reply to a channel request.
#[derive(Debug, Clone)]
pub struct RequestReply {
    /// Whether the request was honored.
    pub success: bool,
    /// Optional reply payload.
    pub payload: Bytes,
}

/// A typed message received on a channel, optionally expecting a reply.
#[derive(Debug)]
pub struct Request {
    request_type: String,
    payload: Bytes,
    want_reply: bool,
    reply_tx: Option<oneshot::Sender<RequestReply>>,
}

impl Request {
    /// Build a request. Transports pass a reply sender exactly when the peer
    /// asked for a reply.
    pub fn new(
        request_type: impl Into<String>,
        payload: Bytes,
        want_reply: bool,
        reply_tx: Option<oneshot::Sender<RequestReply>>,
    ) -> Self {
        Self {
            request_type: request_type.into(),
            payload,
            want_reply,
            reply_tx,
        }
    }

    /// The request type string.
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// The request payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the peer expects a reply.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Answer the request. Consumes the request so it can be answered at
    /// most once; a request that wanted no reply ignores the call.
    pub fn reply(mut self, success: bool, payload: &[u8]) -> Result<()> {
        if !self.want_reply {
            return Ok(());
        }
        let tx = self.reply_tx.take().ok_or(Error::ConnectionClosed)?;
        tx.send(RequestReply {
            success,
            payload: Bytes::copy_from_slice(payload),
        })
        .map_err(|_| Error::ConnectionClosed)
    }
}

// =============================================================================
// Session and Transport
// =============================================================================

/// An authenticated protocol session over one physical connection.
#[async_trait]
pub trait ServerSession: Send {
    /// Remote peer address.
    fn remote_addr(&self) -> SocketAddr;

    /// Username that authenticated the session.
    fn username(&self) -> &str;

    /// Permissions granted during authentication.
    fn permissions(&self) -> &Permissions;

    /// The next incoming channel-open proposal; `None` once the peer has
    /// closed the connection.
    async fn next_channel(&mut self) -> Result<Option<Box<dyn NewChannel>>>;

    /// Close the session.
    async fn close(&mut self) -> Result<()>;
}

/// Parameters for the cryptographic upgrade of one connection.
pub struct Handshake {
    /// The server's signing identity.
    pub host_key: PrivateKey,
    /// Authentication policy; the transport must obtain a grant from this
    /// chain before surfacing any channel.
    pub auth: Arc<AuthChain>,
}

/// The external secure transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Upgrade an accepted stream into an authenticated session.
    ///
    /// Performs key exchange with the handshake's host key, then drives the
    /// authentication chain until one callback grants permissions. Fails
    /// with the generic authentication error when no attempt succeeds.
    async fn establish<'a>(
        &'a self,
        stream: &'a mut TcpStream,
        handshake: Handshake,
    ) -> Result<Box<dyn ServerSession + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_display() {
        assert_eq!(
            RejectReason::UnknownChannelType.to_string(),
            "unknown channel type"
        );
        assert_eq!(RejectReason::Prohibited.to_string(), "administratively prohibited");
    }

    #[tokio::test]
    async fn reply_reaches_the_transport_side() {
        let (tx, rx) = oneshot::channel();
        let request = Request::new("ping", Bytes::from_static(b"payload"), true, Some(tx));

        assert_eq!(request.request_type(), "ping");
        assert!(request.want_reply());
        request.reply(true, b"pong").unwrap();

        let reply = rx.await.unwrap();
        assert!(reply.success);
        assert_eq!(&reply.payload[..], b"pong");
    }

    #[tokio::test]
    async fn reply_without_want_reply_is_a_no_op() {
        let request = Request::new("notify", Bytes::new(), false, None);
        request.reply(false, &[]).unwrap();
    }

    #[tokio::test]
    async fn reply_after_peer_went_away_is_an_error() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let request = Request::new("ping", Bytes::new(), true, Some(tx));
        assert!(matches!(
            request.reply(true, &[]),
            Err(Error::ConnectionClosed)
        ));
    }
}
