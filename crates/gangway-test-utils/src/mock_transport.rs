//! Mock secure transport for testing without a real cryptographic stack.
//!
//! The mock pairs each server-side `establish` call with a client-side
//! `connect` call in order, so tests drive clients sequentially: dial the
//! server over TCP (to exercise the accept loop), then call
//! [`MockConnector::connect`] with the auth attempts the client should
//! present. Channel opens, requests, replies and data all travel over
//! in-memory channels.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use gangway_core::auth::{AuthAttempt, Permissions};
use gangway_core::transport::{
    AcceptedChannel, ChannelData, Handshake, NewChannel, RejectReason, Request, RequestReply,
    ServerSession, Transport,
};
use gangway_core::{Error, Result};

/// Create a connected mock transport and its client-side connector.
pub fn mock_transport() -> (Arc<MockTransport>, MockConnector) {
    let (tx, rx) = mpsc::channel(16);
    (
        Arc::new(MockTransport {
            pending: Mutex::new(rx),
        }),
        MockConnector { tx },
    )
}

// =============================================================================
// Transport (server side)
// =============================================================================

/// In-memory [`Transport`] implementation.
pub struct MockTransport {
    pending: Mutex<mpsc::Receiver<PendingLink>>,
}

struct PendingLink {
    attempts: Vec<AuthAttempt>,
    result_tx: oneshot::Sender<Result<MockClientSession>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn establish<'a>(
        &'a self,
        stream: &'a mut TcpStream,
        handshake: Handshake,
    ) -> Result<Box<dyn ServerSession + 'a>> {
        let remote = stream.peer_addr()?;
        let link = self
            .pending
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)?;

        // Drive the auth chain over the scripted attempts; no channel is
        // surfaced before a grant.
        let mut granted: Option<(String, Permissions)> = None;
        for attempt in &link.attempts {
            if let Ok(permissions) = handshake.auth.verify(remote, attempt).await {
                granted = Some((attempt.username.clone(), permissions));
                break;
            }
        }

        let Some((username, permissions)) = granted else {
            let _ = link.result_tx.send(Err(Error::AuthenticationFailed));
            return Err(Error::AuthenticationFailed);
        };

        let (open_tx, open_rx) = mpsc::channel(16);
        let _ = link.result_tx.send(Ok(MockClientSession {
            open_tx,
            username: username.clone(),
        }));

        Ok(Box::new(MockServerSession {
            remote,
            username,
            permissions,
            open_rx,
        }))
    }
}

struct MockServerSession {
    remote: SocketAddr,
    username: String,
    permissions: Permissions,
    open_rx: mpsc::Receiver<OpenProposal>,
}

#[async_trait]
impl ServerSession for MockServerSession {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    async fn next_channel(&mut self) -> Result<Option<Box<dyn NewChannel>>> {
        Ok(self
            .open_rx
            .recv()
            .await
            .map(|proposal| Box::new(MockNewChannel { proposal }) as Box<dyn NewChannel>))
    }

    async fn close(&mut self) -> Result<()> {
        self.open_rx.close();
        Ok(())
    }
}

// =============================================================================
// Channel plumbing
// =============================================================================

struct OpenProposal {
    channel_type: String,
    extra_data: Bytes,
    decision_tx: oneshot::Sender<OpenDecision>,
}

enum OpenDecision {
    Accepted {
        data_tx: mpsc::Sender<Bytes>,
        data_rx: mpsc::Receiver<Bytes>,
        request_tx: mpsc::Sender<Request>,
    },
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

struct MockNewChannel {
    proposal: OpenProposal,
}

#[async_trait]
impl NewChannel for MockNewChannel {
    fn channel_type(&self) -> &str {
        &self.proposal.channel_type
    }

    fn extra_data(&self) -> &[u8] {
        &self.proposal.extra_data
    }

    async fn accept(self: Box<Self>) -> Result<AcceptedChannel> {
        let (s2c_tx, s2c_rx) = mpsc::channel(64);
        let (c2s_tx, c2s_rx) = mpsc::channel(64);
        let (request_tx, request_rx) = mpsc::channel(64);

        self.proposal
            .decision_tx
            .send(OpenDecision::Accepted {
                data_tx: c2s_tx,
                data_rx: s2c_rx,
                request_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        Ok(AcceptedChannel {
            channel: Arc::new(MockChannelData {
                tx: s2c_tx,
                rx: Mutex::new(c2s_rx),
            }),
            requests: request_rx,
        })
    }

    async fn reject(self: Box<Self>, reason: RejectReason, message: &str) -> Result<()> {
        self.proposal
            .decision_tx
            .send(OpenDecision::Rejected {
                reason,
                message: message.to_string(),
            })
            .map_err(|_| Error::ConnectionClosed)
    }
}

struct MockChannelData {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

#[async_trait]
impl ChannelData for MockChannelData {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.tx.send(data).await.map_err(|_| Error::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.rx.lock().await.close();
        Ok(())
    }
}

// =============================================================================
// Client side
// =============================================================================

/// Client half of the mock transport.
pub struct MockConnector {
    tx: mpsc::Sender<PendingLink>,
}

impl MockConnector {
    /// Run the mock handshake with the given auth attempts.
    ///
    /// Dial the server over TCP first so its accept loop invokes
    /// `establish`; the transport pairs the two calls in order. Fails with
    /// the generic authentication error when no attempt is granted.
    pub async fn connect(&self, attempts: Vec<AuthAttempt>) -> Result<MockClientSession> {
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(PendingLink {
                attempts,
                result_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        result_rx.await.map_err(|_| Error::ConnectionClosed)?
    }
}

/// Authenticated client-side session. Dropping it closes the session; the
/// server's channel dispatch loop then finishes.
#[derive(Debug)]
pub struct MockClientSession {
    open_tx: mpsc::Sender<OpenProposal>,
    username: String,
}

/// Outcome of a channel-open proposal, as observed by the client.
pub enum ChannelOutcome {
    /// The server accepted the channel.
    Accepted(MockClientChannel),
    /// The server rejected the channel.
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

impl MockClientSession {
    /// Username the session authenticated as.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Propose a channel of the given type.
    pub async fn open_channel(&self, channel_type: &str, extra_data: &[u8]) -> Result<ChannelOutcome> {
        let (decision_tx, decision_rx) = oneshot::channel();
        self.open_tx
            .send(OpenProposal {
                channel_type: channel_type.to_string(),
                extra_data: Bytes::copy_from_slice(extra_data),
                decision_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        match decision_rx.await.map_err(|_| Error::ConnectionClosed)? {
            OpenDecision::Accepted {
                data_tx,
                data_rx,
                request_tx,
            } => Ok(ChannelOutcome::Accepted(MockClientChannel {
                data_tx,
                data_rx: Mutex::new(data_rx),
                request_tx,
            })),
            OpenDecision::Rejected { reason, message } => {
                Ok(ChannelOutcome::Rejected { reason, message })
            }
        }
    }
}

/// Client side of an accepted channel.
pub struct MockClientChannel {
    data_tx: mpsc::Sender<Bytes>,
    data_rx: Mutex<mpsc::Receiver<Bytes>>,
    request_tx: mpsc::Sender<Request>,
}

impl MockClientChannel {
    /// Send a request; when `want_reply` is set, wait for the reply.
    pub async fn send_request(
        &self,
        request_type: &str,
        payload: &[u8],
        want_reply: bool,
    ) -> Result<Option<RequestReply>> {
        let payload = Bytes::copy_from_slice(payload);
        if want_reply {
            let (tx, rx) = oneshot::channel();
            self.request_tx
                .send(Request::new(request_type, payload, true, Some(tx)))
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            Ok(Some(rx.await.map_err(|_| Error::ConnectionClosed)?))
        } else {
            self.request_tx
                .send(Request::new(request_type, payload, false, None))
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            Ok(None)
        }
    }

    /// Send channel data to the server.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        self.data_tx
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Receive the next data block from the server; `None` when the server
    /// closed the channel.
    pub async fn recv_data(&self) -> Result<Option<Bytes>> {
        Ok(self.data_rx.lock().await.recv().await)
    }
}
