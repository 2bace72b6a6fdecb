//! gangway-test-utils: Test infrastructure for gangway.
//!
//! Provides:
//! - MockTransport: In-memory secure transport for testing without a real
//!   cryptographic stack
//! - test key helpers for generating throwaway ed25519 identities

mod mock_transport;
mod test_keys;

pub use mock_transport::{
    mock_transport, ChannelOutcome, MockClientChannel, MockClientSession, MockConnector,
    MockTransport,
};
pub use test_keys::{ed25519_keypair, ed25519_openssh};
