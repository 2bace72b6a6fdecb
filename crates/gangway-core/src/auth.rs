//! Authentication policy: callback chain and permission grants.
//!
//! The secure transport negotiates authentication attempts with the peer and
//! hands each attempt to an [`AuthChain`]. The chain resolves the attempt
//! against the callback registered for its method, logs the outcome, and
//! genericizes every failure before it travels back toward the peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ssh_key::{public::PublicKey, HashAlg};
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::keystore::Keystore;

/// Key algorithms accepted by default.
pub const DEFAULT_SUPPORTED_KEY_TYPES: &[&str] = &["ssh-ed25519"];

// =============================================================================
// Attempts and Grants
// =============================================================================

/// One authentication attempt presented by a peer.
#[derive(Debug, Clone)]
pub struct AuthAttempt {
    /// The username the peer is authenticating as.
    pub username: String,
    /// The method and its credential material.
    pub method: AuthMethod,
}

/// Authentication method carried by an attempt.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Public-key authentication; the transport has already verified
    /// possession of the private key.
    PublicKey(PublicKey),
    /// Password authentication.
    Password(String),
    /// Keyboard-interactive authentication.
    KeyboardInteractive,
    /// No authentication offered.
    None,
}

impl AuthMethod {
    /// Wire name of the method.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::Password(_) => "password",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
            AuthMethod::None => "none",
        }
    }
}

/// Permissions granted by a successful authentication callback.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    /// Options the connection must honor (e.g. the fingerprint that
    /// authenticated it).
    pub critical_options: HashMap<String, String>,
    /// Capability markers for downstream handlers.
    pub extensions: HashMap<String, String>,
}

// =============================================================================
// Callback Chain
// =============================================================================

/// A single authentication callback.
#[async_trait]
pub trait AuthCallback: Send + Sync {
    /// Wire name of the method this callback serves.
    fn method(&self) -> &'static str;

    /// Resolve one attempt into a grant or an error. The error returned here
    /// is internal; the chain genericizes it before it reaches the peer.
    async fn authenticate(&self, attempt: &AuthAttempt) -> Result<Permissions>;
}

/// Ordered chain of authentication callbacks, tried by method name.
pub struct AuthChain {
    callbacks: Vec<Arc<dyn AuthCallback>>,
}

impl AuthChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    /// Append a callback to the chain.
    pub fn push(mut self, callback: Arc<dyn AuthCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// The fixed standard chain: public-key with real verification, then
    /// password, keyboard-interactive and none, each rejecting outright.
    pub fn standard(keystore: Arc<Keystore>, supported_key_types: Vec<String>) -> Self {
        Self::new()
            .push(Arc::new(PublicKeyAuth {
                keystore,
                supported_key_types,
            }))
            .push(Arc::new(RejectAll::new("password")))
            .push(Arc::new(RejectAll::new("keyboard-interactive")))
            .push(Arc::new(RejectAll::new("none")))
    }

    /// Resolve one attempt.
    ///
    /// A success is logged at info level with the remote address and method;
    /// a failure is logged at error level with the method and the internal
    /// reason, and is returned as the generic [`Error::AuthenticationFailed`]
    /// so the peer learns nothing about why.
    pub async fn verify(&self, remote: SocketAddr, attempt: &AuthAttempt) -> Result<Permissions> {
        let method = attempt.method.name();
        let Some(callback) = self.callbacks.iter().find(|c| c.method() == method) else {
            error!(
                addr = %remote,
                method,
                "no callback registered for authentication method"
            );
            return Err(Error::AuthenticationFailed);
        };

        match callback.authenticate(attempt).await {
            Ok(permissions) => {
                info!(addr = %remote, user = %attempt.username, method, "authenticated");
                Ok(permissions)
            }
            Err(reason) => {
                error!(addr = %remote, method, reason = %reason, "authentication failed");
                Err(Error::AuthenticationFailed)
            }
        }
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Callbacks
// =============================================================================

/// Public-key authentication against the keystore's known keys.
pub struct PublicKeyAuth {
    keystore: Arc<Keystore>,
    supported_key_types: Vec<String>,
}

impl PublicKeyAuth {
    /// Create a public-key callback over the given keystore.
    pub fn new(keystore: Arc<Keystore>, supported_key_types: Vec<String>) -> Self {
        Self {
            keystore,
            supported_key_types,
        }
    }
}

#[async_trait]
impl AuthCallback for PublicKeyAuth {
    fn method(&self) -> &'static str {
        "publickey"
    }

    async fn authenticate(&self, attempt: &AuthAttempt) -> Result<Permissions> {
        let AuthMethod::PublicKey(key) = &attempt.method else {
            return Err(Error::AuthenticationFailed);
        };

        // Unsupported algorithms are refused before the keystore is consulted.
        let algorithm = key.algorithm();
        if !self
            .supported_key_types
            .iter()
            .any(|t| t == algorithm.as_str())
        {
            return Err(Error::KeyTypeNotSupported {
                algorithm: algorithm.as_str().to_string(),
            });
        }

        // "not known" and "key mismatch" are indistinguishable from here on.
        if !self.keystore.check_known_host(&attempt.username, key) {
            return Err(Error::AuthenticationFailed);
        }

        let mut permissions = Permissions::default();
        permissions.critical_options.insert(
            "pubkey-fp".into(),
            key.fingerprint(HashAlg::Sha256).to_string(),
        );
        permissions
            .extensions
            .insert("permit-X11-forwarding".into(), "true".into());
        permissions
            .extensions
            .insert("permit-agent-forwarding".into(), "true".into());
        Ok(permissions)
    }
}

/// Callback that rejects every attempt for its method.
pub struct RejectAll {
    method: &'static str,
}

impl RejectAll {
    /// Create a rejecting callback for the given method name.
    pub fn new(method: &'static str) -> Self {
        Self { method }
    }
}

#[async_trait]
impl AuthCallback for RejectAll {
    fn method(&self) -> &'static str {
        self.method
    }

    async fn authenticate(&self, _attempt: &AuthAttempt) -> Result<Permissions> {
        Err(Error::transport("authentication method not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::generate_host_key;

    fn test_remote() -> SocketAddr {
        "127.0.0.1:40022".parse().unwrap()
    }

    fn supported() -> Vec<String> {
        DEFAULT_SUPPORTED_KEY_TYPES
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn pubkey_attempt(user: &str, key: PublicKey) -> AuthAttempt {
        AuthAttempt {
            username: user.into(),
            method: AuthMethod::PublicKey(key),
        }
    }

    #[tokio::test]
    async fn known_key_is_granted_with_fingerprint() {
        let keystore = Arc::new(Keystore::empty());
        let key = generate_host_key().unwrap().public_key().clone();
        keystore.add_known_host("alice", key.clone());

        let callback = PublicKeyAuth::new(keystore, supported());
        let permissions = callback
            .authenticate(&pubkey_attempt("alice", key.clone()))
            .await
            .unwrap();

        assert_eq!(
            permissions.critical_options.get("pubkey-fp").unwrap(),
            &key.fingerprint(HashAlg::Sha256).to_string()
        );
        assert_eq!(
            permissions.extensions.get("permit-agent-forwarding"),
            Some(&"true".to_string())
        );
    }

    #[tokio::test]
    async fn unsupported_algorithm_is_refused_before_keystore() {
        let keystore = Arc::new(Keystore::empty());
        let key = generate_host_key().unwrap().public_key().clone();
        // Supported list that excludes ed25519: the keystore is never asked.
        keystore.add_known_host("alice", key.clone());
        let callback = PublicKeyAuth::new(keystore, vec!["ssh-rsa".into()]);

        let err = callback
            .authenticate(&pubkey_attempt("alice", key))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyTypeNotSupported { .. }));
    }

    #[tokio::test]
    async fn unknown_user_is_generic_failure() {
        let keystore = Arc::new(Keystore::empty());
        let key = generate_host_key().unwrap().public_key().clone();
        let callback = PublicKeyAuth::new(keystore, supported());

        let err = callback
            .authenticate(&pubkey_attempt("mallory", key))
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn mismatched_key_is_indistinguishable_from_unknown_user() {
        let keystore = Arc::new(Keystore::empty());
        let recorded = generate_host_key().unwrap().public_key().clone();
        let presented = generate_host_key().unwrap().public_key().clone();
        keystore.add_known_host("alice", recorded);

        let callback = PublicKeyAuth::new(keystore, supported());
        let err = callback
            .authenticate(&pubkey_attempt("alice", presented))
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn chain_genericizes_every_failure() {
        let keystore = Arc::new(Keystore::empty());
        let chain = AuthChain::standard(keystore, supported());

        // An unrecorded key surfaces as the generic error.
        let odd_key = generate_host_key().unwrap().public_key().clone();
        let err = chain
            .verify(test_remote(), &pubkey_attempt("alice", odd_key))
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());

        // Unsupported methods surface as the generic error as well.
        let err = chain
            .verify(
                test_remote(),
                &AuthAttempt {
                    username: "alice".into(),
                    method: AuthMethod::Password("secret".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn chain_grants_for_known_key() {
        let keystore = Arc::new(Keystore::empty());
        let key = generate_host_key().unwrap().public_key().clone();
        keystore.add_known_host("bob", key.clone());

        let chain = AuthChain::standard(keystore, supported());
        let permissions = chain
            .verify(test_remote(), &pubkey_attempt("bob", key))
            .await
            .unwrap();
        assert!(permissions.critical_options.contains_key("pubkey-fp"));
    }

    #[test]
    fn method_names() {
        assert_eq!(AuthMethod::KeyboardInteractive.name(), "keyboard-interactive");
        assert_eq!(AuthMethod::None.name(), "none");
        assert_eq!(AuthMethod::Password(String::new()).name(), "password");
    }
}
