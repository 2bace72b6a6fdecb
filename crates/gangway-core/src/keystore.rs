//! Keystore: the host signing identity and the set of recognized peer keys.
//!
//! One keystore is shared by every connection handler of a protocol server.
//! Readers (host-key lookup, known-host checks) run concurrently; writers
//! (host-key replacement, known-host registration) take the write lock.

use std::collections::HashMap;
use std::sync::RwLock;

use ssh_key::{private::PrivateKey, public::PublicKey, Algorithm, LineEnding};

use crate::error::{Error, Result};

/// Concurrency-safe store of one host signing key and the public keys known
/// for each peer identifier.
#[derive(Debug, Default)]
pub struct Keystore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    host_key: Option<PrivateKey>,
    user_keys: HashMap<String, PublicKey>,
}

impl Keystore {
    /// Create a keystore from OpenSSH-encoded private key material.
    ///
    /// Empty key material is a construction error. Encrypted keys require
    /// the matching passphrase; supplying a passphrase for an unencrypted
    /// key is an error as well, since it means the caller holds a different
    /// key than they think.
    pub fn new(private_pem: &[u8], passphrase: Option<&str>) -> Result<Self> {
        if private_pem.is_empty() {
            return Err(Error::KeyMaterial {
                message: "no private key provided".into(),
            });
        }

        let signer = parse_host_key(private_pem, passphrase)?;

        Ok(Self {
            inner: RwLock::new(Inner {
                host_key: Some(signer),
                user_keys: HashMap::new(),
            }),
        })
    }

    /// Create an empty keystore with no host key set.
    ///
    /// `host_key` fails until `set_host_key` succeeds once.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replace the host key with newly parsed key material.
    ///
    /// The material is parsed before the write lock is taken; a parse
    /// failure leaves the current host key in place.
    pub fn set_host_key(&self, private_pem: &[u8]) -> Result<()> {
        let signer = parse_host_key(private_pem, None)?;
        let mut inner = self.inner.write().expect("keystore lock poisoned");
        inner.host_key = Some(signer);
        Ok(())
    }

    /// The current host key, or [`Error::NoHostKey`] when none has been set.
    pub fn host_key(&self) -> Result<PrivateKey> {
        let inner = self.inner.read().expect("keystore lock poisoned");
        inner.host_key.clone().ok_or(Error::NoHostKey)
    }

    /// Record the public key for an identifier, overwriting any previous one.
    pub fn add_known_host(&self, identifier: &str, key: PublicKey) {
        let mut inner = self.inner.write().expect("keystore lock poisoned");
        inner.user_keys.insert(identifier.to_string(), key);
    }

    /// Check whether `key` is the recorded key for `identifier`.
    ///
    /// An unknown identifier is `false`, not an error. A recorded key only
    /// matches when both the algorithm and the raw encoded key bytes are
    /// identical.
    pub fn check_known_host(&self, identifier: &str, key: &PublicKey) -> bool {
        let inner = self.inner.read().expect("keystore lock poisoned");
        match inner.user_keys.get(identifier) {
            Some(known) => compare_public_keys(known, key),
            None => false,
        }
    }
}

fn parse_host_key(private_pem: &[u8], passphrase: Option<&str>) -> Result<PrivateKey> {
    let parsed = PrivateKey::from_openssh(private_pem).map_err(|e| Error::KeyMaterial {
        message: format!("could not parse private key: {}", e),
    })?;

    match (parsed.is_encrypted(), passphrase) {
        (false, None) => Ok(parsed),
        (true, Some(pass)) => parsed.decrypt(pass).map_err(|e| Error::KeyMaterial {
            message: format!("could not decrypt private key: {}", e),
        }),
        (true, None) => Err(Error::KeyMaterial {
            message: "private key is encrypted but no passphrase was provided".into(),
        }),
        (false, Some(_)) => Err(Error::KeyMaterial {
            message: "passphrase provided for an unencrypted private key".into(),
        }),
    }
}

fn compare_public_keys(a: &PublicKey, b: &PublicKey) -> bool {
    if a.algorithm() != b.algorithm() {
        return false;
    }
    a.key_data() == b.key_data()
}

/// Generate a fresh ed25519 host key.
///
/// Used for bootstrap setups and tests that need a throwaway identity.
pub fn generate_host_key() -> Result<PrivateKey> {
    PrivateKey::random(&mut ssh_key::rand_core::OsRng, Algorithm::Ed25519).map_err(|e| {
        Error::KeyMaterial {
            message: format!("could not generate host key: {}", e),
        }
    })
}

/// Encode a private key as OpenSSH PEM bytes.
pub fn encode_private_key(key: &PrivateKey) -> Result<Vec<u8>> {
    let pem = key.to_openssh(LineEnding::LF).map_err(|e| Error::KeyMaterial {
        message: format!("could not encode private key: {}", e),
    })?;
    Ok(pem.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use ssh_key::HashAlg;

    fn fresh_pem() -> (PrivateKey, Vec<u8>) {
        let key = generate_host_key().unwrap();
        let pem = encode_private_key(&key).unwrap();
        (key, pem)
    }

    #[test]
    fn new_rejects_empty_material() {
        let err = Keystore::new(b"", None).unwrap_err();
        assert!(matches!(err, Error::KeyMaterial { .. }));
    }

    #[test]
    fn new_rejects_garbage_material() {
        let err = Keystore::new(b"not a key", None).unwrap_err();
        assert!(matches!(err, Error::KeyMaterial { .. }));
    }

    #[test]
    fn host_key_unset_is_distinguished_error() {
        let ks = Keystore::empty();
        assert!(matches!(ks.host_key(), Err(Error::NoHostKey)));
    }

    #[test]
    fn set_and_get_host_key_round_trip() {
        let (original, pem) = fresh_pem();
        let ks = Keystore::empty();
        ks.set_host_key(&pem).unwrap();

        let retrieved = ks.host_key().unwrap();
        assert_eq!(
            retrieved.public_key().key_data(),
            original.public_key().key_data()
        );
    }

    #[test]
    fn failed_set_host_key_keeps_old_key() {
        let (original, pem) = fresh_pem();
        let ks = Keystore::new(&pem, None).unwrap();

        assert!(ks.set_host_key(b"broken").is_err());

        let retrieved = ks.host_key().unwrap();
        assert_eq!(
            retrieved.public_key().key_data(),
            original.public_key().key_data()
        );
    }

    #[test]
    fn encrypted_key_needs_passphrase() {
        let key = generate_host_key().unwrap();
        let encrypted = key
            .encrypt(&mut ssh_key::rand_core::OsRng, "hunter2")
            .unwrap();
        let pem = encode_private_key(&encrypted).unwrap();

        assert!(Keystore::new(&pem, None).is_err());

        let ks = Keystore::new(&pem, Some("hunter2")).unwrap();
        let retrieved = ks.host_key().unwrap();
        assert_eq!(
            retrieved.public_key().key_data(),
            key.public_key().key_data()
        );
    }

    #[test]
    fn host_key_signs_verifiable_data() {
        let (original, pem) = fresh_pem();
        let ks = Keystore::new(&pem, None).unwrap();

        let msg = b"attestation payload";
        let sig = ks
            .host_key()
            .unwrap()
            .sign("gangway", HashAlg::Sha256, msg)
            .unwrap();

        original
            .public_key()
            .verify("gangway", msg, &sig)
            .expect("signature must verify against the original public key");
    }

    #[test]
    fn check_known_host_unknown_identifier_is_false() {
        let ks = Keystore::empty();
        let key = generate_host_key().unwrap().public_key().clone();
        assert!(!ks.check_known_host("nobody", &key));
    }

    #[test]
    fn add_and_check_known_host() {
        let ks = Keystore::empty();
        let key = generate_host_key().unwrap().public_key().clone();
        let other = generate_host_key().unwrap().public_key().clone();

        ks.add_known_host("example.com", key.clone());

        assert!(ks.check_known_host("example.com", &key));
        // Different key for a known identifier: false, not an error.
        assert!(!ks.check_known_host("example.com", &other));
    }

    #[test]
    fn check_known_host_is_repeatable() {
        let ks = Keystore::empty();
        let key = generate_host_key().unwrap().public_key().clone();
        ks.add_known_host("peer", key.clone());

        for _ in 0..16 {
            assert!(ks.check_known_host("peer", &key));
        }
    }

    #[test]
    fn add_known_host_overwrites() {
        let ks = Keystore::empty();
        let first = generate_host_key().unwrap().public_key().clone();
        let second = generate_host_key().unwrap().public_key().clone();

        ks.add_known_host("peer", first.clone());
        ks.add_known_host("peer", second.clone());

        assert!(!ks.check_known_host("peer", &first));
        assert!(ks.check_known_host("peer", &second));
    }

    #[test]
    fn concurrent_writers_do_not_corrupt_state() {
        let (_, pem) = fresh_pem();
        let ks = Arc::new(Keystore::new(&pem, None).unwrap());
        let pub_key = generate_host_key().unwrap().public_key().clone();

        let mut handles = Vec::new();
        for i in 0..8 {
            let ks = Arc::clone(&ks);
            let pem = pem.clone();
            let key = pub_key.clone();
            handles.push(thread::spawn(move || {
                for j in 0..32 {
                    ks.set_host_key(&pem).unwrap();
                    ks.add_known_host(&format!("peer-{}-{}", i, j), key.clone());
                    let _ = ks.check_known_host(&format!("peer-{}-{}", i, j), &key);
                    let _ = ks.host_key().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(ks.check_known_host("peer-0-0", &pub_key));
    }
}
