//! Throwaway ed25519 identities for tests.

use ssh_key::{private::PrivateKey, public::PublicKey};

use gangway_core::keystore::{encode_private_key, generate_host_key};

/// Generate a fresh ed25519 keypair.
pub fn ed25519_keypair() -> (PrivateKey, PublicKey) {
    let private = generate_host_key().expect("key generation");
    let public = private.public_key().clone();
    (private, public)
}

/// Generate a fresh ed25519 key as OpenSSH PEM bytes plus its public half.
pub fn ed25519_openssh() -> (Vec<u8>, PublicKey) {
    let (private, public) = ed25519_keypair();
    let pem = encode_private_key(&private).expect("key encoding");
    (pem, public)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_per_call() {
        let (_, a) = ed25519_keypair();
        let (_, b) = ed25519_keypair();
        assert_ne!(a.key_data(), b.key_data());
    }

    #[test]
    fn pem_round_trips() {
        let (pem, public) = ed25519_openssh();
        let parsed = PrivateKey::from_openssh(&pem).unwrap();
        assert_eq!(parsed.public_key().key_data(), public.key_data());
    }
}
