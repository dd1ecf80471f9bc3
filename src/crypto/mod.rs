//! Cryptographic layer for the tunnel session.
//!
//! The secure channel is delegated to the Noise Protocol (IK pattern) via
//! `snow`: the client knows the server's static public key ahead of time and
//! proves possession of its own static key during the handshake. Nothing in
//! this crate invents cryptography; this module only wraps key handling and
//! the handshake state machine.

mod handshake;
mod keys;

pub use handshake::{HandshakeRole, NoiseHandshake, NoiseTransport};
pub use keys::{KeyPair, PrivateKey, PublicKey};

use thiserror::Error;

/// Noise pattern used for the session handshake.
/// IK: the initiator knows the responder's static key, which doubles as an
/// anti-probing measure, and both sides end up mutually authenticated.
pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_SHA256";

/// Length of an X25519 key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the AEAD authentication tag appended to every record
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Handshake incomplete")]
    HandshakeIncomplete,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),
}

/// Fill `buf` with cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("system RNG failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random_bytes(&mut a);
        random_bytes(&mut b);
        assert_ne!(a, b);
    }
}
