//! X25519 key handling.
//!
//! Keys travel through config files and CLI flags as base64, and the
//! server's allowed-clients list compares public keys in that encoding.

use super::{CryptoError, KEY_LEN, NOISE_PATTERN};
use std::fmt;

/// Static key pair identifying one end of the tunnel.
#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let builder = snow::Builder::new(NOISE_PATTERN.parse().unwrap());
        let keypair = builder
            .generate_keypair()
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        Ok(Self {
            public: PublicKey::from_bytes(&keypair.public)?,
            private: PrivateKey::from_bytes(&keypair.private)?,
        })
    }

    /// Reassemble a key pair from its base64 halves (as stored in config).
    pub fn from_base64(private: &str, public: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            public: PublicKey::from_base64(public)?,
            private: PrivateKey::from_base64(private)?,
        })
    }
}

/// X25519 public key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// X25519 private key. Never logged; zeroed on drop.
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        for byte in &mut self.0 {
            unsafe {
                std::ptr::write_volatile(byte, 0);
            }
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate().unwrap();
        assert_eq!(kp.public.as_bytes().len(), KEY_LEN);
        assert_eq!(kp.private.as_bytes().len(), KEY_LEN);
    }

    #[test]
    fn test_public_key_base64_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let b64 = kp.public.to_base64();
        let recovered = PublicKey::from_base64(&b64).unwrap();
        assert_eq!(kp.public, recovered);
    }

    #[test]
    fn test_keypair_from_base64() {
        let kp = KeyPair::generate().unwrap();
        let restored =
            KeyPair::from_base64(&kp.private.to_base64(), &kp.public.to_base64()).unwrap();
        assert_eq!(restored.public, kp.public);
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(PublicKey::from_base64("not-base64!!").is_err());
        assert!(PublicKey::from_bytes(&[0u8; 7]).is_err());
    }
}
