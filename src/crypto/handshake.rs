//! Noise IK handshake state machine.
//!
//! Message flow (one round trip):
//! ```text
//! initiator -> e, es, s, ss
//! responder <- e, ee, se
//! ```
//! After the round trip both sides hold a [`NoiseTransport`] and the
//! responder knows the initiator's static public key for authorization.

use super::{CryptoError, KeyPair, PublicKey, NOISE_PATTERN};
use snow::{Builder, HandshakeState, TransportState};

/// Role in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Initiator (client side of the tunnel)
    Initiator,
    /// Responder (server side of the tunnel)
    Responder,
}

/// Handshake state machine wrapping `snow`.
pub struct NoiseHandshake {
    state: HandshakeState,
    role: HandshakeRole,
}

impl NoiseHandshake {
    /// Initiator handshake. Requires the responder's static public key.
    pub fn initiator(local: &KeyPair, remote: &PublicKey) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().unwrap())
            .local_private_key(local.private.as_bytes())
            .remote_public_key(remote.as_bytes())
            .build_initiator()?;

        Ok(Self {
            state,
            role: HandshakeRole::Initiator,
        })
    }

    /// Responder handshake.
    pub fn responder(local: &KeyPair) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().unwrap())
            .local_private_key(local.private.as_bytes())
            .build_responder()?;

        Ok(Self {
            state,
            role: HandshakeRole::Responder,
        })
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Produce the next handshake message into `output`, returning its size.
    pub fn write_message(&mut self, payload: &[u8], output: &mut [u8]) -> Result<usize, CryptoError> {
        self.state
            .write_message(payload, output)
            .map_err(CryptoError::Noise)
    }

    /// Consume an incoming handshake message, returning the payload size.
    pub fn read_message(&mut self, message: &[u8], payload: &mut [u8]) -> Result<usize, CryptoError> {
        self.state
            .read_message(message, payload)
            .map_err(CryptoError::Noise)
    }

    /// The peer's static public key, available once the handshake has seen it.
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.state
            .get_remote_static()
            .and_then(|bytes| PublicKey::from_bytes(bytes).ok())
    }

    /// Switch to transport mode. Fails if the handshake is unfinished.
    pub fn into_transport(self) -> Result<NoiseTransport, CryptoError> {
        if !self.is_finished() {
            return Err(CryptoError::HandshakeIncomplete);
        }
        let transport = self.state.into_transport_mode().map_err(CryptoError::Noise)?;
        Ok(NoiseTransport { state: transport })
    }
}

/// Post-handshake transport state: one AEAD cipher per direction.
pub struct NoiseTransport {
    state: TransportState,
}

impl NoiseTransport {
    /// Encrypt one record. `output` must hold `plaintext.len() + TAG_LEN`.
    pub fn encrypt(&mut self, plaintext: &[u8], output: &mut [u8]) -> Result<usize, CryptoError> {
        self.state
            .write_message(plaintext, output)
            .map_err(CryptoError::Noise)
    }

    /// Decrypt one record into `output`, returning the plaintext size.
    pub fn decrypt(&mut self, ciphertext: &[u8], output: &mut [u8]) -> Result<usize, CryptoError> {
        self.state
            .read_message(ciphertext, output)
            .map_err(CryptoError::Noise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (NoiseTransport, NoiseTransport, PublicKey, PublicKey) {
        let server_kp = KeyPair::generate().unwrap();
        let client_kp = KeyPair::generate().unwrap();

        let mut client = NoiseHandshake::initiator(&client_kp, &server_kp.public).unwrap();
        let mut server = NoiseHandshake::responder(&server_kp).unwrap();

        let mut msg = [0u8; 1024];
        let mut payload = [0u8; 1024];

        let n = client.write_message(&[], &mut msg).unwrap();
        server.read_message(&msg[..n], &mut payload).unwrap();

        let n = server.write_message(&[], &mut msg).unwrap();
        client.read_message(&msg[..n], &mut payload).unwrap();

        assert!(client.is_finished());
        assert!(server.is_finished());

        let seen = server.remote_static().unwrap();
        (
            client.into_transport().unwrap(),
            server.into_transport().unwrap(),
            seen,
            client_kp.public,
        )
    }

    #[test]
    fn test_ik_round_trip() {
        let (_c, _s, seen, expected) = run_handshake();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_transport_both_directions() {
        let (mut client, mut server, _, _) = run_handshake();

        let mut ct = [0u8; 256];
        let mut pt = [0u8; 256];

        let n = client.encrypt(b"to server", &mut ct).unwrap();
        let n = server.decrypt(&ct[..n], &mut pt).unwrap();
        assert_eq!(&pt[..n], b"to server");

        let n = server.encrypt(b"to client", &mut ct).unwrap();
        let n = client.decrypt(&ct[..n], &mut pt).unwrap();
        assert_eq!(&pt[..n], b"to client");
    }

    #[test]
    fn test_incomplete_handshake_rejected() {
        let kp = KeyPair::generate().unwrap();
        let hs = NoiseHandshake::responder(&kp).unwrap();
        assert!(matches!(
            hs.into_transport(),
            Err(CryptoError::HandshakeIncomplete)
        ));
    }
}
