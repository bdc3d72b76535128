//! Noise XX session layer for the TCP packet transport.
//!
//! Both sides run the three-message XX handshake before any envelope
//! crosses the stream; afterwards every frame is a Noise transport
//! message. Signed packets stay signed end to end, the session layer only
//! hides traffic from the wire.

use snow::{Builder, HandshakeState, TransportState};

use crate::error::NoiseError;

const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Which side of the handshake this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// Begin a handshake with the given static X25519 private key.
pub fn start_handshake(
    role: HandshakeRole,
    local_private_key: &[u8; 32],
) -> Result<HandshakeState, NoiseError> {
    let builder = Builder::new(
        NOISE_PATTERN
            .parse()
            .map_err(|e| NoiseError::Handshake(format!("{e}")))?,
    )
    .local_private_key(local_private_key);
    match role {
        HandshakeRole::Initiator => builder.build_initiator(),
        HandshakeRole::Responder => builder.build_responder(),
    }
    .map_err(|e| NoiseError::Handshake(format!("{e}")))
}

/// An established session able to seal and open transport frames.
pub struct NoiseSession {
    transport: TransportState,
}

impl NoiseSession {
    /// Finalize a completed handshake into transport mode.
    pub fn establish(state: HandshakeState) -> Result<Self, NoiseError> {
        let transport = state
            .into_transport_mode()
            .map_err(|e| NoiseError::Transport(format!("{e}")))?;
        Ok(Self { transport })
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut buf = vec![0u8; plaintext.len() + 64];
        let len = self
            .transport
            .write_message(plaintext, &mut buf)
            .map_err(|e| NoiseError::Transport(format!("{e}")))?;
        buf.truncate(len);
        Ok(buf)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(ciphertext, &mut buf)
            .map_err(|e| NoiseError::Transport(format!("{e}")))?;
        buf.truncate(len);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_and_transport() {
        let initiator_key = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let responder_key = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);

        let mut initiator =
            start_handshake(HandshakeRole::Initiator, &initiator_key.to_bytes()).unwrap();
        let mut responder =
            start_handshake(HandshakeRole::Responder, &responder_key.to_bytes()).unwrap();

        let mut buf = vec![0u8; 256];
        let len = initiator.write_message(&[], &mut buf).unwrap();
        let msg1 = buf[..len].to_vec();

        let mut scratch = vec![0u8; 256];
        responder.read_message(&msg1, &mut scratch).unwrap();

        let mut buf = vec![0u8; 256];
        let len = responder.write_message(&[], &mut buf).unwrap();
        let msg2 = buf[..len].to_vec();

        let mut scratch = vec![0u8; 256];
        initiator.read_message(&msg2, &mut scratch).unwrap();

        let mut buf = vec![0u8; 256];
        let len = initiator.write_message(&[], &mut buf).unwrap();
        let msg3 = buf[..len].to_vec();

        let mut scratch = vec![0u8; 256];
        responder.read_message(&msg3, &mut scratch).unwrap();

        let mut alice = NoiseSession::establish(initiator).unwrap();
        let mut bob = NoiseSession::establish(responder).unwrap();

        let sealed = alice.seal(b"signed packet bytes").unwrap();
        let opened = bob.open(&sealed).unwrap();
        assert_eq!(opened, b"signed packet bytes");
    }
}
