//! Signed packet envelopes, the only unit the transport gate ships.
//!
//! Wire format: big-endian length-prefixed fields in declaration order,
//! signature last. The signature is Ed25519 over the SHA-256 digest of the
//! serialized fields excluding the signature itself.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{MAX_PAYLOAD_SIZE, SIGNATURE_SIZE};
use crate::error::EnvelopeError;
use crate::identity::LocalIdentity;
use crate::payloads::Body;
use crate::types::{IdUrl, PacketId};

/// The closed set of packet commands. Unknown tokens are rejected at decode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Command {
    Data,
    Ack,
    Fail,
    Retrieve,
    ListFiles,
    Identity,
    Message,
    RequestService,
    CancelService,
}

impl Command {
    pub fn as_token(&self) -> &'static str {
        match self {
            Command::Data => "Data",
            Command::Ack => "Ack",
            Command::Fail => "Fail",
            Command::Retrieve => "Retrieve",
            Command::ListFiles => "ListFiles",
            Command::Identity => "Identity",
            Command::Message => "Message",
            Command::RequestService => "RequestService",
            Command::CancelService => "CancelService",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, EnvelopeError> {
        match token {
            "Data" => Ok(Command::Data),
            "Ack" => Ok(Command::Ack),
            "Fail" => Ok(Command::Fail),
            "Retrieve" => Ok(Command::Retrieve),
            "ListFiles" => Ok(Command::ListFiles),
            "Identity" => Ok(Command::Identity),
            "Message" => Ok(Command::Message),
            "RequestService" => Ok(Command::RequestService),
            "CancelService" => Ok(Command::CancelService),
            other => Err(EnvelopeError::UnknownCommand(other.to_string())),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_token())
    }
}

/// A signed packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub command: Command,
    /// Whose data this packet carries.
    pub owner_id: IdUrl,
    /// Who built and signed the packet.
    pub creator_id: IdUrl,
    pub packet_id: PacketId,
    /// The addressee.
    pub remote_id: IdUrl,
    pub date: DateTime<Utc>,
    /// Opaque payload, typically a bincode-encoded [`Body`].
    pub payload: Vec<u8>,
    /// Ed25519 signature over the canonical digest, 64 bytes.
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Build and sign a packet in one step.
    pub fn build(
        command: Command,
        owner_id: IdUrl,
        creator_id: IdUrl,
        packet_id: PacketId,
        remote_id: IdUrl,
        body: &Body,
        identity: &LocalIdentity,
    ) -> Result<Self, EnvelopeError> {
        let payload = body.encode()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EnvelopeError::PayloadTooLarge(payload.len()));
        }
        let mut envelope = Self {
            command,
            owner_id,
            creator_id,
            packet_id,
            remote_id,
            date: Utc::now(),
            payload,
            signature: Vec::new(),
        };
        envelope.signature = identity.sign(&envelope.digest()).to_bytes().to_vec();
        Ok(envelope)
    }

    /// An Ack answering this packet, signed by the responder.
    pub fn ack(&self, my_idurl: IdUrl, body: &Body, identity: &LocalIdentity) -> Result<Self, EnvelopeError> {
        Self::build(
            Command::Ack,
            my_idurl.clone(),
            my_idurl,
            self.packet_id.clone(),
            self.creator_id.clone(),
            body,
            identity,
        )
    }

    /// A Fail answering this packet with a reason string.
    pub fn fail(&self, my_idurl: IdUrl, reason: &str, identity: &LocalIdentity) -> Result<Self, EnvelopeError> {
        Self::build(
            Command::Fail,
            my_idurl.clone(),
            my_idurl,
            self.packet_id.clone(),
            self.creator_id.clone(),
            &Body::Text(reason.to_string()),
            identity,
        )
    }

    fn signed_fields(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, self.command.as_token().as_bytes());
        put_field(&mut buf, self.owner_id.as_str().as_bytes());
        put_field(&mut buf, self.creator_id.as_str().as_bytes());
        put_field(&mut buf, self.packet_id.as_str().as_bytes());
        put_field(&mut buf, self.remote_id.as_str().as_bytes());
        put_field(&mut buf, self.date.to_rfc3339().as_bytes());
        put_field(&mut buf, &self.payload);
        buf.to_vec()
    }

    /// SHA-256 digest the signature covers.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.signed_fields()).into()
    }

    /// Verify the signature against the given creator public key.
    pub fn verify(&self, creator_pubkey: &[u8; 32]) -> Result<(), EnvelopeError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(creator_pubkey)
            .map_err(|_| EnvelopeError::InvalidSignature)?;
        let sig_bytes: [u8; SIGNATURE_SIZE] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| EnvelopeError::InvalidSignature)?;
        key.verify_strict(&self.digest(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| EnvelopeError::InvalidSignature)
    }

    /// Decode the payload into a typed [`Body`].
    pub fn body(&self) -> Result<Body, EnvelopeError> {
        Body::decode(&self.payload)
    }

    // -- wire format --------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let fields = self.signed_fields();
        buf.put_slice(&fields);
        put_field(&mut buf, &self.signature);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let mut buf = data;
        let command_raw = get_field(&mut buf)?;
        let command = Command::from_token(
            std::str::from_utf8(&command_raw).map_err(|_| EnvelopeError::MalformedField("command"))?,
        )?;
        let owner_id = IdUrl::new(get_string(&mut buf, "owner_id")?);
        let creator_id = IdUrl::new(get_string(&mut buf, "creator_id")?);
        let packet_id = PacketId(get_string(&mut buf, "packet_id")?);
        let remote_id = IdUrl::new(get_string(&mut buf, "remote_id")?);
        let date_raw = get_string(&mut buf, "date")?;
        let date = DateTime::parse_from_rfc3339(&date_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| EnvelopeError::MalformedField("date"))?;
        let payload = get_field(&mut buf)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EnvelopeError::PayloadTooLarge(payload.len()));
        }
        let signature = get_field(&mut buf)?;
        if !buf.is_empty() {
            return Err(EnvelopeError::MalformedField("trailing bytes"));
        }
        Ok(Self {
            command,
            owner_id,
            creator_id,
            packet_id,
            remote_id,
            date,
            payload,
            signature,
        })
    }
}

fn put_field(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_field(buf: &mut &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if buf.remaining() < 4 {
        return Err(EnvelopeError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(EnvelopeError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_string(buf: &mut &[u8], field: &'static str) -> Result<String, EnvelopeError> {
    String::from_utf8(get_field(buf)?).map_err(|_| EnvelopeError::MalformedField(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Envelope, LocalIdentity) {
        let identity = LocalIdentity::generate();
        let me = IdUrl::for_user("id-a.example.com", 8084, "alice");
        let them = IdUrl::for_user("id-b.example.com", 8084, "bob");
        let envelope = Envelope::build(
            Command::Message,
            me.clone(),
            me,
            PacketId::random(),
            them,
            &Body::Text("hello".into()),
            &identity,
        )
        .unwrap();
        (envelope, identity)
    }

    #[test]
    fn encode_decode_round_trip() {
        let (envelope, _) = sample();
        let wire = envelope.encode();
        let decoded = Envelope::decode(&wire).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn signature_verifies_for_creator_key_only() {
        let (envelope, identity) = sample();
        assert!(envelope.verify(&identity.public_key_bytes()).is_ok());

        let stranger = LocalIdentity::generate();
        assert!(envelope.verify(&stranger.public_key_bytes()).is_err());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let (mut envelope, identity) = sample();
        envelope.payload.push(0);
        assert!(envelope.verify(&identity.public_key_bytes()).is_err());
    }

    #[test]
    fn unknown_command_rejected() {
        let (envelope, _) = sample();
        let mut wire = envelope.encode();
        // Overwrite the command token "Message" with garbage of equal length.
        wire[4..11].copy_from_slice(b"Msgsage");
        assert!(matches!(
            Envelope::decode(&wire),
            Err(EnvelopeError::UnknownCommand(_))
        ));
    }

    #[test]
    fn truncated_packet_rejected() {
        let (envelope, _) = sample();
        let wire = envelope.encode();
        assert!(matches!(
            Envelope::decode(&wire[..wire.len() - 3]),
            Err(EnvelopeError::MalformedField(_)) | Err(EnvelopeError::Truncated)
        ));
    }

    #[test]
    fn ack_carries_original_packet_id() {
        let (envelope, _) = sample();
        let responder = LocalIdentity::generate();
        let my_idurl = IdUrl::for_user("id-b.example.com", 8084, "bob");
        let ack = envelope
            .ack(my_idurl, &Body::Empty, &responder)
            .unwrap();
        assert_eq!(ack.command, Command::Ack);
        assert_eq!(ack.packet_id, envelope.packet_id);
        assert_eq!(ack.remote_id, envelope.creator_id);
    }
}
