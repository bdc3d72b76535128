//! TCP packet transport with a Noise XX session per connection.
//!
//! Every connection starts with the three-message handshake; after that
//! each logical frame (one encoded envelope) travels as a u32-prefixed
//! plaintext length followed by Noise transport messages of at most
//! [`NOISE_CHUNK`] plaintext bytes, since Noise caps a single message at
//! 64 KiB and envelopes go up to 1 MiB.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use bitdust_shared::constants::MAX_ENVELOPE_SIZE;
use bitdust_shared::noise::{start_handshake, HandshakeRole, NoiseSession};

use crate::error::{NetError, Result};
use crate::transport::{
    ContactAddress, InboundFrame, InboundSender, Transport, TransportProto,
};

const NOISE_CHUNK: usize = 60 * 1024;

type SendRequest = (Vec<u8>, oneshot::Sender<Result<()>>);

pub struct TcpTransport {
    noise_key: [u8; 32],
    local_addr: std::net::SocketAddr,
    outbound: Mutex<HashMap<String, mpsc::Sender<SendRequest>>>,
}

impl TcpTransport {
    /// Bind the listener and spawn the accept loop.
    pub async fn start(
        listen_addr: &str,
        noise_key: [u8; 32],
        inbound_tx: InboundSender,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "tcp transport listening");

        let transport = Arc::new(Self {
            noise_key,
            local_addr,
            outbound: Mutex::new(HashMap::new()),
        });

        let accept_key = noise_key;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "inbound tcp connection");
                        let inbound_tx = inbound_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                serve_connection(stream, peer.to_string(), accept_key, inbound_tx)
                                    .await
                            {
                                debug!(peer = %peer, error = %e, "inbound connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        break;
                    }
                }
            }
        });

        Ok(transport)
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    async fn worker_for(&self, host: &str) -> mpsc::Sender<SendRequest> {
        let mut outbound = self.outbound.lock().await;
        if let Some(tx) = outbound.get(host) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel::<SendRequest>(64);
        tokio::spawn(run_outbound(host.to_string(), self.noise_key, rx));
        outbound.insert(host.to_string(), tx.clone());
        tx
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn proto(&self) -> TransportProto {
        TransportProto::Tcp
    }

    async fn send(&self, address: &ContactAddress, frame: Vec<u8>) -> Result<()> {
        let worker = self.worker_for(&address.host).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .send((frame, reply_tx))
            .await
            .map_err(|_| NetError::Unreachable(address.host.clone()))?;
        reply_rx
            .await
            .map_err(|_| NetError::Unreachable(address.host.clone()))?
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

async fn run_outbound(host: String, noise_key: [u8; 32], mut rx: mpsc::Receiver<SendRequest>) {
    let mut stream = match TcpStream::connect(&host).await {
        Ok(s) => s,
        Err(e) => {
            debug!(host = %host, error = %e, "tcp connect failed");
            drain_failing(&mut rx, &host).await;
            return;
        }
    };

    let mut session = match handshake_initiator(&mut stream, &noise_key).await {
        Ok(s) => s,
        Err(e) => {
            debug!(host = %host, error = %e, "noise handshake failed");
            drain_failing(&mut rx, &host).await;
            return;
        }
    };

    // Connections are directional: the remote opens its own connection for
    // its packets, so the read half only watches for EOF to notice a dead
    // peer.
    let (mut read_half, mut write_half) = stream.into_split();
    let reader_host = host.clone();
    let watch = tokio::spawn(async move {
        let mut byte = [0u8; 1];
        let _ = read_half.read(&mut byte).await;
        debug!(host = %reader_host, "outbound connection remote closed");
    });

    while let Some((frame, reply)) = rx.recv().await {
        let result = write_sealed_frame(&mut write_half, &mut session, &frame).await;
        let failed = result.is_err();
        let _ = reply.send(result.map_err(NetError::from));
        if failed {
            break;
        }
    }

    watch.abort();
    drain_failing(&mut rx, &host).await;
}

async fn drain_failing(rx: &mut mpsc::Receiver<SendRequest>, host: &str) {
    rx.close();
    while let Some((_, reply)) = rx.recv().await {
        let _ = reply.send(Err(NetError::Unreachable(host.to_string())));
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: String,
    noise_key: [u8; 32],
    inbound_tx: InboundSender,
) -> Result<()> {
    let mut session = handshake_responder(&mut stream, &noise_key).await?;
    let (mut read_half, _write_half) = stream.into_split();
    loop {
        let frame = read_sealed_frame(&mut read_half, &mut session).await?;
        if inbound_tx
            .send(InboundFrame {
                proto: TransportProto::Tcp,
                from_host: peer.clone(),
                data: frame,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake and framing
// ---------------------------------------------------------------------------

async fn handshake_initiator(stream: &mut TcpStream, key: &[u8; 32]) -> Result<NoiseSession> {
    let mut state = start_handshake(HandshakeRole::Initiator, key)?;
    let mut buf = vec![0u8; 1024];

    let len = state
        .write_message(&[], &mut buf)
        .map_err(|e| NetError::Noise(bitdust_shared::error::NoiseError::Handshake(e.to_string())))?;
    write_raw_frame(stream, &buf[..len]).await?;

    let msg2 = read_raw_frame(stream).await?;
    let mut scratch = vec![0u8; 1024];
    state
        .read_message(&msg2, &mut scratch)
        .map_err(|e| NetError::Noise(bitdust_shared::error::NoiseError::Handshake(e.to_string())))?;

    let len = state
        .write_message(&[], &mut buf)
        .map_err(|e| NetError::Noise(bitdust_shared::error::NoiseError::Handshake(e.to_string())))?;
    write_raw_frame(stream, &buf[..len]).await?;

    Ok(NoiseSession::establish(state)?)
}

async fn handshake_responder(stream: &mut TcpStream, key: &[u8; 32]) -> Result<NoiseSession> {
    let mut state = start_handshake(HandshakeRole::Responder, key)?;
    let mut buf = vec![0u8; 1024];
    let mut scratch = vec![0u8; 1024];

    let msg1 = read_raw_frame(stream).await?;
    state
        .read_message(&msg1, &mut scratch)
        .map_err(|e| NetError::Noise(bitdust_shared::error::NoiseError::Handshake(e.to_string())))?;

    let len = state
        .write_message(&[], &mut buf)
        .map_err(|e| NetError::Noise(bitdust_shared::error::NoiseError::Handshake(e.to_string())))?;
    write_raw_frame(stream, &buf[..len]).await?;

    let msg3 = read_raw_frame(stream).await?;
    state
        .read_message(&msg3, &mut scratch)
        .map_err(|e| NetError::Noise(bitdust_shared::error::NoiseError::Handshake(e.to_string())))?;

    Ok(NoiseSession::establish(state)?)
}

async fn write_raw_frame<W: AsyncWriteExt + Unpin>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    w.write_u32(data.len() as u32).await?;
    w.write_all(data).await?;
    w.flush().await
}

async fn read_raw_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let len = r.read_u32().await? as usize;
    if len > MAX_ENVELOPE_SIZE + 4096 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_sealed_frame<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    session: &mut NoiseSession,
    plaintext: &[u8],
) -> std::io::Result<()> {
    w.write_u32(plaintext.len() as u32).await?;
    for chunk in plaintext.chunks(NOISE_CHUNK) {
        let sealed = session
            .seal(chunk)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        w.write_u32(sealed.len() as u32).await?;
        w.write_all(&sealed).await?;
    }
    w.flush().await
}

async fn read_sealed_frame<R: AsyncReadExt + Unpin>(
    r: &mut R,
    session: &mut NoiseSession,
) -> Result<Vec<u8>> {
    let total = r.read_u32().await? as usize;
    if total > MAX_ENVELOPE_SIZE {
        return Err(NetError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        )));
    }
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        let sealed = read_raw_frame(r).await?;
        let opened = session.open(&sealed)?;
        out.extend_from_slice(&opened);
    }
    if out.len() != total {
        return Err(NetError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame length mismatch",
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn noise_key() -> [u8; 32] {
        let mut k = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut k);
        k
    }

    #[tokio::test]
    async fn frames_cross_a_loopback_connection() {
        let (bob_frames_tx, mut bob_frames_rx) = mpsc::channel(16);
        let bob = TcpTransport::start("127.0.0.1:0", noise_key(), bob_frames_tx)
            .await
            .unwrap();
        let addr = bob.local_addr();

        let (alice_frames_tx, _alice_frames_rx) = mpsc::channel(16);
        let alice = TcpTransport::start("127.0.0.1:0", noise_key(), alice_frames_tx)
            .await
            .unwrap();

        let payload = vec![7u8; 200_000];
        alice
            .send(
                &ContactAddress {
                    proto: TransportProto::Tcp,
                    host: addr.to_string(),
                },
                payload.clone(),
            )
            .await
            .unwrap();

        let frame = bob_frames_rx.recv().await.unwrap();
        assert_eq!(frame.proto, TransportProto::Tcp);
        assert_eq!(frame.data, payload);
    }

    #[tokio::test]
    async fn unreachable_host_errors() {
        let (tx, _rx) = mpsc::channel(16);
        let t = TcpTransport::start("127.0.0.1:0", noise_key(), tx)
            .await
            .unwrap();
        let err = t
            .send(
                &ContactAddress {
                    proto: TransportProto::Tcp,
                    host: "127.0.0.1:1".into(),
                },
                vec![1],
            )
            .await;
        assert!(err.is_err());
    }
}
