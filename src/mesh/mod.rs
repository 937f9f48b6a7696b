//! Mesh link layer for the reticulum-style backend.
//!
//! Implements the subset of a cryptographic mesh stack that the transport
//! contract needs: a persistent x25519 identity, a named destination
//! derived from it, periodic reachability announcements, and encrypted
//! point-to-point links that auto-chunk large transfers.
//!
//! A destination is addressed by hash, not by location: the server
//! publishes `(destination_hash, public_key)` out of band, and a client
//! reconstructs and verifies the destination before ever dialing. Link
//! traffic is ChaCha20Poly1305 under an ephemeral x25519 agreement, so a
//! link carries forward secrecy independent of the long-lived identity.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey, ReusableSecret, StaticSecret};

/// Destination name for the bridge service: application dot aspect.
pub const DESTINATION_NAME: &str = "hamstr.server";

/// Truncated destination hash length.
pub const DEST_HASH_LEN: usize = 16;

/// Magic prefix on announce datagrams.
const ANNOUNCE_MAGIC: &[u8; 4] = b"HAMR";

/// Payload bytes per encrypted chunk; larger buffers are split and carry a
/// continuation flag, reassembled transparently on the far side.
const CHUNK_PAYLOAD_MAX: usize = 8 * 1024;

/// Ceiling on one reassembled message (keeps a hostile peer from growing
/// the buffer without bound).
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Handshake frames are small and fixed-shape.
const MAX_HANDSHAKE_FRAME: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid identity file")]
    BadIdentityFile,

    #[error("invalid hex value for {0}")]
    BadHex(&'static str),

    #[error("destination hash does not match the published public key")]
    DestinationMismatch,

    #[error("link handshake failed: {0}")]
    Handshake(&'static str),

    #[error("link establishment timeout")]
    LinkTimeout,

    #[error("link is closed")]
    LinkClosed,

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("decryption failed")]
    Decrypt,
}

// =============================================================================
// IDENTITY & DESTINATION
// =============================================================================

/// Long-lived node identity. The secret half lives on disk; the public
/// half is what peers publish and verify against.
pub struct Identity {
    secret: StaticSecret,
    pub public: PublicKey,
}

impl Identity {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load the identity at `path`, creating and persisting a fresh one on
    /// first use. The file is the raw 32-byte secret, mode 0600.
    pub fn load_or_create(path: &Path) -> Result<Self, MeshError> {
        if path.exists() {
            let data = std::fs::read(path)?;
            let bytes: [u8; 32] = data.try_into().map_err(|_| MeshError::BadIdentityFile)?;
            let secret = StaticSecret::from(bytes);
            let public = PublicKey::from(&secret);
            info!(target: "hamstr::system", "Loaded mesh identity from {}", path.display());
            return Ok(Self { secret, public });
        }
        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, identity.secret.to_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
        info!(
            target: "hamstr::system",
            "Created mesh identity at {}, pubkey {}",
            path.display(),
            hex::encode(&identity.public.as_bytes()[..8])
        );
        Ok(identity)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    fn diffie_hellman(&self, their: &PublicKey) -> x25519_dalek::SharedSecret {
        self.secret.diffie_hellman(their)
    }
}

/// Hash naming a destination: SHA3-256 over the destination name and the
/// owner's public key, truncated to 16 bytes.
pub fn destination_hash(name: &str, public: &PublicKey) -> [u8; DEST_HASH_LEN] {
    let mut hasher = Sha3_256::new();
    hasher.update(name.as_bytes());
    hasher.update(public.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; DEST_HASH_LEN];
    out.copy_from_slice(&digest[..DEST_HASH_LEN]);
    out
}

/// Reconstruct and verify a destination from its published hash and key.
pub fn verify_destination(
    name: &str,
    hash_hex: &str,
    pubkey_hex: &str,
) -> Result<([u8; DEST_HASH_LEN], PublicKey), MeshError> {
    let hash_bytes = hex::decode(hash_hex).map_err(|_| MeshError::BadHex("destination hash"))?;
    let hash: [u8; DEST_HASH_LEN] = hash_bytes
        .try_into()
        .map_err(|_| MeshError::BadHex("destination hash"))?;
    let key_bytes = hex::decode(pubkey_hex).map_err(|_| MeshError::BadHex("public key"))?;
    let key: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| MeshError::BadHex("public key"))?;
    let public = PublicKey::from(key);
    if destination_hash(name, &public) != hash {
        return Err(MeshError::DestinationMismatch);
    }
    Ok((hash, public))
}

// =============================================================================
// LINK
// =============================================================================

#[derive(Debug, Default)]
struct LinkBuffer {
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    closed: AtomicBool,
}

/// An established encrypted link.
///
/// Receive is event-signaled: a reader task decrypts and reassembles
/// inbound chunks into whole messages and wakes any waiter. Send chunks
/// large buffers automatically, logging progress as the resource moves.
pub struct Link {
    pub id: String,
    writer: OwnedWriteHalf,
    cipher: ChaCha20Poly1305,
    send_dir: u8,
    send_counter: u64,
    buffer: Arc<LinkBuffer>,
}

impl Link {
    pub fn is_active(&self) -> bool {
        !self.buffer.closed.load(Ordering::SeqCst)
    }

    /// Send one message, chunked as needed.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), MeshError> {
        if !self.is_active() {
            return Err(MeshError::LinkClosed);
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(MeshError::MessageTooLarge(data.len()));
        }
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(CHUNK_PAYLOAD_MAX).collect()
        };
        let total = chunks.len();
        if total > 1 {
            info!(target: "hamstr::progress", "Transferring {} bytes over the link", data.len());
        }
        let mut last_logged = 0usize;
        for (i, chunk) in chunks.iter().enumerate() {
            let more: u8 = u8::from(i + 1 < total);
            let mut plain = Vec::with_capacity(1 + chunk.len());
            plain.push(more);
            plain.extend_from_slice(chunk);

            let nonce = make_nonce(self.send_dir, self.send_counter);
            self.send_counter += 1;
            let sealed = self
                .cipher
                .encrypt(&nonce, plain.as_slice())
                .map_err(|_| MeshError::Decrypt)?;
            write_frame(&mut self.writer, &sealed).await?;

            if total > 1 {
                let percent = (i + 1) * 100 / total;
                if percent / 10 > last_logged / 10 {
                    info!(target: "hamstr::progress", "Transfer: {percent}%");
                    last_logged = percent;
                }
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next complete message.
    pub async fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut queue = self.buffer.queue.lock().await;
                if let Some(msg) = queue.pop_front() {
                    return Some(msg);
                }
            }
            if self.buffer.closed.load(Ordering::SeqCst) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(
                (deadline - now).min(Duration::from_millis(200)),
                self.buffer.notify.notified(),
            )
            .await;
        }
    }

    /// Close the link. Idempotent; the reader task winds down when the
    /// peer observes the shutdown.
    pub async fn teardown(&mut self) {
        self.buffer.closed.store(true, Ordering::SeqCst);
        let _ = self.writer.shutdown().await;
        self.buffer.notify.notify_waiters();
        debug!(target: "hamstr::session", "Link {} torn down", self.id);
    }
}

fn make_nonce(direction: u8, counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[0] = direction;
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

async fn write_frame(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<(), MeshError> {
    let len = u32::try_from(payload.len()).map_err(|_| MeshError::MessageTooLarge(payload.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame(reader: &mut OwnedReadHalf, max: usize) -> Result<Vec<u8>, MeshError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max {
        return Err(MeshError::MessageTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Reader task: decrypt frames, reassemble chunked messages, hand complete
/// buffers to the link's receive queue.
async fn run_link_reader(
    mut reader: OwnedReadHalf,
    cipher: ChaCha20Poly1305,
    recv_dir: u8,
    buffer: Arc<LinkBuffer>,
) {
    let mut counter: u64 = 0;
    let mut assembly: Vec<u8> = Vec::new();
    loop {
        let sealed = match read_frame(&mut reader, CHUNK_PAYLOAD_MAX + 64).await {
            Ok(frame) => frame,
            Err(MeshError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                warn!(target: "hamstr::session", "Link read error: {e}");
                break;
            }
        };
        let nonce = make_nonce(recv_dir, counter);
        counter += 1;
        let plain = match cipher.decrypt(&nonce, sealed.as_slice()) {
            Ok(plain) if !plain.is_empty() => plain,
            _ => {
                warn!(target: "hamstr::session", "Link chunk failed authentication, closing");
                break;
            }
        };
        let more = plain[0];
        if assembly.len() + plain.len() - 1 > MAX_MESSAGE_SIZE {
            warn!(target: "hamstr::session", "Oversized link message, closing");
            break;
        }
        assembly.extend_from_slice(&plain[1..]);
        if more == 0 {
            let message = std::mem::take(&mut assembly);
            debug!(target: "hamstr::packet", "Link delivered {} bytes", message.len());
            let mut queue = buffer.queue.lock().await;
            queue.push_back(message);
            drop(queue);
            buffer.notify.notify_waiters();
        }
    }
    buffer.closed.store(true, Ordering::SeqCst);
    buffer.notify.notify_waiters();
}

fn build_link(
    stream: TcpStream,
    cipher: ChaCha20Poly1305,
    send_dir: u8,
    recv_dir: u8,
    id: String,
) -> Link {
    let (reader, writer) = stream.into_split();
    let buffer = Arc::new(LinkBuffer::default());
    tokio::spawn(run_link_reader(reader, cipher.clone(), recv_dir, buffer.clone()));
    Link {
        id,
        writer,
        cipher,
        send_dir,
        send_counter: 0,
        buffer,
    }
}

/// Session key: SHA3 over the ephemeral agreement, the ephemeral-static
/// agreement, and the destination hash. The static term authenticates the
/// destination owner: only the holder of the published key's secret half
/// derives the same key, so an impostor's link dies at the first frame.
fn derive_cipher(
    shared_ee: &[u8; 32],
    shared_es: &[u8; 32],
    dest_hash: &[u8; DEST_HASH_LEN],
) -> ChaCha20Poly1305 {
    let mut hasher = Sha3_256::new();
    hasher.update(shared_ee);
    hasher.update(shared_es);
    hasher.update(dest_hash);
    let key_bytes = hasher.finalize();
    ChaCha20Poly1305::new(Key::from_slice(&key_bytes))
}

// Direction bytes keep the two nonce streams disjoint.
const DIR_CLIENT_TO_SERVER: u8 = 0x01;
const DIR_SERVER_TO_CLIENT: u8 = 0x02;

// =============================================================================
// SERVER SIDE
// =============================================================================

/// Inbound destination: owns the listener and accepts links one at a time.
pub struct MeshListener {
    listener: TcpListener,
    dest_hash: [u8; DEST_HASH_LEN],
    identity: Identity,
}

impl MeshListener {
    pub async fn bind(identity: &Identity, addr: &str) -> Result<Self, MeshError> {
        let listener = TcpListener::bind(addr).await?;
        let dest_hash = destination_hash(DESTINATION_NAME, &identity.public);
        info!(
            target: "hamstr::system",
            "Mesh destination ready: hash={} pubkey={}",
            hex::encode(dest_hash),
            identity.public_key_hex()
        );
        Ok(Self {
            listener,
            dest_hash,
            identity: Identity {
                secret: identity.secret.clone(),
                public: identity.public,
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn dest_hash(&self) -> [u8; DEST_HASH_LEN] {
        self.dest_hash
    }

    /// Accept one incoming link and complete the handshake:
    ///
    /// ```text
    /// client -> [dest_hash 16][client_ephemeral_pub 32]
    /// server -> [server_static_pub 32][server_ephemeral_pub 32]
    /// ```
    ///
    /// A request naming a different destination is refused. The session
    /// key is the SHA3 of the ephemeral agreement and the destination
    /// hash, so each link gets a fresh key.
    pub async fn accept(&mut self) -> Result<Link, MeshError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            match self.handshake(stream).await {
                Ok(link) => {
                    info!(target: "hamstr::session", "Mesh client connected: {}", link.id);
                    return Ok(link);
                }
                Err(e) => {
                    warn!(target: "hamstr::session", "Rejected mesh link from {peer}: {e}");
                }
            }
        }
    }

    async fn handshake(&self, stream: TcpStream) -> Result<Link, MeshError> {
        let (mut reader, mut writer) = stream.into_split();

        let request = tokio::time::timeout(
            Duration::from_secs(10),
            read_frame(&mut reader, MAX_HANDSHAKE_FRAME),
        )
        .await
        .map_err(|_| MeshError::Handshake("request timeout"))??;
        if request.len() != DEST_HASH_LEN + 32 {
            return Err(MeshError::Handshake("bad request length"));
        }
        if request[..DEST_HASH_LEN] != self.dest_hash {
            return Err(MeshError::Handshake("unknown destination"));
        }
        let mut client_pub = [0u8; 32];
        client_pub.copy_from_slice(&request[DEST_HASH_LEN..]);
        let client_pub = PublicKey::from(client_pub);

        let eph_secret = EphemeralSecret::random_from_rng(OsRng);
        let eph_public = PublicKey::from(&eph_secret);
        let mut reply = Vec::with_capacity(64);
        reply.extend_from_slice(self.identity.public.as_bytes());
        reply.extend_from_slice(eph_public.as_bytes());
        write_frame(&mut writer, &reply).await?;

        let shared_ee = eph_secret.diffie_hellman(&client_pub);
        let shared_es = self.identity.diffie_hellman(&client_pub);
        let cipher = derive_cipher(shared_ee.as_bytes(), shared_es.as_bytes(), &self.dest_hash);

        let id = hex::encode(&destination_hash("link", &client_pub)[..8]);
        let stream = reader
            .reunite(writer)
            .map_err(|_| MeshError::Handshake("stream reunite"))?;
        Ok(build_link(
            stream,
            cipher,
            DIR_SERVER_TO_CLIENT,
            DIR_CLIENT_TO_SERVER,
            format!("mesh-{id}"),
        ))
    }

}

// =============================================================================
// ANNOUNCES
// =============================================================================

/// Periodic reachability announcement over UDP broadcast:
/// `HAMR || version || dest_hash || public_key`.
pub struct Announcer {
    socket: UdpSocket,
    payload: Vec<u8>,
    target: String,
}

impl Announcer {
    pub async fn new(
        identity: &Identity,
        broadcast_port: u16,
    ) -> Result<Self, MeshError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let mut payload = Vec::with_capacity(4 + 1 + DEST_HASH_LEN + 32);
        payload.extend_from_slice(ANNOUNCE_MAGIC);
        payload.push(1);
        payload.extend_from_slice(&destination_hash(DESTINATION_NAME, &identity.public));
        payload.extend_from_slice(identity.public.as_bytes());
        Ok(Self {
            socket,
            payload,
            target: format!("255.255.255.255:{broadcast_port}"),
        })
    }

    pub async fn announce(&self) {
        match self.socket.send_to(&self.payload, &self.target).await {
            Ok(_) => info!(target: "hamstr::system", "Announced mesh destination"),
            Err(e) => warn!(target: "hamstr::system", "Announce failed: {e}"),
        }
    }

    /// Announce immediately, then on every interval tick until dropped.
    pub async fn run(self, interval: Duration) {
        loop {
            self.announce().await;
            tokio::time::sleep(interval).await;
        }
    }
}

/// Parse an announce datagram back into `(dest_hash, public_key)`.
pub fn parse_announce(datagram: &[u8]) -> Option<([u8; DEST_HASH_LEN], PublicKey)> {
    let expected_len = 4 + 1 + DEST_HASH_LEN + 32;
    if datagram.len() != expected_len || &datagram[..4] != ANNOUNCE_MAGIC {
        return None;
    }
    let mut hash = [0u8; DEST_HASH_LEN];
    hash.copy_from_slice(&datagram[5..5 + DEST_HASH_LEN]);
    let mut key = [0u8; 32];
    key.copy_from_slice(&datagram[5 + DEST_HASH_LEN..]);
    let public = PublicKey::from(key);
    if destination_hash(DESTINATION_NAME, &public) != hash {
        return None;
    }
    Some((hash, public))
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// Open a link to a published destination.
///
/// The destination is verified from `(hash, public_key)` before dialing;
/// the wrong key for the hash never even produces a connection attempt.
/// Waits up to `timeout` for the link to come active.
pub async fn link_to(
    server_addr: &str,
    hash_hex: &str,
    pubkey_hex: &str,
    timeout: Duration,
) -> Result<Link, MeshError> {
    let (dest_hash, server_public) =
        verify_destination(DESTINATION_NAME, hash_hex, pubkey_hex)?;

    let connect = async {
        let stream = TcpStream::connect(server_addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        // Reusable because it enters two agreements: with the server's
        // ephemeral key and with its static identity key.
        let eph_secret = ReusableSecret::random_from_rng(OsRng);
        let eph_public = PublicKey::from(&eph_secret);
        let mut request = Vec::with_capacity(DEST_HASH_LEN + 32);
        request.extend_from_slice(&dest_hash);
        request.extend_from_slice(eph_public.as_bytes());
        write_frame(&mut writer, &request).await?;

        let reply = read_frame(&mut reader, MAX_HANDSHAKE_FRAME).await?;
        if reply.len() != 64 {
            return Err(MeshError::Handshake("bad reply length"));
        }
        let mut static_pub = [0u8; 32];
        static_pub.copy_from_slice(&reply[..32]);
        if PublicKey::from(static_pub) != server_public {
            return Err(MeshError::Handshake("server identity mismatch"));
        }
        let mut server_eph = [0u8; 32];
        server_eph.copy_from_slice(&reply[32..]);
        let shared_ee = eph_secret.diffie_hellman(&PublicKey::from(server_eph));
        let shared_es = eph_secret.diffie_hellman(&server_public);
        let cipher = derive_cipher(shared_ee.as_bytes(), shared_es.as_bytes(), &dest_hash);

        let stream = reader
            .reunite(writer)
            .map_err(|_| MeshError::Handshake("stream reunite"))?;
        let id = format!("mesh-{}", &hash_hex[..8.min(hash_hex.len())]);
        Ok(build_link(
            stream,
            cipher,
            DIR_CLIENT_TO_SERVER,
            DIR_SERVER_TO_CLIENT,
            id,
        ))
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => {
            let link = result?;
            info!(target: "hamstr::session", "Mesh link active: {}", link.id);
            Ok(link)
        }
        Err(_) => Err(MeshError::LinkTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_hash_is_stable_and_keyed() {
        let a = Identity::generate();
        let b = Identity::generate();
        let ha = destination_hash(DESTINATION_NAME, &a.public);
        assert_eq!(ha, destination_hash(DESTINATION_NAME, &a.public));
        assert_ne!(ha, destination_hash(DESTINATION_NAME, &b.public));
        assert_ne!(ha, destination_hash("hamstr.other", &a.public));
    }

    #[test]
    fn verify_destination_rejects_mismatch() {
        let a = Identity::generate();
        let b = Identity::generate();
        let hash = hex::encode(destination_hash(DESTINATION_NAME, &a.public));
        assert!(verify_destination(DESTINATION_NAME, &hash, &a.public_key_hex()).is_ok());
        assert!(matches!(
            verify_destination(DESTINATION_NAME, &hash, &b.public_key_hex()),
            Err(MeshError::DestinationMismatch)
        ));
    }

    #[test]
    fn identity_persists() {
        let dir = std::env::temp_dir().join(format!("hamstr_mesh_id_{}", std::process::id()));
        let path = dir.join("identity");
        let _ = std::fs::remove_dir_all(&dir);

        let first = Identity::load_or_create(&path).unwrap();
        let second = Identity::load_or_create(&path).unwrap();
        assert_eq!(first.public.as_bytes(), second.public.as_bytes());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn announce_roundtrip() {
        let identity = Identity::generate();
        let mut payload = Vec::new();
        payload.extend_from_slice(ANNOUNCE_MAGIC);
        payload.push(1);
        payload.extend_from_slice(&destination_hash(DESTINATION_NAME, &identity.public));
        payload.extend_from_slice(identity.public.as_bytes());

        let (hash, public) = parse_announce(&payload).unwrap();
        assert_eq!(hash, destination_hash(DESTINATION_NAME, &identity.public));
        assert_eq!(public.as_bytes(), identity.public.as_bytes());

        // Corrupt the key: verification must fail.
        let len = payload.len();
        payload[len - 1] ^= 0xFF;
        assert!(parse_announce(&payload).is_none());
    }

    #[tokio::test]
    async fn link_roundtrip_small_and_chunked() {
        let identity = Identity::generate();
        let mut listener = MeshListener::bind(&identity, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hash_hex = hex::encode(listener.dest_hash());
        let pub_hex = identity.public_key_hex();

        let server = tokio::spawn(async move {
            let mut link = listener.accept().await.unwrap();
            let got = link.recv(Duration::from_secs(5)).await.unwrap();
            link.send(&got).await.unwrap();
            // Then a large buffer back that must chunk.
            let big = vec![0x5A; CHUNK_PAYLOAD_MAX * 3 + 17];
            link.send(&big).await.unwrap();
            big
        });

        let mut link = link_to(&addr, &hash_hex, &pub_hex, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(link.is_active());

        link.send(b"Hello from client!").await.unwrap();
        let echoed = link.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(echoed, b"Hello from client!");

        let big = link.recv(Duration::from_secs(5)).await.unwrap();
        let expected = server.await.unwrap();
        assert_eq!(big, expected);

        link.teardown().await;
        assert!(!link.is_active());
    }

    #[tokio::test]
    async fn wrong_destination_refused() {
        let identity = Identity::generate();
        let mut listener = MeshListener::bind(&identity, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // A different identity's published pair fails verification before
        // any connection happens.
        let other = Identity::generate();
        let bogus_hash = hex::encode(destination_hash(DESTINATION_NAME, &other.public));
        let result = link_to(
            &addr,
            &bogus_hash,
            &identity.public_key_hex(),
            Duration::from_secs(2),
        )
        .await;
        assert!(matches!(result, Err(MeshError::DestinationMismatch)));

        // Keep the listener alive until the check is done.
        drop(listener.accept());
    }
}
