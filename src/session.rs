//! # Authenticated Session Transport
//!
//! A framed, AEAD-protected message channel over TCP, established by a
//! sealed-secret handshake against the overlay's static x25519 key.
//!
//! ## Handshake
//!
//! The initiator generates a fresh 32-byte session secret and an ephemeral
//! x25519 keypair, then sends a single plaintext hello record:
//! `{overlay, ephemeral_public, sealed_secret}`. The secret is sealed with
//! ChaCha20-Poly1305 under a key expanded from two Diffie-Hellman results:
//!
//! - `dh(ephemeral, acceptor_static)` — only the acceptor can unseal;
//! - `dh(initiator_static, acceptor_static)` — only a holder of registered
//!   overlay key material can produce a sealing tag that verifies, which
//!   is what authenticates the initiator.
//!
//! The expander is salted with the ephemeral public key and labeled
//! `"weft/v1/seal"` plus the overlay id, so sessions of different overlays
//! cannot interoperate even with identical keys. The seal key is used for
//! exactly one AEAD invocation, so its nonce is fixed at zero. Acceptors
//! reject hellos naming an overlay absent from their known-keys table
//! before any key agreement happens.
//!
//! ## Directional keys
//!
//! Both sides expand the session secret through four independent HKDF
//! streams with the stable info labels `"i>a-enc"`, `"i>a-mac"`,
//! `"a>i-enc"` and `"a>i-mac"`, each followed by the overlay id bytes. The
//! `-enc` streams yield the direction's 32-byte ChaCha20-Poly1305 key; the
//! `-mac` streams yield the 4-byte salt of its nonce space, keeping frame
//! authentication material separate per direction.
//!
//! ## Framing
//!
//! ```text
//! uint32  length        (big endian)
//! bytes   sealed[length]   (AEAD ciphertext, 16-byte tag appended)
//! ```
//!
//! Nonces are `salt || counter_be`, with a monotonic per-direction frame
//! counter tracked implicitly on both ends; the length prefix rides as
//! associated data. A replayed, reordered or tampered frame therefore
//! fails to open. The plaintext is a bincode [`Message`]. Any AEAD
//! failure, decode failure, oversized frame or short read tears the
//! session down; there is no per-frame recovery.

use std::collections::HashMap;
use std::net::SocketAddr;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::OverlayConfig;
use crate::hkdf::{ExpansionExhausted, HkdfStream};
use crate::id::OverlayId;
use crate::messages::{self, Message};

const SEAL_INFO: &[u8] = b"weft/v1/seal";
const INIT_TO_ACC_ENC: &[u8] = b"i>a-enc";
const INIT_TO_ACC_MAC: &[u8] = b"i>a-mac";
const ACC_TO_INIT_ENC: &[u8] = b"a>i-enc";
const ACC_TO_INIT_MAC: &[u8] = b"a>i-mac";

const KEY_LEN: usize = 32;
const NONCE_SALT_LEN: usize = 4;
const TAG_LEN: usize = 16;

/// Last counter value a direction may spend before its nonce space is
/// considered used up.
const MAX_NONCE_COUNTER: u64 = u64::MAX - 1;

/// Upper bound on the plaintext hello record.
const MAX_HELLO: usize = 4096;

/// Failure modes of the session transport. All of them are fatal to the
/// session they occur on.
#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    Codec(bincode::Error),
    /// Underlying AEAD failure (seal/open); the peer is treated as dead.
    Crypto(&'static str),
    FrameTooLarge { len: usize, max: usize },
    /// Hello named an overlay this listener has no key for.
    UnknownOverlay,
    /// A direction ran out of safe nonce space under its key.
    NonceExhausted,
    Keys(ExpansionExhausted),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(err) => write!(f, "session i/o failed: {}", err),
            SessionError::Codec(err) => write!(f, "session record malformed: {}", err),
            SessionError::Crypto(op) => write!(f, "frame authentication failed ({})", op),
            SessionError::FrameTooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds the {} byte cap", len, max)
            }
            SessionError::UnknownOverlay => write!(f, "no key registered for claimed overlay"),
            SessionError::NonceExhausted => write!(f, "session nonce space exhausted"),
            SessionError::Keys(err) => write!(f, "key derivation failed: {}", err),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(err) => Some(err),
            SessionError::Codec(err) => Some(err),
            SessionError::Keys(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err)
    }
}

impl From<bincode::Error> for SessionError {
    fn from(err: bincode::Error) -> Self {
        SessionError::Codec(err)
    }
}

impl From<ExpansionExhausted> for SessionError {
    fn from(err: ExpansionExhausted) -> Self {
        SessionError::Keys(err)
    }
}

/// Plaintext handshake record, the only unencrypted bytes on the wire.
#[derive(Serialize, Deserialize)]
struct Hello {
    overlay: Vec<u8>,
    ephemeral: [u8; 32],
    /// AEAD-sealed session secret (32 bytes plus tag).
    sealed: Vec<u8>,
}

/// One direction's AEAD state: key, nonce salt and the monotonic frame
/// counter spending the nonce space.
struct DirectionKey {
    cipher: ChaCha20Poly1305,
    salt: [u8; NONCE_SALT_LEN],
    counter: u64,
}

impl DirectionKey {
    /// Nonce layout: `salt(4) || counter_be(8)`. The salt keeps the two
    /// directions of a session in disjoint nonce spaces.
    fn nonce(&self) -> Result<Nonce, SessionError> {
        if self.counter > MAX_NONCE_COUNTER {
            return Err(SessionError::NonceExhausted);
        }
        let mut bytes = [0u8; 12];
        bytes[..NONCE_SALT_LEN].copy_from_slice(&self.salt);
        bytes[NONCE_SALT_LEN..].copy_from_slice(&self.counter.to_be_bytes());
        Ok(bytes.into())
    }

    fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = self.nonce()?;
        let sealed = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| SessionError::Crypto("seal"))?;
        self.counter += 1;
        Ok(sealed)
    }

    fn open(&mut self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = self.nonce()?;
        let plaintext = self
            .cipher
            .decrypt(&nonce, Payload { msg: sealed, aad })
            .map_err(|_| SessionError::Crypto("open"))?;
        self.counter += 1;
        Ok(plaintext)
    }
}

struct SessionKeys {
    send: DirectionKey,
    recv: DirectionKey,
}

/// An established, key-agreed session, not yet moving messages.
///
/// Call [`communicate`](Session::communicate) to bind it to channels.
pub struct Session {
    stream: TcpStream,
    keys: SessionKeys,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    max_frame: usize,
    queue_depth: usize,
}

impl Session {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Binds the session to its channels, spawning one reader and one
    /// writer task.
    ///
    /// Messages pushed into the returned sender are framed and sealed onto
    /// the socket; opened inbound frames are delivered to `inbound`. The
    /// reader task drops `inbound` when the session dies for any reason,
    /// which is the peer-death signal to the consumer. `quit` tears both
    /// tasks down.
    pub fn communicate(
        self,
        inbound: mpsc::Sender<Message>,
        quit: watch::Receiver<bool>,
    ) -> mpsc::Sender<Message> {
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.queue_depth);
        let (mut read_half, mut write_half) = self.stream.into_split();
        let SessionKeys {
            send: mut tx_key,
            recv: mut rx_key,
        } = self.keys;
        let max_frame = self.max_frame;
        let peer = self.peer_addr;

        let mut write_quit = quit.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_quit.changed() => break,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(err) =
                                write_frame(&mut write_half, &mut tx_key, &msg, max_frame).await
                            {
                                debug!(peer = %peer, error = %err, "session write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let mut read_quit = quit;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_quit.changed() => break,
                    frame = read_frame(&mut read_half, &mut rx_key, max_frame) => {
                        match frame {
                            Ok(msg) => {
                                if inbound.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                debug!(peer = %peer, error = %err, "session read failed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        out_tx
    }
}

/// Dials `addr` and performs the initiator half of the handshake.
pub async fn dial(
    addr: SocketAddr,
    overlay: &OverlayId,
    local_key: &StaticSecret,
    remote_pub: PublicKey,
    config: &OverlayConfig,
) -> Result<Session, SessionError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);

    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let ephemeral_shared = ephemeral.diffie_hellman(&remote_pub);
    let static_shared = local_key.diffie_hellman(&remote_pub);

    let sealed = seal_cipher(
        ephemeral_shared.as_bytes(),
        static_shared.as_bytes(),
        ephemeral_pub.as_bytes(),
        overlay.as_bytes(),
    )?
    .encrypt(&Nonce::default(), secret.as_slice())
    .map_err(|_| SessionError::Crypto("seal"))?;

    let hello = messages::serialize(&Hello {
        overlay: overlay.as_bytes().to_vec(),
        ephemeral: *ephemeral_pub.as_bytes(),
        sealed,
    })?;
    stream.write_all(&(hello.len() as u32).to_be_bytes()).await?;
    stream.write_all(&hello).await?;

    let keys = derive_keys(&secret, overlay.as_bytes(), true)?;
    let peer_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    Ok(Session {
        stream,
        keys,
        peer_addr,
        local_addr,
        max_frame: config.max_frame,
        queue_depth: config.queue_depth,
    })
}

/// Handle to a running session listener.
pub struct Listener {
    local_addr: SocketAddr,
    quit: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for the accept loop to exit. Sessions
    /// already surfaced stay alive.
    pub async fn stop(self) {
        let _ = self.quit.send(true);
        let _ = self.task.await;
    }
}

/// Starts a listener on `addr` that performs the acceptor half of the
/// handshake on every inbound connection and surfaces the established
/// sessions. Handshakes run on their own tasks under the init timeout, so
/// a stalled dialer cannot block the accept loop.
pub async fn listen(
    addr: SocketAddr,
    local_key: StaticSecret,
    remote_keys: HashMap<Vec<u8>, PublicKey>,
    config: &OverlayConfig,
) -> std::io::Result<(mpsc::Receiver<Session>, Listener)> {
    let tcp = TcpListener::bind(addr).await?;
    let local_addr = tcp.local_addr()?;
    let (sess_tx, sess_rx) = mpsc::channel(config.queue_depth);
    let (quit_tx, mut quit_rx) = watch::channel(false);

    let max_frame = config.max_frame;
    let queue_depth = config.queue_depth;
    let hello_timeout = config.init_timeout;

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = quit_rx.changed() => break,
                accepted = tcp.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let local_key = local_key.clone();
                    let remote_keys = remote_keys.clone();
                    let sess_tx = sess_tx.clone();
                    tokio::spawn(async move {
                        let shake = accept_session(stream, local_key, remote_keys, max_frame, queue_depth);
                        match timeout(hello_timeout, shake).await {
                            Ok(Ok(session)) => {
                                let _ = sess_tx.send(session).await;
                            }
                            Ok(Err(err)) => {
                                debug!(peer = %peer_addr, error = %err, "inbound handshake failed")
                            }
                            Err(_) => debug!(peer = %peer_addr, "inbound handshake timed out"),
                        }
                    });
                }
            }
        }
    });

    Ok((
        sess_rx,
        Listener {
            local_addr,
            quit: quit_tx,
            task,
        },
    ))
}

async fn accept_session(
    mut stream: TcpStream,
    local_key: StaticSecret,
    remote_keys: HashMap<Vec<u8>, PublicKey>,
    max_frame: usize,
    queue_depth: usize,
) -> Result<Session, SessionError> {
    stream.set_nodelay(true)?;

    let len = stream.read_u32().await? as usize;
    if len > MAX_HELLO {
        return Err(SessionError::FrameTooLarge {
            len,
            max: MAX_HELLO,
        });
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    let hello: Hello = messages::deserialize_bounded(&buf)?;

    let remote_pub = *remote_keys
        .get(&hello.overlay)
        .ok_or(SessionError::UnknownOverlay)?;
    let ephemeral_pub = PublicKey::from(hello.ephemeral);
    let ephemeral_shared = local_key.diffie_hellman(&ephemeral_pub);
    let static_shared = local_key.diffie_hellman(&remote_pub);

    // The seal tag verifies here or the dialer had no overlay key.
    let secret = seal_cipher(
        ephemeral_shared.as_bytes(),
        static_shared.as_bytes(),
        &hello.ephemeral,
        &hello.overlay,
    )?
    .decrypt(&Nonce::default(), hello.sealed.as_slice())
    .map_err(|_| SessionError::Crypto("unseal"))?;
    let secret: [u8; 32] = secret
        .as_slice()
        .try_into()
        .map_err(|_| SessionError::Crypto("unseal"))?;

    let keys = derive_keys(&secret, &hello.overlay, false)?;
    let peer_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    Ok(Session {
        stream,
        keys,
        peer_addr,
        local_addr,
        max_frame,
        queue_depth,
    })
}

fn labeled(label: &[u8], overlay: &[u8]) -> Vec<u8> {
    let mut info = label.to_vec();
    info.extend_from_slice(overlay);
    info
}

/// Single-use cipher sealing the session secret, keyed from both
/// handshake DH results. Each dial uses a fresh ephemeral key, so the
/// zero nonce never repeats under one seal key.
fn seal_cipher(
    ephemeral_shared: &[u8],
    static_shared: &[u8],
    ephemeral_pub: &[u8],
    overlay: &[u8],
) -> Result<ChaCha20Poly1305, SessionError> {
    let mut ikm = ephemeral_shared.to_vec();
    ikm.extend_from_slice(static_shared);
    let mut expander =
        HkdfStream::<Sha256>::new(&ikm, Some(ephemeral_pub), &labeled(SEAL_INFO, overlay));
    let mut key = [0u8; KEY_LEN];
    expander.read(&mut key)?;
    Ok(ChaCha20Poly1305::new(&key.into()))
}

/// One direction's AEAD state from its two labeled expanders: the `-enc`
/// stream keys the cipher, the `-mac` stream salts its nonce space.
fn direction(
    secret: &[u8],
    overlay: &[u8],
    enc_label: &[u8],
    mac_label: &[u8],
) -> Result<DirectionKey, SessionError> {
    let mut expander = HkdfStream::<Sha256>::new(secret, None, &labeled(enc_label, overlay));
    let mut key = [0u8; KEY_LEN];
    expander.read(&mut key)?;

    let mut expander = HkdfStream::<Sha256>::new(secret, None, &labeled(mac_label, overlay));
    let mut salt = [0u8; NONCE_SALT_LEN];
    expander.read(&mut salt)?;

    Ok(DirectionKey {
        cipher: ChaCha20Poly1305::new(&key.into()),
        salt,
        counter: 0,
    })
}

fn derive_keys(secret: &[u8], overlay: &[u8], initiator: bool) -> Result<SessionKeys, SessionError> {
    let to_acceptor = direction(secret, overlay, INIT_TO_ACC_ENC, INIT_TO_ACC_MAC)?;
    let to_initiator = direction(secret, overlay, ACC_TO_INIT_ENC, ACC_TO_INIT_MAC)?;
    let (send, recv) = if initiator {
        (to_acceptor, to_initiator)
    } else {
        (to_initiator, to_acceptor)
    };
    Ok(SessionKeys { send, recv })
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &mut DirectionKey,
    msg: &Message,
    max_frame: usize,
) -> Result<(), SessionError> {
    let payload = messages::serialize(msg)?;
    if payload.len() > max_frame {
        return Err(SessionError::FrameTooLarge {
            len: payload.len(),
            max: max_frame,
        });
    }

    // The length prefix is bound into the frame as associated data.
    let len = ((payload.len() + TAG_LEN) as u32).to_be_bytes();
    let sealed = key.seal(&len, &payload)?;

    writer.write_all(&len).await?;
    writer.write_all(&sealed).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    key: &mut DirectionKey,
    max_frame: usize,
) -> Result<Message, SessionError> {
    let len = reader.read_u32().await? as usize;
    if len > max_frame + TAG_LEN {
        return Err(SessionError::FrameTooLarge {
            len,
            max: max_frame,
        });
    }
    let mut sealed = vec![0u8; len];
    reader.read_exact(&mut sealed).await?;

    let payload = key.open(&(len as u32).to_be_bytes(), &sealed)?;
    Ok(messages::deserialize_bounded(&payload)?)
}
