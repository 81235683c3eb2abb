//! Encrypted peer session: per-peer TCP links, message send, resource
//! transfer, and the event stream the coordinators consume.
//!
//! A link is adopted after the invitation handshake settles (see
//! `advertiser`/`browser`). From then on the stream carries sealed
//! `SessionFrame` records: 4-byte LE length + ChaCha20-Poly1305 ciphertext,
//! one frame per record, directional keys and counters per side.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use huddle_core::identity::{
    derive_link_keys, Keypair, LinkRole, PeerId, PeerIdentity, PublicKey, WireCipher,
};
use huddle_core::protocol::{ConnectionState, Reliability, SessionFrame};
use huddle_core::wire::{decode_payload, encode_payload};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

const LEN_SIZE: usize = 4;
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024; // 16 MiB
const RESOURCE_CHUNK_LEN: usize = 64 * 1024;
/// Resources are reassembled in memory before landing in a temp file.
const MAX_RESOURCE_LEN: u64 = 256 * 1024 * 1024;

/// What happened on the session, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    PeerState {
        peer: PeerIdentity,
        state: ConnectionState,
    },
    DataReceived {
        peer: PeerIdentity,
        payload: Vec<u8>,
    },
    ResourceReceiveStarted {
        peer: PeerIdentity,
        name: String,
    },
    /// `path` points at the reassembled temp file on success; the consumer
    /// is expected to read and then discard it. On failure `path` is `None`
    /// and `error` says why.
    ResourceReceiveFinished {
        peer: PeerIdentity,
        name: String,
        path: Option<PathBuf>,
        error: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no connected peers to send to")]
    NoConnectedPeers,
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("link to peer {0} is closed")]
    LinkClosed(PeerId),
    #[error("resource too large to send ({0} bytes)")]
    ResourceTooLarge(u64),
    #[error("resource i/o error: {0}")]
    Io(#[from] std::io::Error),
}

struct Link {
    peer: PeerIdentity,
    tx: mpsc::UnboundedSender<SessionFrame>,
    reader: tokio::task::AbortHandle,
}

struct SessionInner {
    keypair: Arc<Keypair>,
    local: PeerIdentity,
    links: Mutex<HashMap<PeerId, Link>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Handle to the multi-peer session. Cheap to clone; all clones share the
/// same link registry and event stream.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        keypair: Arc<Keypair>,
        local: PeerIdentity,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Session {
            inner: Arc::new(SessionInner {
                keypair,
                local,
                links: Mutex::new(HashMap::new()),
                events,
            }),
        };
        (session, events_rx)
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.inner.local
    }

    pub async fn connected_peers(&self) -> Vec<PeerIdentity> {
        let links = self.inner.links.lock().await;
        links.values().map(|l| l.peer.clone()).collect()
    }

    pub async fn is_connected(&self, peer_id: PeerId) -> bool {
        self.inner.links.lock().await.contains_key(&peer_id)
    }

    /// Queue one message to each addressed peer that still has a live link.
    /// Fails only when nothing could be queued at all; partial delivery to a
    /// subset of `to` is success, matching the fire-and-forget contract.
    /// Both reliability modes ride the same TCP link.
    pub async fn send(
        &self,
        payload: &[u8],
        to: &[PeerId],
        _mode: Reliability,
    ) -> Result<(), TransportError> {
        let frame = SessionFrame::Data {
            payload: payload.to_vec(),
        };
        let links = self.inner.links.lock().await;
        let mut delivered = 0usize;
        for id in to {
            if let Some(link) = links.get(id) {
                if link.tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        if delivered == 0 {
            return Err(TransportError::NoConnectedPeers);
        }
        Ok(())
    }

    /// Stream a file to one peer as a named resource.
    pub async fn send_resource(
        &self,
        path: &Path,
        name: &str,
        to: PeerId,
    ) -> Result<(), TransportError> {
        let bytes = tokio::fs::read(path).await?;
        self.send_resource_bytes(&bytes, name, to).await
    }

    /// Stream an in-memory blob to one peer as a named resource.
    pub async fn send_resource_bytes(
        &self,
        bytes: &[u8],
        name: &str,
        to: PeerId,
    ) -> Result<(), TransportError> {
        if bytes.len() as u64 > MAX_RESOURCE_LEN {
            return Err(TransportError::ResourceTooLarge(bytes.len() as u64));
        }
        let tx = {
            let links = self.inner.links.lock().await;
            links
                .get(&to)
                .map(|l| l.tx.clone())
                .ok_or(TransportError::UnknownPeer(to))?
        };
        let transfer_id: [u8; 16] = uuid::Uuid::new_v4().into_bytes();
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        tx.send(SessionFrame::ResourceHeader {
            transfer_id,
            name: name.to_string(),
            len: bytes.len() as u64,
        })
        .map_err(|_| TransportError::LinkClosed(to))?;
        for (i, chunk) in bytes.chunks(RESOURCE_CHUNK_LEN).enumerate() {
            tx.send(SessionFrame::ResourceChunk {
                transfer_id,
                offset: (i * RESOURCE_CHUNK_LEN) as u64,
                payload: chunk.to_vec(),
            })
            .map_err(|_| TransportError::LinkClosed(to))?;
        }
        tx.send(SessionFrame::ResourceEnd {
            transfer_id,
            digest,
        })
        .map_err(|_| TransportError::LinkClosed(to))?;
        Ok(())
    }

    /// Tear down every link. Each connected peer emits `NotConnected` right
    /// away; the sockets are closed underneath their tasks.
    pub async fn disconnect(&self) {
        let mut links = self.inner.links.lock().await;
        for (_, link) in links.drain() {
            link.reader.abort();
            debug!("disconnected {}", link.peer);
            let _ = self.inner.events.send(SessionEvent::PeerState {
                peer: link.peer,
                state: ConnectionState::NotConnected,
            });
        }
    }

    /// Attach a TCP stream that just finished the invitation handshake.
    /// Emits `Connecting` then `Connected`, registers the link, and spawns
    /// the writer task and read loop. A second link to the same peer
    /// replaces the first.
    pub(crate) async fn adopt_stream(
        &self,
        stream: TcpStream,
        peer: PeerIdentity,
        peer_public: &PublicKey,
        role: LinkRole,
    ) {
        let _ = self.inner.events.send(SessionEvent::PeerState {
            peer: peer.clone(),
            state: ConnectionState::Connecting,
        });

        let shared = self.inner.keypair.shared_secret(peer_public);
        let keys = derive_link_keys(&shared, role);
        let send_cipher = WireCipher::new(&keys.send);
        let recv_cipher = WireCipher::new(&keys.recv);

        let (tx, rx) = mpsc::unbounded_channel::<SessionFrame>();
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(write_loop(write_half, rx, send_cipher));

        let inner = self.inner.clone();
        let reader_peer = peer.clone();
        let reader_tx = tx.clone();
        // The link is registered and `Connected` is sent while this lock is
        // held. The reader's teardown takes the same lock, so a link that
        // dies the moment it comes up still finds its map entry and its
        // `NotConnected` follows the `Connected` it undoes.
        let mut links = self.inner.links.lock().await;
        let reader = tokio::spawn(async move {
            read_loop(read_half, recv_cipher, &reader_peer, &inner).await;
            // Remove the link only if it is still ours; a replacement link
            // for the same peer must survive this teardown.
            let mut links = inner.links.lock().await;
            match links.get(&reader_peer.id) {
                Some(link) if link.tx.same_channel(&reader_tx) => {
                    links.remove(&reader_peer.id);
                    let _ = inner.events.send(SessionEvent::PeerState {
                        peer: reader_peer,
                        state: ConnectionState::NotConnected,
                    });
                }
                _ => {}
            }
        });

        let replaced = links.insert(
            peer.id,
            Link {
                peer: peer.clone(),
                tx,
                reader: reader.abort_handle(),
            },
        );
        if let Some(old) = replaced {
            debug!("replacing existing link to {}", peer);
            old.reader.abort();
        }
        let _ = self.inner.events.send(SessionEvent::PeerState {
            peer,
            state: ConnectionState::Connected,
        });
    }
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<SessionFrame>,
    mut cipher: WireCipher,
) {
    while let Some(frame) = rx.recv().await {
        let plain = match encode_payload(&frame) {
            Ok(p) => p,
            Err(err) => {
                warn!("dropping unencodable session frame: {err}");
                continue;
            }
        };
        let sealed = match cipher.seal(&plain) {
            Ok(s) => s,
            Err(_) => break,
        };
        let len = sealed.len() as u32;
        if half.write_all(&len.to_le_bytes()).await.is_err() {
            break;
        }
        if half.write_all(&sealed).await.is_err() {
            break;
        }
        let _ = half.flush().await;
    }
}

struct PendingResource {
    name: String,
    len: u64,
    buf: Vec<u8>,
}

async fn read_loop(
    mut half: OwnedReadHalf,
    mut cipher: WireCipher,
    peer: &PeerIdentity,
    inner: &Arc<SessionInner>,
) {
    let mut pending: HashMap<[u8; 16], PendingResource> = HashMap::new();
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if half.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_RECORD_LEN {
            warn!("oversized record from {peer}, dropping link");
            break;
        }
        let mut sealed = vec![0u8; len as usize];
        if half.read_exact(&mut sealed).await.is_err() {
            break;
        }
        let plain = match cipher.open(&sealed) {
            Ok(p) => p,
            Err(_) => {
                warn!("undecryptable record from {peer}, dropping link");
                break;
            }
        };
        let frame: SessionFrame = match decode_payload(&plain) {
            Ok(f) => f,
            Err(err) => {
                warn!("malformed session frame from {peer}: {err}");
                break;
            }
        };
        match frame {
            SessionFrame::Data { payload } => {
                let _ = inner.events.send(SessionEvent::DataReceived {
                    peer: peer.clone(),
                    payload,
                });
            }
            SessionFrame::ResourceHeader {
                transfer_id,
                name,
                len,
            } => {
                let _ = inner.events.send(SessionEvent::ResourceReceiveStarted {
                    peer: peer.clone(),
                    name: name.clone(),
                });
                if len > MAX_RESOURCE_LEN {
                    let _ = inner.events.send(SessionEvent::ResourceReceiveFinished {
                        peer: peer.clone(),
                        name,
                        path: None,
                        error: Some(format!("resource too large ({len} bytes)")),
                    });
                    continue;
                }
                pending.insert(
                    transfer_id,
                    PendingResource {
                        name,
                        len,
                        buf: Vec::new(),
                    },
                );
            }
            SessionFrame::ResourceChunk {
                transfer_id,
                offset,
                payload,
            } => {
                let out_of_order = match pending.get_mut(&transfer_id) {
                    Some(res) => {
                        if offset != res.buf.len() as u64
                            || res.buf.len() as u64 + payload.len() as u64 > res.len
                        {
                            true
                        } else {
                            res.buf.extend_from_slice(&payload);
                            false
                        }
                    }
                    // Chunk for a transfer we never saw a header for.
                    None => false,
                };
                if out_of_order {
                    if let Some(res) = pending.remove(&transfer_id) {
                        let _ = inner.events.send(SessionEvent::ResourceReceiveFinished {
                            peer: peer.clone(),
                            name: res.name,
                            path: None,
                            error: Some("resource stream out of order".to_string()),
                        });
                    }
                }
            }
            SessionFrame::ResourceEnd {
                transfer_id,
                digest,
            } => {
                if let Some(res) = pending.remove(&transfer_id) {
                    let event = finish_resource(peer, res, digest).await;
                    let _ = inner.events.send(event);
                }
            }
        }
    }
    // Anything still mid-transfer died with the link.
    for (_, res) in pending.drain() {
        let _ = inner.events.send(SessionEvent::ResourceReceiveFinished {
            peer: peer.clone(),
            name: res.name,
            path: None,
            error: Some("connection closed".to_string()),
        });
    }
}

async fn finish_resource(
    peer: &PeerIdentity,
    res: PendingResource,
    digest: [u8; 32],
) -> SessionEvent {
    if res.buf.len() as u64 != res.len {
        return SessionEvent::ResourceReceiveFinished {
            peer: peer.clone(),
            name: res.name,
            path: None,
            error: Some("resource truncated".to_string()),
        };
    }
    let computed: [u8; 32] = Sha256::digest(&res.buf).into();
    if computed != digest {
        return SessionEvent::ResourceReceiveFinished {
            peer: peer.clone(),
            name: res.name,
            path: None,
            error: Some("resource digest mismatch".to_string()),
        };
    }
    let file_name = format!("huddle-{}-{}", sanitize_name(&res.name), uuid::Uuid::new_v4());
    let path = std::env::temp_dir().join(file_name);
    match tokio::fs::write(&path, &res.buf).await {
        Ok(()) => SessionEvent::ResourceReceiveFinished {
            peer: peer.clone(),
            name: res.name,
            path: Some(path),
            error: None,
        },
        Err(err) => SessionEvent::ResourceReceiveFinished {
            peer: peer.clone(),
            name: res.name,
            path: None,
            error: Some(format!("cannot store resource: {err}")),
        },
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write one plaintext control frame (invitation handshake traffic).
pub(crate) async fn write_control_frame(
    stream: &mut TcpStream,
    frame: &huddle_core::ControlFrame,
) -> std::io::Result<()> {
    let bytes = huddle_core::encode_frame(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

/// Read one plaintext control frame (invitation handshake traffic).
pub(crate) async fn read_control_frame(
    stream: &mut TcpStream,
) -> std::io::Result<huddle_core::ControlFrame> {
    let mut len_buf = [0u8; LEN_SIZE];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_RECORD_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized control frame",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    decode_payload(&payload).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
