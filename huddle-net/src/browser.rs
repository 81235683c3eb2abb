//! Service browsing: listen for UDP announces, keep a last-seen table with
//! expiry, and run outbound invitation handshakes.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use huddle_core::identity::{Keypair, PeerId, PeerIdentity, PublicKey};
use huddle_core::protocol::{ControlFrame, PROTOCOL_VERSION};
use huddle_core::wire::decode_payload;
use huddle_core::LinkRole;
use log::{debug, warn};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::NetConfig;
use crate::session::{read_control_frame, write_control_frame, Session};

/// Discovery updates, in arrival order.
#[derive(Debug)]
pub enum BrowserEvent {
    PeerFound {
        peer: PeerIdentity,
        discovery_info: Vec<(String, String)>,
    },
    PeerLost {
        peer: PeerIdentity,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("peer {0} has not been discovered")]
    UnknownPeer(PeerId),
}

struct DiscoveredPeer {
    peer: PeerIdentity,
    public_key: PublicKey,
    invite_addr: SocketAddr,
    discovery_info: Vec<(String, String)>,
    last_seen: Instant,
}

/// Watches one service namespace and opens invitations toward its peers.
pub struct Browser {
    local: PeerIdentity,
    keypair: Arc<Keypair>,
    service: String,
    config: NetConfig,
    events: mpsc::UnboundedSender<BrowserEvent>,
    discovered: Arc<Mutex<HashMap<PeerId, DiscoveredPeer>>>,
    tasks: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

impl Browser {
    pub fn new(
        local: PeerIdentity,
        keypair: Arc<Keypair>,
        service: impl Into<String>,
        config: NetConfig,
    ) -> (Self, mpsc::UnboundedReceiver<BrowserEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                local,
                keypair,
                service: service.into(),
                config,
                events,
                discovered: Arc::new(Mutex::new(HashMap::new())),
                tasks: None,
            },
            events_rx,
        )
    }

    pub fn is_browsing(&self) -> bool {
        self.tasks.is_some()
    }

    /// Bind the announce port and start collecting peers. Starting twice is
    /// a no-op.
    pub async fn start_browsing(&mut self) -> std::io::Result<()> {
        if self.tasks.is_some() {
            debug!("browser for {} already running", self.service);
            return Ok(());
        }
        let socket = make_announce_socket(&self.config)?;
        let recv_task = tokio::spawn(recv_loop(
            socket,
            self.local.id,
            self.service.clone(),
            self.discovered.clone(),
            self.events.clone(),
        ));
        let expiry_task = tokio::spawn(expiry_loop(
            self.discovered.clone(),
            self.events.clone(),
            self.config.peer_timeout(),
        ));
        debug!("browsing {} on port {}", self.service, self.config.announce_port);
        self.tasks = Some((recv_task, expiry_task));
        Ok(())
    }

    /// Stop listening for announces. Already-discovered peers are kept, so
    /// an invitation issued right after stopping still has a target.
    pub fn stop_browsing(&mut self) {
        if let Some((recv_task, expiry_task)) = self.tasks.take() {
            recv_task.abort();
            expiry_task.abort();
            debug!("stopped browsing {}", self.service);
        }
    }

    /// Currently visible peers, in no particular order.
    pub async fn discovered_peers(&self) -> Vec<PeerIdentity> {
        let d = self.discovered.lock().await;
        d.values().map(|p| p.peer.clone()).collect()
    }

    /// Invite a discovered peer into `session`. Fire-and-forget: the
    /// handshake runs in the background and the caller learns the outcome
    /// through session peer-state events, or not at all on decline/timeout.
    pub async fn invite(
        &self,
        peer_id: PeerId,
        session: &Session,
        context: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), InviteError> {
        let (peer, announced_key, addr) = {
            let d = self.discovered.lock().await;
            let found = d.get(&peer_id).ok_or(InviteError::UnknownPeer(peer_id))?;
            (found.peer.clone(), found.public_key.clone(), found.invite_addr)
        };
        let session = session.clone();
        let local = self.local.clone();
        let keypair = self.keypair.clone();
        let service = self.service.clone();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                timeout,
                run_invite(addr, &peer, announced_key, session, local, keypair, service, context),
            )
            .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!("invitation to {peer} failed: {err}"),
                Err(_) => debug!("invitation to {peer} timed out"),
            }
        });
        Ok(())
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.stop_browsing();
    }
}

fn make_announce_socket(config: &NetConfig) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", config.announce_port))?;
    if let Ok(group) = config.announce_addr.parse::<Ipv4Addr>() {
        if group.is_multicast() {
            std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }
    }
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn recv_loop(
    socket: UdpSocket,
    my_id: PeerId,
    service: String,
    discovered: Arc<Mutex<HashMap<PeerId, DiscoveredPeer>>>,
    events: mpsc::UnboundedSender<BrowserEvent>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if let Ok(frame) = decode_payload::<ControlFrame>(&buf[..n]) {
                    match frame {
                        ControlFrame::Announce {
                            protocol_version,
                            service: announced,
                            id,
                            public_key,
                            display_name,
                            invite_port,
                            discovery_info,
                        } => {
                            if protocol_version != PROTOCOL_VERSION || announced != service {
                                continue;
                            }
                            if id == my_id {
                                continue;
                            }
                            if PeerId::from_public_key(&public_key) != id {
                                continue;
                            }
                            let peer = PeerIdentity::new(id, display_name);
                            let invite_addr = SocketAddr::new(from.ip(), invite_port);
                            let is_new = {
                                let mut d = discovered.lock().await;
                                let is_new = !d.contains_key(&id);
                                d.insert(
                                    id,
                                    DiscoveredPeer {
                                        peer: peer.clone(),
                                        public_key,
                                        invite_addr,
                                        discovery_info: discovery_info.clone(),
                                        last_seen: Instant::now(),
                                    },
                                );
                                is_new
                            };
                            if is_new {
                                debug!("found {peer} for {service}");
                                let _ = events.send(BrowserEvent::PeerFound {
                                    peer,
                                    discovery_info,
                                });
                            }
                        }
                        ControlFrame::Bye { service: announced, id } => {
                            if announced != service {
                                continue;
                            }
                            let removed = discovered.lock().await.remove(&id);
                            if let Some(entry) = removed {
                                debug!("{} said goodbye", entry.peer);
                                let _ = events.send(BrowserEvent::PeerLost { peer: entry.peer });
                            }
                        }
                        _ => {}
                    }
                }
            }
            Err(err) => {
                warn!("announce receive failed: {err}");
                break;
            }
        }
    }
}

async fn expiry_loop(
    discovered: Arc<Mutex<HashMap<PeerId, DiscoveredPeer>>>,
    events: mpsc::UnboundedSender<BrowserEvent>,
    timeout: Duration,
) {
    let tick = (timeout / 4).max(Duration::from_millis(250));
    loop {
        tokio::time::sleep(tick).await;
        let now = Instant::now();
        let expired: Vec<PeerIdentity> = {
            let mut d = discovered.lock().await;
            let stale: Vec<PeerId> = d
                .iter()
                .filter(|(_, p)| now.duration_since(p.last_seen) >= timeout)
                .map(|(id, _)| *id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| d.remove(&id))
                .map(|p| p.peer)
                .collect()
        };
        for peer in expired {
            debug!("{peer} went quiet");
            let _ = events.send(BrowserEvent::PeerLost { peer });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_invite(
    addr: SocketAddr,
    peer: &PeerIdentity,
    announced_key: PublicKey,
    session: Session,
    local: PeerIdentity,
    keypair: Arc<Keypair>,
    service: String,
    context: Option<Vec<u8>>,
) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    let invite = ControlFrame::Invite {
        protocol_version: PROTOCOL_VERSION,
        service,
        id: local.id,
        public_key: keypair.public_key().clone(),
        display_name: local.display_name.clone(),
        context,
    };
    write_control_frame(&mut stream, &invite).await?;
    match read_control_frame(&mut stream).await? {
        ControlFrame::InviteAccept {
            id,
            public_key,
            display_name,
        } => {
            if id != peer.id || public_key != announced_key {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "handshake identity does not match announce",
                ));
            }
            // Display name from the accept frame wins; the announce may be
            // older.
            let peer = PeerIdentity::new(id, display_name);
            session
                .adopt_stream(stream, peer, &public_key, LinkRole::Initiator)
                .await;
            Ok(())
        }
        ControlFrame::InviteDecline => Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "invitation declined",
        )),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected handshake frame",
        )),
    }
}
