//! Service advertising: the periodic UDP announce loop plus the TCP listener
//! that fields inbound invitations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use huddle_core::identity::{Keypair, PeerId, PeerIdentity};
use huddle_core::protocol::{ControlFrame, PROTOCOL_VERSION};
use huddle_core::wire::encode_payload;
use huddle_core::LinkRole;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::NetConfig;
use crate::session::{read_control_frame, write_control_frame, Session};

/// How long an inbound connection may take to present its `Invite` frame.
const INVITE_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Surfaced for every well-formed inbound invitation. The receiver decides;
/// dropping the responder declines.
pub enum AdvertiserEvent {
    Invitation {
        peer: PeerIdentity,
        context: Option<Vec<u8>>,
        responder: InviteResponder,
    },
}

/// Single-use answer to an invitation. Accepting hands the connection to the
/// given session, which then emits `Connecting`/`Connected` for the inviter.
pub struct InviteResponder {
    tx: oneshot::Sender<Option<Session>>,
}

impl InviteResponder {
    pub fn accept(self, session: &Session) {
        let _ = self.tx.send(Some(session.clone()));
    }

    pub fn decline(self) {
        let _ = self.tx.send(None);
    }
}

struct Running {
    announce: JoinHandle<()>,
    accept: JoinHandle<()>,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    invite_port: u16,
}

/// Announces the local peer under one service name and accepts invitations
/// for it. One advertiser per service.
pub struct Advertiser {
    local: PeerIdentity,
    keypair: Arc<Keypair>,
    service: String,
    discovery_info: Vec<(String, String)>,
    config: NetConfig,
    events: mpsc::UnboundedSender<AdvertiserEvent>,
    running: Option<Running>,
}

impl Advertiser {
    pub fn new(
        local: PeerIdentity,
        keypair: Arc<Keypair>,
        service: impl Into<String>,
        config: NetConfig,
    ) -> (Self, mpsc::UnboundedReceiver<AdvertiserEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                local,
                keypair,
                service: service.into(),
                discovery_info: Vec::new(),
                config,
                events,
                running: None,
            },
            events_rx,
        )
    }

    /// Key/value pairs carried in every announce. Set before `start`.
    pub fn set_discovery_info(&mut self, info: Vec<(String, String)>) {
        self.discovery_info = info;
    }

    pub fn is_advertising(&self) -> bool {
        self.running.is_some()
    }

    /// TCP port invitations are accepted on while running.
    pub fn invite_port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.invite_port)
    }

    /// Bind the invitation listener and start announcing. Starting twice is
    /// a no-op.
    pub async fn start(&mut self) -> std::io::Result<()> {
        if self.running.is_some() {
            debug!("advertiser for {} already running", self.service);
            return Ok(());
        }
        let target = self
            .config
            .announce_target()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(("0.0.0.0", self.config.invite_port)).await?;
        let invite_port = listener.local_addr()?.port();
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        if target.ip().is_multicast() {
            socket.set_multicast_ttl_v4(1)?;
        }
        let socket = Arc::new(socket);

        let announce = encode_payload(&self.announce_frame(invite_port))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let send_socket = socket.clone();
        let interval = self.config.announce_interval();
        let announce_task = tokio::spawn(async move {
            loop {
                let _ = send_socket.send_to(&announce, target).await;
                tokio::time::sleep(interval).await;
            }
        });

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.local.clone(),
            self.keypair.clone(),
            self.service.clone(),
            self.events.clone(),
        ));

        info!(
            "advertising {} as {} (invites on port {invite_port})",
            self.service, self.local
        );
        self.running = Some(Running {
            announce: announce_task,
            accept: accept_task,
            socket,
            target,
            invite_port,
        });
        Ok(())
    }

    /// Stop announcing and close the listener. A best-effort `Bye` lets
    /// browsers drop us without waiting out the announce timeout.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            // The announce loop must be dead before the Bye goes out, or a
            // late announce could resurrect us in someone's peer table.
            running.announce.abort();
            running.accept.abort();
            let bye = ControlFrame::Bye {
                service: self.service.clone(),
                id: self.local.id,
            };
            if let Ok(bytes) = encode_payload(&bye) {
                let _ = running.socket.try_send_to(&bytes, running.target);
            }
            info!("stopped advertising {}", self.service);
        }
    }

    fn announce_frame(&self, invite_port: u16) -> ControlFrame {
        ControlFrame::Announce {
            protocol_version: PROTOCOL_VERSION,
            service: self.service.clone(),
            id: self.local.id,
            public_key: self.keypair.public_key().clone(),
            display_name: self.local.display_name.clone(),
            invite_port,
            discovery_info: self.discovery_info.clone(),
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    local: PeerIdentity,
    keypair: Arc<Keypair>,
    service: String,
    events: mpsc::UnboundedSender<AdvertiserEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let local = local.clone();
                let keypair = keypair.clone();
                let service = service.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_invite(stream, local, keypair, &service, events).await
                    {
                        debug!("invitation from {addr} not completed: {err}");
                    }
                });
            }
            Err(err) => {
                warn!("invite accept failed: {err}");
                break;
            }
        }
    }
}

async fn handle_invite(
    mut stream: TcpStream,
    local: PeerIdentity,
    keypair: Arc<Keypair>,
    service: &str,
    events: mpsc::UnboundedSender<AdvertiserEvent>,
) -> std::io::Result<()> {
    let frame = tokio::time::timeout(INVITE_READ_TIMEOUT, read_control_frame(&mut stream))
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "invite frame timed out")
        })??;

    let (peer, peer_public, context) = match frame {
        ControlFrame::Invite {
            protocol_version,
            service: invite_service,
            id,
            public_key,
            display_name,
            context,
        } => {
            // Wrong namespace or version: not for us, drop without a reply.
            if protocol_version != PROTOCOL_VERSION || invite_service != service {
                return Ok(());
            }
            if PeerId::from_public_key(&public_key) != id {
                debug!("invite id does not match its public key, dropping");
                return Ok(());
            }
            (PeerIdentity::new(id, display_name), public_key, context)
        }
        _ => return Ok(()),
    };

    let (tx, rx) = oneshot::channel::<Option<Session>>();
    let sent = events.send(AdvertiserEvent::Invitation {
        peer: peer.clone(),
        context,
        responder: InviteResponder { tx },
    });
    if sent.is_err() {
        // Nobody is listening for invitations anymore.
        let _ = write_control_frame(&mut stream, &ControlFrame::InviteDecline).await;
        return Ok(());
    }

    match rx.await {
        Ok(Some(session)) => {
            let accept = ControlFrame::InviteAccept {
                id: local.id,
                public_key: keypair.public_key().clone(),
                display_name: local.display_name.clone(),
            };
            write_control_frame(&mut stream, &accept).await?;
            session
                .adopt_stream(stream, peer, &peer_public, LinkRole::Responder)
                .await;
        }
        // Explicit decline, or the responder was dropped undecided.
        _ => {
            let _ = write_control_frame(&mut stream, &ControlFrame::InviteDecline).await;
        }
    }
    Ok(())
}
