//! Chat coordinator: one owner task drives `ChatCore`, executing its actions
//! against the session, advertiser, and browser, and publishing observable
//! state through watch channels.

use std::sync::Arc;
use std::time::Duration;

use huddle_core::chat::{ChatAction, ChatCore, ChatMessage, CHAT_SERVICE, HISTORY_RESOURCE};
use huddle_core::identity::{Keypair, PeerId, PeerIdentity};
use huddle_core::protocol::{ConnectionState, Reliability};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::advertiser::{Advertiser, AdvertiserEvent};
use crate::browser::{Browser, BrowserEvent};
use crate::config::NetConfig;
use crate::session::{Session, SessionEvent, TransportError};

/// How long a picker invitation waits before giving up on the host.
const CHAT_INVITE_TIMEOUT: Duration = Duration::from_secs(30);

enum ChatCmd {
    Host,
    // Join carries the handle's own sender for the picker it mints. The
    // driver must not hold one itself, or `cmd_rx` would never close and
    // dropping the last handle could not shut the driver down.
    Join {
        cmd: mpsc::UnboundedSender<ChatCmd>,
        reply: oneshot::Sender<ChatPicker>,
    },
    PickerFinished,
    PickerCancelled,
    Invite { peer_id: PeerId },
    Send { body: String },
    Leave,
}

/// Handle to a running chat coordinator. Cloneable; all clones talk to the
/// same driver task.
#[derive(Clone)]
pub struct ChatCoordinator {
    cmd: mpsc::UnboundedSender<ChatCmd>,
    local: PeerIdentity,
    messages: watch::Receiver<Vec<ChatMessage>>,
    peers: watch::Receiver<Vec<PeerIdentity>>,
    connected: watch::Receiver<bool>,
}

/// The join flow's peer picker: a stream of discovered hosts plus the
/// invite/finish/cancel controls. Dropping it without a verdict leaves the
/// coordinator browsing until `finish`/`cancel`/`leave_chat`. An open picker
/// counts as a live handle: the driver runs until the picker and every
/// `ChatCoordinator` clone are gone.
pub struct ChatPicker {
    cmd: mpsc::UnboundedSender<ChatCmd>,
    events: mpsc::UnboundedReceiver<BrowserEvent>,
}

impl ChatPicker {
    /// Next discovery update, or `None` once the coordinator is gone.
    pub async fn next_event(&mut self) -> Option<BrowserEvent> {
        self.events.recv().await
    }

    /// Ask the coordinator to invite a discovered host into the session.
    pub fn invite(&self, peer_id: PeerId) {
        let _ = self.cmd.send(ChatCmd::Invite { peer_id });
    }

    /// The user picked a room; the coordinator counts itself as in the chat.
    pub fn finish(self) {
        let _ = self.cmd.send(ChatCmd::PickerFinished);
    }

    /// The user backed out; any half-open link is dropped.
    pub fn cancel(self) {
        let _ = self.cmd.send(ChatCmd::PickerCancelled);
    }
}

impl ChatCoordinator {
    /// Spawn a chat coordinator with a fresh keypair. Must be called from
    /// within a tokio runtime.
    pub fn new(display_name: &str, config: NetConfig) -> Self {
        Self::with_keypair(Arc::new(Keypair::generate()), display_name, config)
    }

    pub fn with_keypair(keypair: Arc<Keypair>, display_name: &str, config: NetConfig) -> Self {
        let local = keypair.identity(display_name);
        let (session, session_rx) = Session::new(keypair.clone(), local.clone());
        let (advertiser, adv_rx) =
            Advertiser::new(local.clone(), keypair.clone(), CHAT_SERVICE, config.clone());
        let (browser, browser_rx) = Browser::new(local.clone(), keypair, CHAT_SERVICE, config);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = watch::channel(Vec::new());
        let (peers_tx, peers_rx) = watch::channel(Vec::new());
        let (connected_tx, connected_rx) = watch::channel(false);

        let driver = ChatDriver {
            core: ChatCore::new(local.clone()),
            session,
            advertiser,
            browser,
            cmd_rx,
            session_rx,
            adv_rx,
            browser_rx,
            picker_tx: None,
            messages_tx,
            peers_tx,
            connected_tx,
        };
        tokio::spawn(driver.run());

        Self {
            cmd: cmd_tx,
            local,
            messages: messages_rx,
            peers: peers_rx,
            connected: connected_rx,
        }
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    /// Open a room and start advertising for joiners.
    pub fn host(&self) {
        let _ = self.cmd.send(ChatCmd::Host);
    }

    /// Start the join flow. Returns the picker, or `None` if the
    /// coordinator has shut down.
    pub async fn join(&self) -> Option<ChatPicker> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(ChatCmd::Join {
                cmd: self.cmd.clone(),
                reply,
            })
            .ok()?;
        rx.await.ok()
    }

    /// Send a line of chat. Fire-and-forget; the local echo shows up in
    /// `messages()` either way.
    pub fn send(&self, body: impl Into<String>) {
        let _ = self.cmd.send(ChatCmd::Send { body: body.into() });
    }

    /// Leave the room and tear the session down.
    pub fn leave_chat(&self) {
        let _ = self.cmd.send(ChatCmd::Leave);
    }

    /// Observable message log, oldest first.
    pub fn messages(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages.clone()
    }

    /// Observable connected-peer list, newest connection first.
    pub fn peers(&self) -> watch::Receiver<Vec<PeerIdentity>> {
        self.peers.clone()
    }

    /// Observable in-the-chat flag.
    pub fn connected_to_chat(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

struct ChatDriver {
    core: ChatCore,
    session: Session,
    advertiser: Advertiser,
    browser: Browser,
    cmd_rx: mpsc::UnboundedReceiver<ChatCmd>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    adv_rx: mpsc::UnboundedReceiver<AdvertiserEvent>,
    browser_rx: mpsc::UnboundedReceiver<BrowserEvent>,
    /// Forwarding end of the active picker's discovery stream.
    picker_tx: Option<mpsc::UnboundedSender<BrowserEvent>>,
    messages_tx: watch::Sender<Vec<ChatMessage>>,
    peers_tx: watch::Sender<Vec<PeerIdentity>>,
    connected_tx: watch::Sender<bool>,
}

impl ChatDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => break,
                },
                Some(ev) = self.session_rx.recv() => self.handle_session_event(ev).await,
                Some(ev) = self.adv_rx.recv() => self.handle_invitation(ev),
                Some(ev) = self.browser_rx.recv() => self.forward_browser_event(ev),
            }
        }
        // Every handle is gone; tear the whole stack down.
        self.advertiser.stop();
        self.browser.stop_browsing();
        self.session.disconnect().await;
    }

    async fn handle_cmd(&mut self, cmd: ChatCmd) {
        match cmd {
            ChatCmd::Host => {
                let actions = self.core.host();
                self.apply(actions).await;
                self.publish();
            }
            ChatCmd::Join { cmd, reply } => {
                let actions = self.core.join_started();
                self.apply(actions).await;
                let (tx, rx) = mpsc::unbounded_channel();
                self.picker_tx = Some(tx);
                let _ = reply.send(ChatPicker { cmd, events: rx });
                self.publish();
            }
            ChatCmd::PickerFinished => {
                let actions = self.core.picker_finished();
                self.apply(actions).await;
                self.picker_tx = None;
                self.publish();
            }
            ChatCmd::PickerCancelled => {
                let actions = self.core.picker_cancelled();
                self.apply(actions).await;
                self.picker_tx = None;
                self.publish();
            }
            ChatCmd::Invite { peer_id } => {
                let invited = self
                    .browser
                    .invite(peer_id, &self.session, None, CHAT_INVITE_TIMEOUT)
                    .await;
                if let Err(err) = invited {
                    warn!("chat invite failed: {err}");
                }
            }
            ChatCmd::Send { body } => {
                let actions = self.core.send(&body);
                self.apply(actions).await;
                self.publish();
            }
            ChatCmd::Leave => {
                let actions = self.core.leave();
                self.apply(actions).await;
                self.picker_tx = None;
                self.publish();
            }
        }
    }

    async fn handle_session_event(&mut self, ev: SessionEvent) {
        match ev {
            SessionEvent::PeerState { peer, state } => {
                if state == ConnectionState::Connecting {
                    debug!("Connecting to: {peer}");
                }
                let actions = self.core.on_peer_state(&peer, state);
                self.apply(actions).await;
                self.publish();
            }
            SessionEvent::DataReceived { peer, payload } => {
                if !self.core.on_data(&peer, &payload) {
                    warn!("dropped non-text chat payload from {peer}");
                }
                self.publish();
            }
            SessionEvent::ResourceReceiveStarted { peer, name } => {
                debug!("receiving {name} from {peer}");
            }
            SessionEvent::ResourceReceiveFinished {
                peer,
                name,
                path,
                error,
            } => {
                self.handle_resource_finished(peer, name, path, error).await;
                self.publish();
            }
        }
    }

    async fn handle_resource_finished(
        &mut self,
        peer: PeerIdentity,
        name: String,
        path: Option<std::path::PathBuf>,
        error: Option<String>,
    ) {
        if name != HISTORY_RESOURCE {
            debug!("ignoring resource {name} from {peer}");
            if let Some(path) = path {
                let _ = tokio::fs::remove_file(path).await;
            }
            return;
        }
        if let Some(err) = error {
            warn!("chat history from {peer} failed: {err}");
            return;
        }
        let path = match path {
            Some(p) => p,
            None => return,
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                if !self.core.on_history_received(&bytes) {
                    warn!("chat history from {peer} did not decode");
                }
            }
            Err(err) => warn!("cannot read chat history file: {err}"),
        }
        let _ = tokio::fs::remove_file(&path).await;
    }

    fn handle_invitation(&mut self, ev: AdvertiserEvent) {
        // Anyone who finds the room may come in.
        let AdvertiserEvent::Invitation { peer, responder, .. } = ev;
        debug!("auto-accepting chat invitation from {peer}");
        responder.accept(&self.session);
    }

    fn forward_browser_event(&mut self, ev: BrowserEvent) {
        if let Some(tx) = &self.picker_tx {
            if tx.send(ev).is_err() {
                self.picker_tx = None;
            }
        }
    }

    async fn apply(&mut self, actions: Vec<ChatAction>) {
        for action in actions {
            match action {
                ChatAction::StartAdvertising => {
                    if let Err(err) = self.advertiser.start().await {
                        warn!("cannot start chat advertiser: {err}");
                    }
                }
                ChatAction::StopAdvertising => self.advertiser.stop(),
                ChatAction::StartBrowsing => {
                    if let Err(err) = self.browser.start_browsing().await {
                        warn!("cannot start chat browser: {err}");
                    }
                }
                ChatAction::StopBrowsing => self.browser.stop_browsing(),
                ChatAction::DisconnectSession => self.session.disconnect().await,
                ChatAction::Broadcast { payload } => {
                    let targets = self.core.peer_ids();
                    if let Err(err) = self
                        .session
                        .send(&payload, &targets, Reliability::Reliable)
                        .await
                    {
                        warn!("chat broadcast failed: {err}");
                    }
                }
                ChatAction::SendHistory { to, blob } => {
                    let session = self.session.clone();
                    tokio::spawn(async move {
                        if let Err(err) = send_history(&session, to, &blob).await {
                            warn!("chat history send failed: {err}");
                        }
                    });
                }
            }
        }
    }

    fn publish(&self) {
        self.messages_tx.send_replace(self.core.messages().to_vec());
        self.peers_tx.send_replace(self.core.peers().to_vec());
        self.connected_tx.send_replace(self.core.connected_to_chat());
    }
}

/// The history blob travels as a file-backed resource, so it takes the same
/// path application resources do.
async fn send_history(session: &Session, to: PeerId, blob: &[u8]) -> Result<(), TransportError> {
    let path = std::env::temp_dir().join(format!("huddle-history-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, blob).await?;
    let result = session.send_resource(&path, HISTORY_RESOURCE, to).await;
    let _ = tokio::fs::remove_file(&path).await;
    result
}
