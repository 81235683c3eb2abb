//! Chat coordinator state machine: message log, peer roster, host/join
//! lifecycle. Host-driven like the rest of the core: the driver feeds
//! transport events in and executes the returned actions.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PeerIdentity};
use crate::protocol::ConnectionState;
use crate::wire;

/// Service namespace for chat discovery and invitations.
pub const CHAT_SERVICE: &str = "jobmanager-chat";

/// Resource name the host uses when shipping its message log to a newcomer.
pub const HISTORY_RESOURCE: &str = "Chat_History";

/// One line of chat, tagged with the sender's display name at receive time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub display_name: String,
    pub body: String,
}

impl ChatMessage {
    pub fn new(display_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            body: body.into(),
        }
    }
}

/// Encode a message log as the history resource blob.
pub fn encode_history(messages: &[ChatMessage]) -> Result<Vec<u8>, HistoryCodecError> {
    Ok(bincode::serialize(messages)?)
}

/// Decode a received history resource blob.
pub fn decode_history(bytes: &[u8]) -> Result<Vec<ChatMessage>, HistoryCodecError> {
    Ok(bincode::deserialize(bytes)?)
}

#[derive(Debug, thiserror::Error)]
#[error("chat history codec error: {0}")]
pub struct HistoryCodecError(#[from] bincode::Error);

/// Side effect the driver must perform after a `ChatCore` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAction {
    StartAdvertising,
    StopAdvertising,
    StartBrowsing,
    StopBrowsing,
    DisconnectSession,
    /// Send one chat payload to every connected peer.
    Broadcast { payload: Vec<u8> },
    /// Ship the current message log to a peer that just connected.
    SendHistory { to: PeerId, blob: Vec<u8> },
}

/// Chat room state. Owned by exactly one driver task; every mutation goes
/// through a method here so the transition rules live in one place.
pub struct ChatCore {
    local: PeerIdentity,
    messages: Vec<ChatMessage>,
    peers: Vec<PeerIdentity>,
    connected_to_chat: bool,
    hosting: bool,
    /// Set after `leave`; transport events that straggle in afterwards are
    /// consumed without touching any state.
    idle: bool,
}

impl ChatCore {
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            messages: Vec::new(),
            peers: Vec::new(),
            connected_to_chat: false,
            hosting: false,
            idle: true,
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Connected peers, most recently connected first.
    pub fn peers(&self) -> &[PeerIdentity] {
        &self.peers
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    pub fn connected_to_chat(&self) -> bool {
        self.connected_to_chat
    }

    pub fn is_hosting(&self) -> bool {
        self.hosting
    }

    /// Open a room as host. The host is in the chat immediately, with an
    /// empty log and no peers yet.
    pub fn host(&mut self) -> Vec<ChatAction> {
        self.messages.clear();
        self.peers.clear();
        self.hosting = true;
        self.connected_to_chat = true;
        self.idle = false;
        vec![ChatAction::StartAdvertising]
    }

    /// Start looking for a room to join. Not in the chat until the picker
    /// reports success.
    pub fn join_started(&mut self) -> Vec<ChatAction> {
        self.messages.clear();
        self.peers.clear();
        self.hosting = false;
        self.idle = false;
        vec![ChatAction::StartBrowsing]
    }

    /// The picker resolved with a connection under way.
    pub fn picker_finished(&mut self) -> Vec<ChatAction> {
        self.connected_to_chat = true;
        vec![ChatAction::StopBrowsing]
    }

    /// The picker was dismissed without joining; abandon any half-open link.
    pub fn picker_cancelled(&mut self) -> Vec<ChatAction> {
        self.connected_to_chat = false;
        vec![ChatAction::StopBrowsing, ChatAction::DisconnectSession]
    }

    /// Leave the room. Terminal: the core goes idle and later transport
    /// events are no-ops until the next `host`/`join_started`.
    pub fn leave(&mut self) -> Vec<ChatAction> {
        self.hosting = false;
        self.connected_to_chat = false;
        self.peers.clear();
        self.messages.clear();
        self.idle = true;
        vec![
            ChatAction::StopAdvertising,
            ChatAction::StopBrowsing,
            ChatAction::DisconnectSession,
        ]
    }

    /// Send a line of chat. The local echo is appended unconditionally and
    /// is never rolled back; the broadcast happens only when someone is
    /// connected to hear it.
    pub fn send(&mut self, body: &str) -> Vec<ChatAction> {
        self.messages
            .push(ChatMessage::new(self.local.display_name.clone(), body));
        if self.peers.is_empty() {
            return Vec::new();
        }
        vec![ChatAction::Broadcast {
            payload: body.as_bytes().to_vec(),
        }]
    }

    /// Session peer-state transition.
    pub fn on_peer_state(&mut self, peer: &PeerIdentity, state: ConnectionState) -> Vec<ChatAction> {
        if self.idle {
            return Vec::new();
        }
        match state {
            ConnectionState::Connecting => Vec::new(),
            ConnectionState::Connected => {
                // A repeat Connected (link replacement) must not touch the
                // roster or ship the log twice.
                if self.peers.iter().any(|p| p.id == peer.id) {
                    return Vec::new();
                }
                self.peers.insert(0, peer.clone());
                if !self.hosting {
                    return Vec::new();
                }
                // Newcomers get the whole log so everyone reads the same room.
                match encode_history(&self.messages) {
                    Ok(blob) => vec![ChatAction::SendHistory { to: peer.id, blob }],
                    Err(_) => Vec::new(),
                }
            }
            ConnectionState::NotConnected => {
                self.peers.retain(|p| p.id != peer.id);
                if self.peers.is_empty() && !self.hosting {
                    self.connected_to_chat = false;
                }
                Vec::new()
            }
        }
    }

    /// Inbound chat payload. Returns whether a message was appended; payloads
    /// that are not valid UTF-8 are dropped.
    pub fn on_data(&mut self, peer: &PeerIdentity, payload: &[u8]) -> bool {
        if self.idle {
            return false;
        }
        match std::str::from_utf8(payload) {
            Ok(body) => {
                self.messages
                    .push(ChatMessage::new(peer.display_name.clone(), body));
                true
            }
            Err(_) => false,
        }
    }

    /// Inbound history resource. The decoded log is prepended ahead of
    /// anything already received, preserving its internal order. Returns
    /// whether the blob decoded.
    pub fn on_history_received(&mut self, bytes: &[u8]) -> bool {
        if self.idle {
            return false;
        }
        match decode_history(bytes) {
            Ok(history) => {
                self.messages.splice(0..0, history);
                true
            }
            Err(_) => false,
        }
    }
}

// Chat invitations are auto-accepted by the driver; there is no accept
// decision to model here, unlike `job::JobCore`.
