//! Frame definitions for discovery, invitations, and in-session traffic.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PublicKey};

/// Bumped on any wire-incompatible change. Peers on a different version are
/// ignored during discovery and declined at invite time.
pub const PROTOCOL_VERSION: u8 = 1;

/// Connection lifecycle of a remote peer within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::NotConnected => "not connected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Requested delivery guarantee for `Session::send`. Links run over TCP, so
/// both modes deliver in order; the distinction is kept for API parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

/// Cleartext frames: UDP announces plus the TCP invitation handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlFrame {
    /// Periodic presence beacon from an advertiser.
    Announce {
        protocol_version: u8,
        service: String,
        id: PeerId,
        public_key: PublicKey,
        display_name: String,
        /// TCP port the advertiser accepts invitations on.
        invite_port: u16,
        /// Free-form key/value pairs shown to browsers alongside the peer.
        discovery_info: Vec<(String, String)>,
    },
    /// Sent once when an advertiser stops, so browsers drop the peer
    /// without waiting for the announce timeout.
    Bye { service: String, id: PeerId },
    /// First frame on an invitation connection, browser to advertiser.
    Invite {
        protocol_version: u8,
        service: String,
        id: PeerId,
        public_key: PublicKey,
        display_name: String,
        /// Application payload shown to the invitee before it decides.
        context: Option<Vec<u8>>,
    },
    /// Advertiser accepted; the link switches to encrypted session frames.
    InviteAccept {
        id: PeerId,
        public_key: PublicKey,
        display_name: String,
    },
    /// Advertiser declined; the connection closes after this frame.
    InviteDecline,
}

/// Encrypted frames exchanged inside an established session link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionFrame {
    /// One application message, delivered as a single unit.
    Data { payload: Vec<u8> },
    /// Opens a named resource transfer.
    ResourceHeader {
        transfer_id: [u8; 16],
        name: String,
        len: u64,
    },
    ResourceChunk {
        transfer_id: [u8; 16],
        offset: u64,
        payload: Vec<u8>,
    },
    /// Closes a transfer; `digest` is SHA-256 over the whole resource.
    ResourceEnd {
        transfer_id: [u8; 16],
        digest: [u8; 32],
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::wire::{decode_payload, encode_payload};

    #[test]
    fn announce_survives_codec() {
        let kp = Keypair::generate();
        let frame = ControlFrame::Announce {
            protocol_version: PROTOCOL_VERSION,
            service: "jobmanager-chat".into(),
            id: kp.peer_id(),
            public_key: kp.public_key().clone(),
            display_name: "Dispatch".into(),
            invite_port: 41_200,
            discovery_info: vec![("role".into(), "host".into())],
        };
        let bytes = encode_payload(&frame).unwrap();
        match decode_payload::<ControlFrame>(&bytes).unwrap() {
            ControlFrame::Announce {
                service,
                invite_port,
                discovery_info,
                ..
            } => {
                assert_eq!(service, "jobmanager-chat");
                assert_eq!(invite_port, 41_200);
                assert_eq!(discovery_info.len(), 1);
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn invite_context_roundtrips_none_and_some() {
        let kp = Keypair::generate();
        for context in [None, Some(b"Fix the sink".to_vec())] {
            let frame = ControlFrame::Invite {
                protocol_version: PROTOCOL_VERSION,
                service: "jobmanager-jobs".into(),
                id: kp.peer_id(),
                public_key: kp.public_key().clone(),
                display_name: "Manager".into(),
                context: context.clone(),
            };
            let bytes = encode_payload(&frame).unwrap();
            match decode_payload::<ControlFrame>(&bytes).unwrap() {
                ControlFrame::Invite { context: got, .. } => assert_eq!(got, context),
                other => panic!("decoded wrong variant: {other:?}"),
            }
        }
    }
}
