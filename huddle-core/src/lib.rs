//! Huddle session protocol core.
//! Host-driven: no I/O here; the host feeds transport events in and executes
//! the returned actions. `huddle-net` is the reference host.

pub mod chat;
pub mod identity;
pub mod job;
pub mod protocol;
pub mod wire;

pub use chat::{ChatAction, ChatCore, ChatMessage, CHAT_SERVICE, HISTORY_RESOURCE};
pub use identity::{
    derive_link_keys, Keypair, LinkKeys, LinkRole, PeerId, PeerIdentity, PublicKey, WireCipher,
    WireCryptoError,
};
pub use job::{
    Job, JobAction, JobCodecError, JobCore, JobStreamError, JOB_INVITE_TIMEOUT, JOB_SERVICE,
};
pub use protocol::{ConnectionState, ControlFrame, Reliability, SessionFrame, PROTOCOL_VERSION};
pub use wire::{
    decode_frame, decode_payload, encode_frame, encode_payload, FrameDecodeError, FrameEncodeError,
};
