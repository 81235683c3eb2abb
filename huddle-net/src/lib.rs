//! Tokio host for the huddle protocol: encrypted TCP sessions, UDP announce
//! discovery, and the chat/job coordinators that drive the `huddle-core`
//! state machines.

pub mod advertiser;
pub mod browser;
pub mod chat;
pub mod config;
pub mod job;
pub mod session;

pub use advertiser::{Advertiser, AdvertiserEvent, InviteResponder};
pub use browser::{Browser, BrowserEvent, InviteError};
pub use chat::{ChatCoordinator, ChatPicker};
pub use config::{ConfigError, NetConfig};
pub use job::{Invitation, JobCoordinator};
pub use session::{Session, SessionEvent, TransportError};
