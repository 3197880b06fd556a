pub mod bots;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod peers;
pub mod presence;
pub mod recorder;
pub mod roster;
pub mod session;
pub mod signaling;
pub mod webrtc;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::peers::PeerConnectionManager;
pub use crate::session::{Identity, MeetingSession, SessionHandle};
