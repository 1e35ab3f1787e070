//! Shared types for the cardsync workspace: errors, configuration,
//! update sequence numbers, time helpers, and identifiers.

pub mod config;
pub mod error;
pub mod ids;
pub mod time;
pub mod usn;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use ids::{HostId, SessionKey, UserKey};
pub use usn::Usn;
