//! Identity verification, the persisted session registry, and the
//! per-user exclusivity lock the sync engines run under.

pub mod identity;
pub mod session;

pub use identity::{IdentityGateway, LocalIdentityGateway};
pub use session::{Session, SessionRegistry, UserLocks};
