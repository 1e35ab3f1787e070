//! Update Sequence Numbers.
//!
//! A USN is a server-assigned, monotonically increasing integer labeling
//! the server-visible order of changes. A record carrying `Usn(-1)` is
//! "locally new" on the client and must be reassigned by the server on
//! arrival.

use serde::{Deserialize, Serialize};

/// A server-assigned update sequence number, or -1 for "not yet assigned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usn(pub i64);

impl Usn {
    /// Sentinel value a client uses for records it created locally.
    pub const NEW: Usn = Usn(-1);

    /// The USN that starts a brand-new, empty collection or media log.
    pub const ZERO: Usn = Usn(0);

    pub fn is_new(self) -> bool {
        self.0 < 0
    }

    pub fn next(self) -> Usn {
        Usn(self.0 + 1)
    }
}

impl From<i64> for Usn {
    fn from(v: i64) -> Self {
        Usn(v)
    }
}

impl From<Usn> for i64 {
    fn from(u: Usn) -> Self {
        u.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sentinel_is_negative() {
        assert!(Usn::NEW.is_new());
        assert!(!Usn::ZERO.is_new());
    }

    #[test]
    fn next_increments() {
        assert_eq!(Usn(5).next(), Usn(6));
    }
}
