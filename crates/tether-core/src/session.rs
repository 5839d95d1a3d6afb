//! Session identifiers and the session resolver seam.

use serde::{Deserialize, Serialize};

/// Identifier of the user/session a record belongs to.
///
/// Negative values mean "unspecified"; callers that pass one get the
/// current session resolved for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub i32);

impl SessionId {
    /// The "resolve it for me" sentinel.
    pub const UNSPECIFIED: Self = Self(-1);

    /// Returns whether this id names a concrete session.
    #[must_use]
    pub const fn is_specified(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Resolves the session the calling process belongs to.
///
/// The call container caches the answer after first use, so
/// implementations may be arbitrarily slow on the first lookup.
pub trait SessionResolver: Send + Sync {
    /// Returns the current session id.
    fn current_session_id(&self) -> SessionId;
}

/// Fixed-answer resolver for embedding and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedSessionResolver(pub SessionId);

impl SessionResolver for FixedSessionResolver {
    fn current_session_id(&self) -> SessionId {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specified() {
        assert!(SessionId(0).is_specified());
        assert!(SessionId(100).is_specified());
        assert!(!SessionId::UNSPECIFIED.is_specified());
    }
}
