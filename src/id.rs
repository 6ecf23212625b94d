//! Client session identity (§3 ClientSessionKey, §6 Client ID).

use crate::crypto::random_array;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;

/// A server-generated client identity: 16 random bytes, unique within the
/// live connected set, compared **by value** (§4.5, §9 design note — a
/// historical by-reference comparison bug is not carried forward).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientSessionKey([u8; 16]);

impl ClientSessionKey {
    /// Draws a fresh random identity. Callers are responsible for
    /// collision-checking against the live registry (§4.5).
    pub fn generate() -> Self {
        Self(random_array())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// A base64 text form for diagnostics and log lines (§6).
    pub fn to_diagnostic_string(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for ClientSessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSessionKey({})", self.to_diagnostic_string())
    }
}

impl fmt::Display for ClientSessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_diagnostic_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = ClientSessionKey::generate();
        let b = ClientSessionKey::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn equality_is_by_value() {
        let a = ClientSessionKey::generate();
        let b = ClientSessionKey(*a.as_bytes());
        assert_eq!(a, b);
        assert!(std::ptr::eq(&a, &a));
    }

    #[test]
    fn diagnostic_string_round_trips_length() {
        let id = ClientSessionKey::generate();
        let text = id.to_diagnostic_string();
        assert!(!text.is_empty());
    }
}
