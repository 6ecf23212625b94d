//! User-visible lifecycle hooks (§7, §9 "Hooks as observer callbacks").
//!
//! Hooks are registered once at construction and invoked by snapshot — a
//! handler added after a hook has begun firing never observes that firing,
//! matching the teacher's callback-registration style in `main.rs`.

use crate::id::ClientSessionKey;
use std::sync::Arc;

/// Server-side lifecycle hooks (§7).
pub trait ServerEvents: Send + Sync {
    fn on_client_connected(&self, _client: ClientSessionKey) {}
    fn on_client_disconnected(&self, _client: ClientSessionKey) {}
    fn on_client_panic(&self, _client: ClientSessionKey) {}
    fn on_blob_received(&self, _client: ClientSessionKey, _data: &[u8]) {}
    fn on_string_received(&self, _client: ClientSessionKey, _data: &str) {}
}

/// Client-side lifecycle hooks (§7).
pub trait ClientEvents: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_panic(&self) {}
    fn on_blob_received(&self, _data: &[u8]) {}
    fn on_string_received(&self, _data: &str) {}
}

/// A no-op implementation for endpoints constructed without hooks.
pub struct NoopServerEvents;
impl ServerEvents for NoopServerEvents {}

pub struct NoopClientEvents;
impl ClientEvents for NoopClientEvents {}

pub type SharedServerEvents = Arc<dyn ServerEvents>;
pub type SharedClientEvents = Arc<dyn ClientEvents>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingServerEvents {
        connected: AtomicUsize,
    }

    impl ServerEvents for CountingServerEvents {
        fn on_client_connected(&self, _client: ClientSessionKey) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn hooks_fire_on_invocation() {
        let events = CountingServerEvents {
            connected: AtomicUsize::new(0),
        };
        events.on_client_connected(ClientSessionKey::generate());
        assert_eq!(events.connected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_hooks_do_not_panic() {
        let events = NoopServerEvents;
        events.on_client_connected(ClientSessionKey::generate());
        events.on_client_disconnected(ClientSessionKey::generate());
        events.on_client_panic(ClientSessionKey::generate());
        events.on_blob_received(ClientSessionKey::generate(), &[1, 2, 3]);
        events.on_string_received(ClientSessionKey::generate(), "hi");
    }
}
