//! Server client registry (§4.5).
//!
//! A concurrent map from [`ClientSessionKey`] to live session handles.
//! Insertion happens only after a successful handshake; `remove_client` is
//! the single mutation path for removal and is the only place that fires
//! `on_client_disconnected` (§4.5 invariant: "emits `on_client_disconnected`
//! exactly once").

use crate::events::SharedServerEvents;
use crate::handler::PackageCallbacks;
use crate::id::ClientSessionKey;
use crate::codec::{DataType, Package};
use crate::handler::PackageHandler;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One entry of a registry snapshot, for diagnostics only (§6 "diagnostic
/// text form"). Crosses no wire format of its own — it's serialized only
/// when an embedder wants to expose connected-client stats (an admin
/// endpoint, a metrics dump), never used by the transport itself.
#[derive(Debug, Clone, Serialize)]
pub struct ClientDiagnostics {
    pub id: String,
}

/// A single registered, joined client connection.
pub struct ClientSession<R, W, Cb> {
    pub id: ClientSessionKey,
    pub handler: Arc<PackageHandler<R, W, Cb>>,
    /// Cancelled when this session's liveness monitor and any other
    /// per-session background tasks should stop, independent of the
    /// handler's own cancellation token.
    pub cancel: CancellationToken,
}

/// The live, concurrent set of joined clients (§4.5).
pub struct Registry<R, W, Cb> {
    clients: RwLock<HashMap<ClientSessionKey, Arc<ClientSession<R, W, Cb>>>>,
    events: SharedServerEvents,
    max_clients: usize,
}

impl<R, W, Cb> Registry<R, W, Cb>
where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    pub fn new(events: SharedServerEvents, max_clients: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            events,
            max_clients,
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_full(&self) -> bool {
        self.len().await >= self.max_clients
    }

    pub async fn contains(&self, id: ClientSessionKey) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    /// Draws a fresh ID guaranteed unique against the live set at the
    /// moment of the check (§4.5: "16-byte unique ID, collision-checked
    /// against the live set, compared by value").
    pub async fn generate_unique_id(&self) -> ClientSessionKey {
        loop {
            let candidate = ClientSessionKey::generate();
            if !self.contains(candidate).await {
                return candidate;
            }
        }
    }

    /// Registers a freshly-joined client and fires `on_client_connected`.
    pub async fn insert(&self, session: Arc<ClientSession<R, W, Cb>>) {
        let id = session.id;
        self.clients.write().await.insert(id, session);
        self.events.on_client_connected(id);
        info!(client = %id, "client joined");
    }

    /// The sole disconnect mutation path (§4.5). Idempotent: removing an
    /// already-absent ID is a no-op and does not re-fire the hook.
    pub async fn remove_client(&self, id: ClientSessionKey) {
        let removed = self.clients.write().await.remove(&id);
        if let Some(session) = removed {
            // Stop this session's own background tasks (the liveness
            // monitor) immediately rather than waiting for them to notice
            // the handler is gone on their next cycle.
            session.cancel.cancel();
            self.events.on_client_disconnected(id);
            info!(client = %id, "client disconnected");
        }
    }

    pub async fn get(&self, id: ClientSessionKey) -> Option<Arc<ClientSession<R, W, Cb>>> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Fans `pkg` out to every currently-registered client, tolerating
    /// per-client send failures rather than aborting the whole broadcast
    /// (§4.5 "Broadcast fans out over a registry snapshot").
    pub async fn broadcast(&self, pkg: Package) {
        let snapshot: Vec<_> = self.clients.read().await.values().cloned().collect();
        for session in snapshot {
            if let Err(err) = session.handler.send(pkg.clone()) {
                warn!(client = %session.id, %err, "broadcast send failed");
            }
        }
    }

    /// A point-in-time, serializable view of the connected set, for
    /// diagnostics (§6). Not part of the wire protocol.
    pub async fn diagnostics_snapshot(&self) -> Vec<ClientDiagnostics> {
        self.clients
            .read()
            .await
            .keys()
            .map(|id| ClientDiagnostics {
                id: id.to_diagnostic_string(),
            })
            .collect()
    }

    pub async fn broadcast_blob(&self, payload: Vec<u8>) {
        self.broadcast(Package::new(
            crate::codec::PackageType::Data,
            DataType::Blob,
            Some(payload),
        ))
        .await;
    }
}
