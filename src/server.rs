//! Server Registry & Listener (§4.5).
//!
//! Accepts connections while `connected_count < max_clients` and the
//! listener hasn't been cancelled; blocked `accept()` calls honor
//! cancellation too. Each accepted socket is handed a fresh, collision-
//! checked [`ClientSessionKey`], run through the server side of the
//! handshake, and on success registered and handed two background tasks:
//! the package handler loops and (if enabled) the ping monitor.

use crate::codec::{DataType, Package, PackageType};
use crate::crypto::AesContext;
use crate::error::HandlerErrorKind;
use crate::events::SharedServerEvents;
use crate::handler::{PackageCallbacks, PackageHandler};
use crate::handshake;
use crate::id::ClientSessionKey;
use crate::liveness::{self, PongTracker};
use crate::registry::{ClientSession, Registry};
use crate::settings::ServerSettings;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

type ServerHandler = PackageHandler<OwnedReadHalf, OwnedWriteHalf, ServerConnectionCallbacks>;

/// The TCP listener plus registry, run as a single long-lived task
/// (§2 "Server Registry & Listener").
pub struct Server {
    settings: Arc<ServerSettings>,
    registry: Arc<Registry<OwnedReadHalf, OwnedWriteHalf, ServerConnectionCallbacks>>,
    events: SharedServerEvents,
}

impl Server {
    pub fn new(settings: ServerSettings, events: SharedServerEvents) -> Self {
        settings.validate().expect("invalid server settings");
        let registry = Arc::new(Registry::new(events.clone(), settings.max_clients()));
        Self {
            settings: Arc::new(settings),
            registry,
            events,
        }
    }

    pub fn registry(&self) -> Arc<Registry<OwnedReadHalf, OwnedWriteHalf, ServerConnectionCallbacks>> {
        self.registry.clone()
    }

    /// Runs the accept loop until `cancel` fires (§4.5).
    pub async fn serve(&self, listen_addr: &str, cancel: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(addr = listen_addr, "listening");
        self.serve_listener(listener, cancel).await
    }

    /// Runs the accept loop on an already-bound listener (§4.5). Split out
    /// from [`Self::serve`] so callers that need the OS-assigned port (bind
    /// to `:0`, then read `listener.local_addr()`) don't have to guess one.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if self.registry.is_full().await {
                // Still honor cancellation while waiting for room to open up.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                    _ = cancel.cancelled() => return Ok(()),
                }
            }

            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = cancel.cancelled() => return Ok(()),
            };

            match accepted {
                Ok((stream, addr)) => {
                    let settings = self.settings.clone();
                    let registry = self.registry.clone();
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, settings, registry, events).await;
                    }.instrument(info_span!("conn", peer = %addr)));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    settings: Arc<ServerSettings>,
    registry: Arc<Registry<OwnedReadHalf, OwnedWriteHalf, ServerConnectionCallbacks>>,
    events: SharedServerEvents,
) {
    let id = registry.generate_unique_id().await;
    let span = info_span!("conn", client = %id);
    let _enter = span.enter();

    let (read_half, write_half) = stream.into_split();
    // Created before the handshake (rather than only on success) so the same
    // token can be handed to the session on success and also kept by the
    // callbacks themselves, for respawning the ping monitor after a rejoin.
    let session_cancel = CancellationToken::new();
    let callbacks = Arc::new(ServerConnectionCallbacks::new(
        id,
        registry.clone(),
        events.clone(),
        settings.clone(),
        session_cancel.clone(),
    ));
    let handler = Arc::new(PackageHandler::new(
        read_half,
        write_half,
        callbacks.clone(),
        Duration::from_millis(settings.receive_timeout_ms()),
        crate::codec::DEFAULT_MAX_PAYLOAD,
    ));
    callbacks.bind_handler(Arc::downgrade(&handler));
    callbacks.bind_self(Arc::downgrade(&callbacks));

    match handshake::run_server_handshake(&handler, &settings).await {
        Ok(outcome) => {
            callbacks.set_data_channel(outcome.data_channel);
            let session = Arc::new(ClientSession {
                id,
                handler: handler.clone(),
                cancel: session_cancel,
            });
            registry.insert(session).await;
            handler.start_all().await;
            callbacks.spawn_ping_monitor(handler.clone());
        }
        Err(err) => {
            warn!(%err, "handshake failed, dropping connection");
            handler.stop_all().await;
        }
    }
}

/// Package callbacks for one server-side connection: routes data packages
/// to the `blob_received`/`string_received` hooks, and drives panic
/// recovery / terminal teardown from `on_error` (§4.3.6, §7).
pub struct ServerConnectionCallbacks {
    id: ClientSessionKey,
    registry: Arc<Registry<OwnedReadHalf, OwnedWriteHalf, ServerConnectionCallbacks>>,
    events: SharedServerEvents,
    settings: Arc<ServerSettings>,
    data_channel: StdMutex<Option<AesContext>>,
    pong_tracker: Arc<PongTracker>,
    panic_count: AtomicU32,
    handler: OnceLock<Weak<ServerHandler>>,
    self_weak: OnceLock<Weak<ServerConnectionCallbacks>>,
    session_cancel: CancellationToken,
}

impl ServerConnectionCallbacks {
    fn new(
        id: ClientSessionKey,
        registry: Arc<Registry<OwnedReadHalf, OwnedWriteHalf, ServerConnectionCallbacks>>,
        events: SharedServerEvents,
        settings: Arc<ServerSettings>,
        session_cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            registry,
            events,
            settings,
            data_channel: StdMutex::new(None),
            pong_tracker: Arc::new(PongTracker::new()),
            panic_count: AtomicU32::new(0),
            handler: OnceLock::new(),
            self_weak: OnceLock::new(),
            session_cancel,
        }
    }

    fn bind_handler(&self, handler: Weak<ServerHandler>) {
        let _ = self.handler.set(handler);
    }

    fn bind_self(&self, callbacks: Weak<ServerConnectionCallbacks>) {
        let _ = self.self_weak.set(callbacks);
    }

    /// Spawns a fresh ping-liveness monitor task for this session (§4.4).
    /// Called once after the initial join, and again after every successful
    /// Panic rejoin — `run_ping_monitor` returns for good the moment it
    /// raises one `PingTimeout`, so a session that survives that via rejoin
    /// needs a brand new task to keep being monitored for the rest of its
    /// life.
    fn spawn_ping_monitor(&self, handler: Arc<ServerHandler>) {
        if self.settings.ping_interval_ms() == 0 {
            return;
        }
        let Some(callbacks) = self.self_weak.get().and_then(Weak::upgrade) else {
            return;
        };
        tokio::spawn(liveness::run_ping_monitor(
            handler,
            self.pong_tracker(),
            self.settings.ping_interval_ms(),
            self.settings.ping_timeout_ms(),
            self.session_cancel.clone(),
            callbacks,
        ));
    }

    fn set_data_channel(&self, ctx: Option<AesContext>) {
        *self.data_channel.lock().unwrap() = ctx;
    }

    fn pong_tracker(&self) -> Arc<PongTracker> {
        self.pong_tracker.clone()
    }

    fn handler(&self) -> Option<Arc<ServerHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    /// Decrypts a `Data` package payload if a data channel is installed,
    /// otherwise treats it as plaintext (§4.3.4: all `Data` payloads are
    /// encrypted once the data channel exists).
    fn decrypt_if_needed(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let guard = self.data_channel.lock().unwrap();
        match guard.as_ref() {
            Some(ctx) => ctx.decrypt(payload).ok(),
            None => Some(payload.to_vec()),
        }
    }

    async fn terminate(&self) {
        self.registry.remove_client(self.id).await;
        if let Some(handler) = self.handler() {
            handler.stop_all().await;
        }
    }

    /// Runs the Panic recovery handshake (§4.3.6): pause already happened
    /// in `on_error`; this re-runs the join from Auth-Info and, on
    /// success, resumes the loops and fires the `panic` hook.
    async fn attempt_rejoin(&self) -> bool {
        let Some(handler) = self.handler() else {
            return false;
        };

        if let Err(err) = handler.dispatch(&Package::empty(PackageType::Panic)).await {
            warn!(%err, "failed to dispatch panic notice");
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        match handshake::run_server_handshake(&handler, &self.settings).await {
            Ok(outcome) => {
                self.set_data_channel(outcome.data_channel);
                handler.resume_all().await;
                self.spawn_ping_monitor(handler.clone());
                self.events.on_client_panic(self.id);
                info!(client = %self.id, "rejoined after panic");
                true
            }
            Err(err) => {
                warn!(%err, "rejoin failed");
                false
            }
        }
    }

    /// Responds to a `Panic` notice the *peer* initiated (its own `on_error`
    /// already paused its loops and dispatched `Panic` before starting its
    /// side of the rejoin): pause here too, then run this side's handshake
    /// role to meet it, without sending a second `Panic` of our own (§4.3.6
    /// "client does the symmetric re-join").
    async fn respond_to_panic(&self) {
        let Some(handler) = self.handler() else {
            return;
        };
        handler.pause_all().await;

        match handshake::run_server_handshake(&handler, &self.settings).await {
            Ok(outcome) => {
                self.set_data_channel(outcome.data_channel);
                handler.resume_all().await;
                self.spawn_ping_monitor(handler.clone());
                self.events.on_client_panic(self.id);
                info!(client = %self.id, "rejoined after peer-initiated panic");
            }
            Err(err) => {
                warn!(%err, "peer-initiated rejoin failed");
                let _ = handler.dispatch(&Package::empty(PackageType::Disconnect)).await;
                self.terminate().await;
            }
        }
    }
}

#[async_trait]
impl PackageCallbacks for ServerConnectionCallbacks {
    async fn on_internal(&self, pkg: Package) {
        match pkg.package_type {
            PackageType::Pong => {
                self.pong_tracker.mark_alive();
            }
            PackageType::Ping => {
                if let Some(handler) = self.handler() {
                    liveness::respond_to_ping(&handler).await;
                }
            }
            PackageType::DisconnectRequest => {
                self.terminate().await;
            }
            PackageType::Panic => {
                self.respond_to_panic().await;
            }
            other => {
                warn!(?other, "unexpected internal package");
            }
        }
    }

    fn on_data(&self, pkg: Package) {
        self.pong_tracker.mark_alive();
        let Some(payload) = pkg.payload else {
            return;
        };
        let Some(plain) = self.decrypt_if_needed(&payload) else {
            warn!("data package failed to decrypt");
            return;
        };
        match pkg.data_type {
            DataType::String => {
                if let Some(text) = crate::client::decode_utf16le(&plain) {
                    self.events.on_string_received(self.id, &text);
                }
            }
            _ => {
                self.events.on_blob_received(self.id, &plain);
            }
        }
    }

    async fn on_error(&self, kind: HandlerErrorKind) {
        if kind.is_terminal() {
            error!(?kind, "terminal connection error");
            self.terminate().await;
            return;
        }

        warn!(?kind, "recoverable connection error, attempting panic recovery");
        if let Some(handler) = self.handler() {
            handler.pause_all().await;
        }

        let attempt = self.panic_count.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.settings.max_panics_per_client() {
            warn!("panic budget exceeded, disconnecting");
            if let Some(handler) = self.handler() {
                let _ = handler.dispatch(&Package::empty(PackageType::Disconnect)).await;
            }
            self.terminate().await;
            return;
        }

        if !self.attempt_rejoin().await {
            if let Some(handler) = self.handler() {
                let _ = handler.dispatch(&Package::empty(PackageType::Disconnect)).await;
            }
            self.terminate().await;
        }
    }
}
