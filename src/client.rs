//! Client Endpoint (§4.6).
//!
//! `connect` dials the server, runs the joining side of the handshake, and
//! starts the package handler loops on success. `disconnect` stops the
//! loops, direct-dispatches `DisconnectRequest`, then closes. Data sends
//! map to `Byte`/`String`/`Blob` `Data` packages; strings are UTF-16
//! little-endian code units, no BOM (§6).

use crate::codec::{DataType, Package, PackageType};
use crate::crypto::AesContext;
use crate::error::{HandlerErrorKind, HandshakeError};
use crate::events::SharedClientEvents;
use crate::handler::{PackageCallbacks, PackageHandler};
use crate::handshake;
use crate::liveness;
use crate::settings::ClientConfig;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default cap a lone client applies to rejoin attempts, mirroring the
/// server's `max_panics_per_client` but with no settings channel to learn
/// the server's actual configured value from.
const DEFAULT_MAX_PANICS: u32 = 5;

type ClientHandler = PackageHandler<OwnedReadHalf, OwnedWriteHalf, ClientConnectionCallbacks>;

/// One connected session to a TcpMs server (§4.6).
pub struct ClientEndpoint {
    handler: Arc<ClientHandler>,
    callbacks: Arc<ClientConnectionCallbacks>,
    cancel: CancellationToken,
}

impl ClientEndpoint {
    /// Dials `config.server_addr`, runs the joining handshake, and (on
    /// success) starts the obtain/dispatch loops (§4.6 `connect`).
    pub async fn connect(
        config: ClientConfig,
        events: SharedClientEvents,
    ) -> Result<Arc<Self>, HandshakeError> {
        let stream = TcpStream::connect(&config.server_addr).await?;
        let (read_half, write_half) = stream.into_split();

        let password = config.password.as_ref().map(|p| p.as_str().to_string());
        let callbacks = Arc::new(ClientConnectionCallbacks::new(events.clone(), password.clone()));
        let handler = Arc::new(PackageHandler::new(
            read_half,
            write_half,
            callbacks.clone(),
            Duration::from_millis(config.receive_timeout_ms),
            crate::codec::DEFAULT_MAX_PAYLOAD,
        ));
        callbacks.bind_handler(Arc::downgrade(&handler));

        let outcome = handshake::run_client_handshake(&handler, password.as_deref()).await?;
        callbacks.set_data_channel(outcome.data_channel);

        handler.start_all().await;
        events.on_connected();
        info!("connected and joined");

        Ok(Arc::new(Self {
            handler,
            callbacks,
            cancel: CancellationToken::new(),
        }))
    }

    /// Stops the loops, tells the server we're leaving, then closes
    /// (§4.6 `disconnect`). Uses `stop_and_dispatch_rest` rather than
    /// `stop_all` so that anything already queued via `send`/`send_await`
    /// before the caller decided to disconnect still goes out instead of
    /// being silently dropped with the channel.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        self.handler.stop_and_dispatch_rest().await;
        let _ = self
            .handler
            .dispatch(&Package::empty(PackageType::DisconnectRequest))
            .await;
    }

    pub async fn send_byte(&self, value: u8) -> Result<(), HandlerErrorKind> {
        self.send_payload(DataType::Byte, vec![value])
    }

    pub async fn send_byte_await(&self, value: u8) -> Result<(), HandlerErrorKind> {
        self.send_payload_await(DataType::Byte, vec![value]).await
    }

    pub fn send_blob(&self, data: Vec<u8>) -> Result<(), HandlerErrorKind> {
        self.send_payload(DataType::Blob, data)
    }

    pub async fn send_blob_await(&self, data: Vec<u8>) -> Result<(), HandlerErrorKind> {
        self.send_payload_await(DataType::Blob, data).await
    }

    /// Encodes `text` as UTF-16 little-endian code units, no BOM (§6).
    pub fn send_string(&self, text: &str) -> Result<(), HandlerErrorKind> {
        self.send_payload(DataType::String, encode_utf16le(text))
    }

    pub async fn send_string_await(&self, text: &str) -> Result<(), HandlerErrorKind> {
        self.send_payload_await(DataType::String, encode_utf16le(text)).await
    }

    fn send_payload(&self, data_type: DataType, plain: Vec<u8>) -> Result<(), HandlerErrorKind> {
        let payload = self.callbacks.encrypt_if_needed(&plain);
        self.handler.send(Package::new(PackageType::Data, data_type, Some(payload)))
    }

    async fn send_payload_await(&self, data_type: DataType, plain: Vec<u8>) -> Result<(), HandlerErrorKind> {
        let payload = self.callbacks.encrypt_if_needed(&plain);
        self.handler
            .send_await(Package::new(PackageType::Data, data_type, Some(payload)))
            .await
    }
}

pub(crate) fn encode_utf16le(text: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf
}

pub(crate) fn decode_utf16le(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Package callbacks for the client's single session (§4.3.6 Panic
/// recovery, symmetric with [`crate::server::ServerConnectionCallbacks`]).
pub struct ClientConnectionCallbacks {
    events: SharedClientEvents,
    password: Option<String>,
    data_channel: StdMutex<Option<AesContext>>,
    panic_count: AtomicU32,
    handler: OnceLock<Weak<ClientHandler>>,
}

impl ClientConnectionCallbacks {
    fn new(events: SharedClientEvents, password: Option<String>) -> Self {
        Self {
            events,
            password,
            data_channel: StdMutex::new(None),
            panic_count: AtomicU32::new(0),
            handler: OnceLock::new(),
        }
    }

    fn bind_handler(&self, handler: Weak<ClientHandler>) {
        let _ = self.handler.set(handler);
    }

    fn set_data_channel(&self, ctx: Option<AesContext>) {
        *self.data_channel.lock().unwrap() = ctx;
    }

    fn handler(&self) -> Option<Arc<ClientHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    fn encrypt_if_needed(&self, plain: &[u8]) -> Vec<u8> {
        match self.data_channel.lock().unwrap().as_ref() {
            Some(ctx) => ctx.encrypt(plain).unwrap_or_else(|_| plain.to_vec()),
            None => plain.to_vec(),
        }
    }

    fn decrypt_if_needed(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match self.data_channel.lock().unwrap().as_ref() {
            Some(ctx) => ctx.decrypt(payload).ok(),
            None => Some(payload.to_vec()),
        }
    }

    async fn attempt_rejoin(&self) -> bool {
        let Some(handler) = self.handler() else {
            return false;
        };

        if let Err(err) = handler.dispatch(&Package::empty(PackageType::Panic)).await {
            warn!(%err, "failed to dispatch panic notice");
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        match handshake::run_client_handshake(&handler, self.password.as_deref()).await {
            Ok(outcome) => {
                self.set_data_channel(outcome.data_channel);
                handler.resume_all().await;
                self.events.on_panic();
                info!("rejoined after panic");
                true
            }
            Err(err) => {
                warn!(%err, "rejoin failed");
                false
            }
        }
    }

    /// Responds to a `Panic` notice the *server* initiated: pause here too
    /// and meet it with our side of the rejoin, without re-dispatching a
    /// `Panic` of our own (§4.3.6 "client does the symmetric re-join").
    async fn respond_to_panic(&self) {
        let Some(handler) = self.handler() else {
            return;
        };
        handler.pause_all().await;

        match handshake::run_client_handshake(&handler, self.password.as_deref()).await {
            Ok(outcome) => {
                self.set_data_channel(outcome.data_channel);
                handler.resume_all().await;
                self.events.on_panic();
                info!("rejoined after peer-initiated panic");
            }
            Err(err) => {
                warn!(%err, "peer-initiated rejoin failed");
                handler.stop_all().await;
                self.events.on_disconnected();
            }
        }
    }
}

#[async_trait]
impl PackageCallbacks for ClientConnectionCallbacks {
    async fn on_internal(&self, pkg: Package) {
        match pkg.package_type {
            PackageType::Ping => {
                if let Some(handler) = self.handler() {
                    liveness::respond_to_ping(&handler).await;
                }
            }
            PackageType::Disconnect => {
                self.events.on_disconnected();
                if let Some(handler) = self.handler() {
                    handler.stop_all().await;
                }
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
        let Some(payload) = pkg.payload else {
            return;
        };
        let Some(plain) = self.decrypt_if_needed(&payload) else {
            warn!("data package failed to decrypt");
            return;
        };
        match pkg.data_type {
            DataType::String => {
                if let Some(text) = decode_utf16le(&plain) {
                    self.events.on_string_received(&text);
                }
            }
            _ => {
                self.events.on_blob_received(&plain);
            }
        }
    }

    async fn on_error(&self, kind: HandlerErrorKind) {
        if kind.is_terminal() {
            self.events.on_disconnected();
            if let Some(handler) = self.handler() {
                handler.stop_all().await;
            }
            return;
        }

        warn!(?kind, "recoverable connection error, attempting panic recovery");
        if let Some(handler) = self.handler() {
            handler.pause_all().await;
        }

        let attempt = self.panic_count.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > DEFAULT_MAX_PANICS || !self.attempt_rejoin().await {
            self.events.on_disconnected();
            if let Some(handler) = self.handler() {
                handler.stop_all().await;
            }
        }
    }
}
