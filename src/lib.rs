//! TcpMs: a bidirectional, message-oriented TCP transport with mutual AES
//! challenge authentication, liveness probing, and panic-recovery
//! handshakes, for a single-server/many-client topology.

pub mod client;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod events;
pub mod handler;
pub mod handshake;
pub mod id;
pub mod liveness;
pub mod registry;
pub mod server;
pub mod settings;

pub use client::ClientEndpoint;
pub use codec::{DataType, Package, PackageType};
pub use error::{CodecError, CryptoError, HandlerErrorKind, HandshakeError, Result, TcpMsError};
pub use events::{ClientEvents, NoopClientEvents, NoopServerEvents, ServerEvents};
pub use id::ClientSessionKey;
pub use server::Server;
pub use settings::{ClientConfig, ExportedSettings, ServerSettings};
