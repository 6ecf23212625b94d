//! Error taxonomy for the transport.
//!
//! Leaf errors are grouped by the layer that raises them (codec, crypto,
//! handshake, handler) and composed into [`TcpMsError`] for callers that
//! don't care which layer failed.

use thiserror::Error;

/// Errors raised while encoding or decoding a package frame (§4.1).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("timed out waiting for package bytes")]
    Timeout,
    #[error("stream broken: {0}")]
    StreamBroken(#[from] std::io::Error),
    #[error("error package received")]
    ErrorPackage,
    #[error("unexpected package: got {got:?}, expected one of {expected:?}")]
    Unexpected {
        got: crate::codec::PackageType,
        expected: Vec<crate::codec::PackageType>,
    },
    #[error("negative payload length")]
    NegativeLength,
    #[error("payload length {0} exceeds cap {1}")]
    LengthCapExceeded(i32, usize),
}

/// Errors raised by the crypto facade (§4 Crypto Facade).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (bad padding or corrupt ciphertext)")]
    Decrypt,
    #[error("salt must be at least 16 bytes")]
    SaltTooShort,
    #[error("iv must be exactly 16 bytes")]
    IvWrongLength,
}

/// Errors raised by the handshake state machine (§4.3).
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("codec error during handshake: {0}")]
    Codec(#[from] CodecError),
    #[error("crypto error during handshake: {0}")]
    Crypto(#[from] CryptoError),
    #[error("peer authentication failed")]
    AuthFailed,
    #[error("encryption required but no password configured")]
    PasswordRequired,
    #[error("validation round failed")]
    ValidationFailed,
    #[error("peer sent a disconnect during join")]
    PeerDisconnected,
    #[error("i/o error during handshake: {0}")]
    Io(#[from] std::io::Error),
    #[error("handler error during handshake: {0}")]
    Handler(HandlerErrorKind),
}

impl From<HandlerErrorKind> for HandshakeError {
    fn from(kind: HandlerErrorKind) -> Self {
        HandshakeError::Handler(kind)
    }
}

/// Errors surfaced by the Package Handler's `on_error` hook (§7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    #[error("read timeout")]
    ReadTimeout,
    #[error("cannot read from socket")]
    CannotRead,
    #[error("cannot write to socket")]
    CannotWrite,
    #[error("peer disconnected")]
    Disconnected,
    #[error("peer sent an error package")]
    ErrorPackage,
    #[error("unexpected package type")]
    UnexpectedPackage,
    #[error("ping timeout")]
    PingTimeout,
    #[error("incorrect package during validation")]
    IncorrectPackage,
}

impl HandlerErrorKind {
    /// `cannot_read`, `cannot_write`, `disconnected` are terminal (§7 policy);
    /// everything else routes through the Panic recovery handshake.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandlerErrorKind::CannotRead
                | HandlerErrorKind::CannotWrite
                | HandlerErrorKind::Disconnected
        )
    }
}

/// Top-level error type for callers that don't need to match on layer.
#[derive(Debug, Error)]
pub enum TcpMsError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("handler error: {0}")]
    Handler(HandlerErrorKind),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("max clients reached")]
    MaxClientsReached,
}

pub type Result<T, E = TcpMsError> = std::result::Result<T, E>;
