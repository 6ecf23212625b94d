//! Package framing (§3 Package, §4.1 Codec).
//!
//! Wire frame, big-endian:
//! ```text
//! offset 0 : u8  package_type
//! offset 1 : u8  data_type
//! offset 2 : i32 payload_length   (>= 0)
//! offset 6 : payload_length bytes of payload (absent if length = 0)
//! ```

use crate::error::CodecError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Header size in bytes: 1 (type) + 1 (data type) + 4 (length).
pub const HEADER_SIZE: usize = 6;

/// Default cap on a single payload, chosen to bound allocation against a
/// forged length prefix (§8 property 2).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Stable numeric encoding, in declaration order (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PackageType {
    None = 0,
    Error = 1,
    DisconnectRequest = 2,
    Disconnect = 3,
    Data = 4,
    AuthInfo = 5,
    AuthRequest = 6,
    AuthSalt = 7,
    AuthIv = 8,
    AuthChallenge = 9,
    AuthResponse = 10,
    AuthSuccess = 11,
    AuthFailure = 12,
    EncrRequest = 13,
    EncrIv = 14,
    EncrSalt = 15,
    TestRequest = 16,
    Test = 17,
    TestTrySuccess = 18,
    TestTryFailure = 19,
    Ping = 20,
    Pong = 21,
    Panic = 22,
}

impl PackageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PackageType::*;
        let t = match v {
            0 => None,
            1 => Error,
            2 => DisconnectRequest,
            3 => Disconnect,
            4 => Data,
            5 => AuthInfo,
            6 => AuthRequest,
            7 => AuthSalt,
            8 => AuthIv,
            9 => AuthChallenge,
            10 => AuthResponse,
            11 => AuthSuccess,
            12 => AuthFailure,
            13 => EncrRequest,
            14 => EncrIv,
            15 => EncrSalt,
            16 => TestRequest,
            17 => Test,
            18 => TestTrySuccess,
            19 => TestTryFailure,
            20 => Ping,
            21 => Pong,
            22 => Panic,
            _ => return None,
        };
        Some(t)
    }

    /// `is_internal = (package_type != Data)` (§3 invariant).
    pub fn is_internal(self) -> bool {
        !matches!(self, PackageType::Data)
    }
}

/// §6 data type tags. Historical `Bool/Short/Int/Long` revisions are not
/// carried forward (§9 design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Empty = 0,
    String = 1,
    Byte = 2,
    Blob = 3,
}

impl DataType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DataType::Empty),
            1 => Some(DataType::String),
            2 => Some(DataType::Byte),
            3 => Some(DataType::Blob),
            _ => None,
        }
    }
}

/// A framed message (§3 Package).
///
/// `completion`, if set, is fired exactly once by the dispatch loop after
/// the bytes have been written to the socket (§4.2, §9).
pub struct Package {
    pub package_type: PackageType,
    pub data_type: DataType,
    pub payload: Option<Vec<u8>>,
    pub completion: Option<oneshot::Sender<()>>,
}

impl Package {
    pub fn new(package_type: PackageType, data_type: DataType, payload: Option<Vec<u8>>) -> Self {
        Self {
            package_type,
            data_type,
            payload,
            completion: None,
        }
    }

    pub fn empty(package_type: PackageType) -> Self {
        Self::new(package_type, DataType::Empty, None)
    }

    pub fn blob(package_type: PackageType, payload: Vec<u8>) -> Self {
        Self::new(package_type, DataType::Blob, Some(payload))
    }

    pub fn with_completion(mut self, tx: oneshot::Sender<()>) -> Self {
        self.completion = Some(tx);
        self
    }

    /// Byte length of the frame this package would encode to.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let len = self.payload.as_ref().map(|p| p.len()).unwrap_or(0) as i32;
        buf.push(self.package_type as u8);
        buf.push(self.data_type as u8);
        buf.extend_from_slice(&len.to_be_bytes());
        if let Some(payload) = &self.payload {
            buf.extend_from_slice(payload);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf
    }
}

impl Clone for Package {
    /// Completion notifiers are single-fire and not clonable; a clone carries
    /// no completion of its own.
    fn clone(&self) -> Self {
        Self {
            package_type: self.package_type,
            data_type: self.data_type,
            payload: self.payload.clone(),
            completion: None,
        }
    }
}

/// Encodes a package and writes it to `writer` in one call (§4.2 dispatch).
pub async fn write_package<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    pkg: &Package,
) -> Result<(), CodecError> {
    let bytes = pkg.to_bytes();
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one package from `reader`.
///
/// The first header byte honors `cancel`; every subsequent read (data type,
/// length, payload) uses `timeout` as a fresh per-byte-class deadline (§5).
/// `Error` frames always surface as [`CodecError::ErrorPackage`], regardless
/// of `expected`.
pub async fn read_package<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    timeout: Duration,
    cancel: &CancellationToken,
    max_payload: usize,
) -> Result<Package, CodecError> {
    let mut type_byte = [0u8; 1];
    tokio::select! {
        res = reader.read_exact(&mut type_byte) => { res?; }
        _ = cancel.cancelled() => return Err(CodecError::Timeout),
    }

    let package_type = PackageType::from_u8(type_byte[0]).unwrap_or(PackageType::None);

    let mut rest_header = [0u8; HEADER_SIZE - 1];
    tokio::time::timeout(timeout, reader.read_exact(&mut rest_header))
        .await
        .map_err(|_| CodecError::Timeout)??;

    let data_type = DataType::from_u8(rest_header[0]).unwrap_or(DataType::Empty);
    let length = i32::from_be_bytes([
        rest_header[1],
        rest_header[2],
        rest_header[3],
        rest_header[4],
    ]);

    if length < 0 {
        return Err(CodecError::NegativeLength);
    }
    if length as usize > max_payload {
        return Err(CodecError::LengthCapExceeded(length, max_payload));
    }

    let payload = if length == 0 {
        None
    } else {
        let mut buf = vec![0u8; length as usize];
        tokio::time::timeout(timeout, reader.read_exact(&mut buf))
            .await
            .map_err(|_| CodecError::Timeout)??;
        Some(buf)
    };

    if package_type == PackageType::Error {
        return Err(CodecError::ErrorPackage);
    }

    Ok(Package::new(package_type, data_type, payload))
}

/// Reads a package and enforces that its type is `expected` (or `None` for
/// "any type accepted") (§4.1 `obtain_expected`).
pub async fn read_package_expect_one<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    timeout: Duration,
    cancel: &CancellationToken,
    max_payload: usize,
    expected: Option<PackageType>,
) -> Result<Package, CodecError> {
    let pkg = read_package(reader, timeout, cancel, max_payload).await?;
    if let Some(expected) = expected {
        if pkg.package_type != expected {
            return Err(CodecError::Unexpected {
                got: pkg.package_type,
                expected: vec![expected],
            });
        }
    }
    Ok(pkg)
}

/// Reads a package and enforces that its type is one of `expected` (or an
/// empty/`None` set for "any type accepted") (§4.1 `obtain_expected`).
pub async fn read_package_expect_any<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    timeout: Duration,
    cancel: &CancellationToken,
    max_payload: usize,
    expected: &[PackageType],
) -> Result<Package, CodecError> {
    let pkg = read_package(reader, timeout, cancel, max_payload).await?;
    if !expected.is_empty() && !expected.contains(&pkg.package_type) {
        return Err(CodecError::Unexpected {
            got: pkg.package_type,
            expected: expected.to_vec(),
        });
    }
    Ok(pkg)
}

impl std::fmt::Debug for PackageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PackageType::None => "None",
            PackageType::Error => "Error",
            PackageType::DisconnectRequest => "DisconnectRequest",
            PackageType::Disconnect => "Disconnect",
            PackageType::Data => "Data",
            PackageType::AuthInfo => "AuthInfo",
            PackageType::AuthRequest => "AuthRequest",
            PackageType::AuthSalt => "AuthSalt",
            PackageType::AuthIv => "AuthIv",
            PackageType::AuthChallenge => "AuthChallenge",
            PackageType::AuthResponse => "AuthResponse",
            PackageType::AuthSuccess => "AuthSuccess",
            PackageType::AuthFailure => "AuthFailure",
            PackageType::EncrRequest => "EncrRequest",
            PackageType::EncrIv => "EncrIv",
            PackageType::EncrSalt => "EncrSalt",
            PackageType::TestRequest => "TestRequest",
            PackageType::Test => "Test",
            PackageType::TestTrySuccess => "TestTrySuccess",
            PackageType::TestTryFailure => "TestTryFailure",
            PackageType::Ping => "Ping",
            PackageType::Pong => "Pong",
            PackageType::Panic => "Panic",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trip_blob() {
        let pkg = Package::blob(PackageType::Data, vec![1, 2, 3, 4]);
        let bytes = pkg.to_bytes();
        let mut cursor = Cursor::new(bytes);
        let decoded = read_package(
            &mut cursor,
            Duration::from_millis(100),
            &CancellationToken::new(),
            DEFAULT_MAX_PAYLOAD,
        )
        .await
        .unwrap();
        assert_eq!(decoded.package_type, PackageType::Data);
        assert_eq!(decoded.data_type, DataType::Blob);
        assert_eq!(decoded.payload.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn round_trip_empty() {
        let pkg = Package::empty(PackageType::Ping);
        let bytes = pkg.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let mut cursor = Cursor::new(bytes);
        let decoded = read_package(
            &mut cursor,
            Duration::from_millis(100),
            &CancellationToken::new(),
            DEFAULT_MAX_PAYLOAD,
        )
        .await
        .unwrap();
        assert_eq!(decoded.package_type, PackageType::Ping);
        assert!(decoded.payload.is_none());
    }

    #[tokio::test]
    async fn rejects_negative_length() {
        let mut buf = vec![PackageType::Data as u8, DataType::Blob as u8];
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_package(
            &mut cursor,
            Duration::from_millis(100),
            &CancellationToken::new(),
            DEFAULT_MAX_PAYLOAD,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CodecError::NegativeLength));
    }

    #[tokio::test]
    async fn rejects_length_over_cap() {
        let mut buf = vec![PackageType::Data as u8, DataType::Blob as u8];
        buf.extend_from_slice(&(1024i32).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_package(&mut cursor, Duration::from_millis(100), &CancellationToken::new(), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::LengthCapExceeded(1024, 100)));
    }

    #[tokio::test]
    async fn error_package_always_throws() {
        let pkg = Package::empty(PackageType::Error);
        let bytes = pkg.to_bytes();
        let mut cursor = Cursor::new(bytes);
        let err = read_package_expect_one(
            &mut cursor,
            Duration::from_millis(100),
            &CancellationToken::new(),
            DEFAULT_MAX_PAYLOAD,
            Some(PackageType::Ping),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CodecError::ErrorPackage));
    }

    #[tokio::test]
    async fn unexpected_package_rejected() {
        let pkg = Package::empty(PackageType::Pong);
        let bytes = pkg.to_bytes();
        let mut cursor = Cursor::new(bytes);
        let err = read_package_expect_one(
            &mut cursor,
            Duration::from_millis(100),
            &CancellationToken::new(),
            DEFAULT_MAX_PAYLOAD,
            Some(PackageType::Ping),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CodecError::Unexpected { .. }));
    }
}
