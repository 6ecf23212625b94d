//! Server/client configuration (§0 Configuration, §3 ServerSettings, §6 wire format).

use crate::crypto::SecurePassword;

/// Server-side configuration.
///
/// Constructed with [`ServerSettings::new`] and refined with builder-style
/// `with_*` setters, in the manner of the teacher's `ConnectionManager`
/// limit setters.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    version: u32,
    connection_test_tries: u8,
    encryption_enabled: bool,
    password: Option<SecurePassword>,
    max_clients: usize,
    max_panics_per_client: u32,
    ping_interval_ms: u64,
    ping_timeout_ms: u64,
    receive_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            version: 1,
            connection_test_tries: 3,
            encryption_enabled: true,
            password: None,
            max_clients: 15,
            max_panics_per_client: 5,
            ping_interval_ms: 10_000,
            ping_timeout_ms: 8_000,
            receive_timeout_ms: 500,
        }
    }
}

impl ServerSettings {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    pub fn with_connection_test_tries(mut self, tries: u8) -> Self {
        self.connection_test_tries = tries;
        self
    }

    /// Encryption is implicitly disabled if no password is ever set;
    /// `with_password` re-enables it.
    pub fn with_encryption_enabled(mut self, enabled: bool) -> Self {
        self.encryption_enabled = enabled;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecurePassword::new(password.into()));
        self.encryption_enabled = true;
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_max_panics_per_client(mut self, max_panics: u32) -> Self {
        self.max_panics_per_client = max_panics;
        self
    }

    /// `0` disables the liveness monitor entirely (§4.4).
    pub fn with_ping_interval_ms(mut self, interval_ms: u64) -> Self {
        self.ping_interval_ms = interval_ms;
        self
    }

    pub fn with_ping_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.ping_timeout_ms = timeout_ms;
        self
    }

    pub fn with_receive_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.receive_timeout_ms = timeout_ms;
        self
    }

    /// `ping_timeout_ms < ping_interval_ms` whenever pinging is active
    /// (§4.4 invariant). Checked once at startup rather than on every
    /// setter call so intermediate builder states can be invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.ping_interval_ms > 0 && self.ping_timeout_ms >= self.ping_interval_ms {
            return Err(format!(
                "ping_timeout_ms ({}) must be < ping_interval_ms ({})",
                self.ping_timeout_ms, self.ping_interval_ms
            ));
        }
        if self.encryption_enabled && self.password.is_none() {
            return Err("encryption_enabled requires a password".to_string());
        }
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn connection_test_tries(&self) -> u8 {
        self.connection_test_tries
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption_enabled
    }

    pub fn password(&self) -> Option<&SecurePassword> {
        self.password.as_ref()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn max_panics_per_client(&self) -> u32 {
        self.max_panics_per_client
    }

    pub fn ping_interval_ms(&self) -> u64 {
        self.ping_interval_ms
    }

    pub fn ping_timeout_ms(&self) -> u64 {
        self.ping_timeout_ms
    }

    pub fn receive_timeout_ms(&self) -> u64 {
        self.receive_timeout_ms
    }

    /// The subset of settings transmitted to the client during Auth-Info
    /// (§3 "Exported fields").
    pub fn exported(&self) -> ExportedSettings {
        ExportedSettings {
            version: self.version,
            connection_test_tries: self.connection_test_tries,
            encryption_enabled: self.encryption_enabled,
        }
    }
}

/// The client-visible subset of [`ServerSettings`] (§3, §6 wire format:
/// `i32 version`, `u8 connection_test_tries`, `u8 encryption_enabled`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportedSettings {
    pub version: u32,
    pub connection_test_tries: u8,
    pub encryption_enabled: bool,
}

impl ExportedSettings {
    pub const WIRE_LEN: usize = 6;

    pub fn to_bytes(self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..4].copy_from_slice(&(self.version as i32).to_be_bytes());
        buf[4] = self.connection_test_tries;
        buf[5] = self.encryption_enabled as u8;
        buf
    }

    pub fn from_bytes(buf: [u8; Self::WIRE_LEN]) -> Self {
        let version = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u32;
        Self {
            version,
            connection_test_tries: buf[4],
            encryption_enabled: buf[5] != 0,
        }
    }

    /// The Auth-Info payload (§4.3.1): the same 6 bytes as [`Self::to_bytes`],
    /// except the final byte carries the tri-state sentinel `0xFF` ("no
    /// encryption, skip auth, proceed straight to Validation") rather than a
    /// plain boolean. Any other value means "encryption enabled".
    pub fn to_auth_info_bytes(self) -> [u8; Self::WIRE_LEN] {
        let mut buf = self.to_bytes();
        buf[5] = if self.encryption_enabled { 0x01 } else { 0xFF };
        buf
    }

    pub fn from_auth_info_bytes(buf: [u8; Self::WIRE_LEN]) -> (Self, bool) {
        let version = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u32;
        let encryption_enabled = buf[5] != 0xFF;
        (
            Self {
                version,
                connection_test_tries: buf[4],
                encryption_enabled,
            },
            encryption_enabled,
        )
    }
}

/// Client-side configuration, mirroring the client-exported subset of
/// [`ServerSettings`] plus the connection target.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub password: Option<SecurePassword>,
    pub receive_timeout_ms: u64,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            password: None,
            receive_timeout_ms: 500,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecurePassword::new(password.into()));
        self
    }

    pub fn with_receive_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.receive_timeout_ms = timeout_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = ServerSettings::new(1).with_password("hunter2");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn encryption_enabled_without_password_is_invalid() {
        let settings = ServerSettings::new(1);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn ping_timeout_must_be_less_than_interval() {
        let settings = ServerSettings::new(1)
            .with_password("x")
            .with_ping_interval_ms(1000)
            .with_ping_timeout_ms(1000);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_ping_interval_disables_invariant() {
        let settings = ServerSettings::new(1)
            .with_password("x")
            .with_ping_interval_ms(0)
            .with_ping_timeout_ms(99_999);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn exported_settings_round_trip_wire_format() {
        let exported = ExportedSettings {
            version: 7,
            connection_test_tries: 3,
            encryption_enabled: true,
        };
        let bytes = exported.to_bytes();
        assert_eq!(bytes.len(), ExportedSettings::WIRE_LEN);
        assert_eq!(ExportedSettings::from_bytes(bytes), exported);
    }
}
