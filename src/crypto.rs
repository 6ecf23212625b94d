//! Crypto facade (§3 AesContext, §4 "Crypto Facade").
//!
//! Treats cryptography as a black box: password-derived AES key with salt +
//! IV, encrypt/decrypt of byte blobs, SHA-512 digest, secure random bytes.
//! AES-256-CBC with PKCS7 padding; key derivation via PBKDF2-HMAC-SHA256.

use crate::error::CryptoError;
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::Hmac;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Minimum salt length accepted when constructing a context from wire bytes
/// (§3: "salt (random per context, 16 bytes minimum)").
pub const MIN_SALT_LEN: usize = 16;
/// IV length for AES-256-CBC.
pub const IV_LEN: usize = 16;
/// AES-256 key length.
const KEY_LEN: usize = 32;
/// PBKDF2 iteration count for password -> key derivation.
const PBKDF2_ROUNDS: u32 = 100_000;

/// A password-derived AES context (§3 AesContext).
///
/// Key material is zeroized on drop; the context is otherwise read-only for
/// its lifetime once installed (§5 "Shared resources").
#[derive(ZeroizeOnDrop)]
pub struct AesContext {
    #[zeroize(skip)]
    salt: Vec<u8>,
    #[zeroize(skip)]
    iv: [u8; IV_LEN],
    key: [u8; KEY_LEN],
}

impl AesContext {
    /// Derives a fresh context for `password`, generating a new random salt
    /// and IV (the sending side of a challenge or the data channel setup).
    pub fn generate(password: &str) -> Result<Self, CryptoError> {
        let mut salt = vec![0u8; MIN_SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut iv);
        Self::from_parts(password, salt, iv)
    }

    /// Reconstructs the context from a password plus a salt/IV received from
    /// the peer (the receiving side of a challenge).
    pub fn from_parts(password: &str, salt: Vec<u8>, iv: [u8; IV_LEN]) -> Result<Self, CryptoError> {
        if salt.len() < MIN_SALT_LEN {
            return Err(CryptoError::SaltTooShort);
        }
        let key = derive_key(password, &salt)?;
        Ok(Self { salt, iv, key })
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Encrypts `plaintext`, returning ciphertext padded to the next AES
    /// block boundary (PKCS7).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let enc = Aes256CbcEnc::new(&self.key.into(), &self.iv.into());
        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    /// Decrypts `ciphertext`. Failure (bad padding, wrong length) is
    /// reported as [`CryptoError::Decrypt`] — callers in the handshake treat
    /// this as an `Auth_Failure`, not a protocol error (§4.3.3).
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let dec = Aes256CbcDec::new(&self.key.into(), &self.iv.into());
        dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

/// Constant-time byte comparison for challenge-response digests.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

/// SHA-512 digest (§4.3.2 challenge verification).
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let digest = Sha512::digest(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

/// Secure random bytes (§3, §4.3.2 challenges, §5 client IDs).
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// A fixed-size secure-random buffer, for call sites that want an array.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// A password that is never `Debug`-printed or logged.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecurePassword(String);

impl SecurePassword {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecurePassword(***)")
    }
}
