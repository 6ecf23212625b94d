//! Handshake state machine (§4.3).
//!
//! `AuthInfo -> ClientChallenge -> ServerChallenge -> EncryptionExchange ->
//! Validation -> Joined`. Both [`run_server_handshake`] and
//! [`run_client_handshake`] run the full sequence directly against a
//! [`PackageHandler`]'s `obtain`/`dispatch` (the loops are not started
//! yet — or are paused, during Panic recovery). The two challenge phases
//! are symmetric (§4.3.3: "roles swap, client proves knowledge") and share
//! [`challenge_peer`]/[`prove_to_peer`] regardless of which side is
//! currently which role.

use crate::codec::{DataType, Package, PackageType};
use crate::crypto::{self, AesContext};
use crate::error::HandshakeError;
use crate::handler::{PackageCallbacks, PackageHandler};
use crate::settings::{ExportedSettings, ServerSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

const CHALLENGE_LEN: usize = 32;

/// Outcome of a successful join: the data-channel encryption context, or
/// `None` if the connection runs unencrypted (§4.3.1).
pub struct JoinOutcome {
    pub data_channel: Option<AesContext>,
    pub peer_settings: ExportedSettings,
}

/// Runs the server side of the handshake for one freshly-accepted
/// connection (§4.3).
pub async fn run_server_handshake<R, W, Cb>(
    handler: &PackageHandler<R, W, Cb>,
    settings: &ServerSettings,
) -> Result<JoinOutcome, HandshakeError>
where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    let exported = settings.exported();
    let auth_info_bytes = exported.to_auth_info_bytes();
    handler
        .dispatch(&Package::new(
            PackageType::AuthInfo,
            DataType::Byte,
            Some(auth_info_bytes.to_vec()),
        ))
        .await?;

    if !exported.encryption_enabled {
        info!("encryption disabled, skipping directly to validation");
        run_validation_as_prober(handler, settings.connection_test_tries(), None).await?;
        return Ok(JoinOutcome {
            data_channel: None,
            peer_settings: exported,
        });
    }

    let password = settings
        .password()
        .ok_or(HandshakeError::PasswordRequired)?
        .as_str()
        .to_string();

    if !challenge_peer(handler, &password).await? {
        warn!("client failed auth challenge");
        return Err(HandshakeError::AuthFailed);
    }
    if !prove_to_peer(handler, &password).await? {
        warn!("server failed to prove password to client");
        return Err(HandshakeError::AuthFailed);
    }

    let data_ctx = AesContext::generate(&password)?;
    handler
        .dispatch(&Package::empty(PackageType::EncrRequest))
        .await?;
    handler
        .dispatch(&Package::blob(PackageType::EncrSalt, data_ctx.salt().to_vec()))
        .await?;
    handler
        .dispatch(&Package::blob(PackageType::EncrIv, data_ctx.iv().to_vec()))
        .await?;

    run_validation_as_prober(handler, settings.connection_test_tries(), Some(&data_ctx)).await?;

    info!("server handshake joined");
    Ok(JoinOutcome {
        data_channel: Some(data_ctx),
        peer_settings: exported,
    })
}

/// Runs the client side of the handshake (§4.3). `password` is `None` when
/// the client was not configured with one; that's only valid if the server
/// turns out to have encryption disabled.
pub async fn run_client_handshake<R, W, Cb>(
    handler: &PackageHandler<R, W, Cb>,
    password: Option<&str>,
) -> Result<JoinOutcome, HandshakeError>
where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    let auth_info = handler
        .obtain_expected_one(Some(PackageType::AuthInfo))
        .await?;
    let mut raw = [0u8; ExportedSettings::WIRE_LEN];
    let payload = auth_info.payload.unwrap_or_default();
    raw[..payload.len().min(raw.len())].copy_from_slice(&payload[..payload.len().min(raw.len())]);
    let (exported, encryption_enabled) = ExportedSettings::from_auth_info_bytes(raw);

    if !encryption_enabled {
        info!("server reports encryption disabled, skipping directly to validation");
        run_validation_as_echoer(handler, exported.connection_test_tries, None).await?;
        return Ok(JoinOutcome {
            data_channel: None,
            peer_settings: exported,
        });
    }

    let password = password.ok_or(HandshakeError::PasswordRequired)?;

    if !prove_to_peer(handler, password).await? {
        warn!("client failed to prove password to server");
        return Err(HandshakeError::AuthFailed);
    }
    if !challenge_peer(handler, password).await? {
        warn!("server failed auth challenge");
        return Err(HandshakeError::AuthFailed);
    }

    handler
        .obtain_expected_one(Some(PackageType::EncrRequest))
        .await?;
    let salt_pkg = handler
        .obtain_expected_one(Some(PackageType::EncrSalt))
        .await?;
    let iv_pkg = handler
        .obtain_expected_one(Some(PackageType::EncrIv))
        .await?;
    let salt = salt_pkg.payload.unwrap_or_default();
    let iv_bytes = iv_pkg.payload.unwrap_or_default();
    if iv_bytes.len() != crypto::IV_LEN {
        return Err(HandshakeError::Crypto(crate::error::CryptoError::IvWrongLength));
    }
    let mut iv = [0u8; crypto::IV_LEN];
    iv.copy_from_slice(&iv_bytes);
    let data_ctx = AesContext::from_parts(password, salt, iv)?;

    run_validation_as_echoer(handler, exported.connection_test_tries, Some(&data_ctx)).await?;

    info!("client handshake joined");
    Ok(JoinOutcome {
        data_channel: Some(data_ctx),
        peer_settings: exported,
    })
}

/// The "asking" side of a challenge round (§4.3.2/§4.3.3): generate a fresh
/// AES context, encrypt a random challenge `c_out` with it, send
/// salt/IV/`Auth_Challenge(enc_out)`, and compare the peer's response
/// against `h_out = SHA-512(c_out)` — the plaintext challenge digest, not a
/// function of the key.
async fn challenge_peer<R, W, Cb>(
    handler: &PackageHandler<R, W, Cb>,
    password: &str,
) -> Result<bool, HandshakeError>
where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    let ctx = AesContext::generate(password)?;
    let challenge = crypto::random_bytes(CHALLENGE_LEN);
    let encrypted_challenge = ctx.encrypt(&challenge)?;
    let expected = crypto::sha512(&challenge);

    handler
        .dispatch(&Package::blob(PackageType::AuthSalt, ctx.salt().to_vec()))
        .await?;
    handler
        .dispatch(&Package::blob(PackageType::AuthIv, ctx.iv().to_vec()))
        .await?;
    handler
        .dispatch(&Package::blob(PackageType::AuthChallenge, encrypted_challenge))
        .await?;

    let response = handler
        .obtain_expected_one(Some(PackageType::AuthResponse))
        .await?;
    let got = response.payload.unwrap_or_default();
    let passed = crypto::constant_time_eq(&expected, &got);

    let verdict = if passed {
        PackageType::AuthSuccess
    } else {
        PackageType::AuthFailure
    };
    handler
        .dispatch(&Package::empty(verdict))
        .await?;

    Ok(passed)
}

/// The "proving" side of a challenge round (§4.3.2/§4.3.3): receive
/// salt/IV/`Auth_Challenge(enc_out)`, reconstruct the asker's AES context,
/// decrypt the challenge, and reply with `h' = SHA-512(decrypted)`. A
/// decryption fault here (wrong password) is treated as `Auth_Failure`
/// territory rather than a protocol error (§4.3.3): we still send *some*
/// response so the asker's side of the exchange completes normally, just one
/// that won't match `h_out`.
async fn prove_to_peer<R, W, Cb>(
    handler: &PackageHandler<R, W, Cb>,
    password: &str,
) -> Result<bool, HandshakeError>
where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    let salt_pkg = handler
        .obtain_expected_one(Some(PackageType::AuthSalt))
        .await?;
    let iv_pkg = handler
        .obtain_expected_one(Some(PackageType::AuthIv))
        .await?;
    let challenge_pkg = handler
        .obtain_expected_one(Some(PackageType::AuthChallenge))
        .await?;

    let salt = salt_pkg.payload.unwrap_or_default();
    let iv_bytes = iv_pkg.payload.unwrap_or_default();
    let encrypted_challenge = challenge_pkg.payload.unwrap_or_default();

    if iv_bytes.len() != crypto::IV_LEN {
        return Err(HandshakeError::Crypto(crate::error::CryptoError::IvWrongLength));
    }
    let mut iv = [0u8; crypto::IV_LEN];
    iv.copy_from_slice(&iv_bytes);

    let ctx = AesContext::from_parts(password, salt, iv)?;
    let digest = ctx
        .decrypt(&encrypted_challenge)
        .map(|plain| crypto::sha512(&plain))
        .unwrap_or_else(|_| crypto::random_array::<64>());

    handler
        .dispatch(&Package::blob(PackageType::AuthResponse, digest.to_vec()))
        .await?;

    let verdict = handler
        .obtain_expected_any(&[PackageType::AuthSuccess, PackageType::AuthFailure])
        .await?;

    Ok(verdict.package_type == PackageType::AuthSuccess)
}

/// Validation round, prober side (server in a fresh join) (§4.3.5). `ctx`,
/// when present, is the just-established data-channel context: the probe
/// and echo payloads are encrypted/decrypted through it, exactly like `Data`
/// packages from this point on.
async fn run_validation_as_prober<R, W, Cb>(
    handler: &PackageHandler<R, W, Cb>,
    tries: u8,
    ctx: Option<&AesContext>,
) -> Result<(), HandshakeError>
where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    handler
        .dispatch(&Package::empty(PackageType::TestRequest))
        .await?;

    for _ in 0..tries {
        let len = 1 + (crypto::random_bytes(1)[0] as usize % 5);
        let probe = crypto::random_bytes(len);
        let wire = match ctx {
            Some(ctx) => ctx.encrypt(&probe)?,
            None => probe.clone(),
        };
        handler
            .dispatch(&Package::blob(PackageType::Test, wire))
            .await?;

        let echo_pkg = handler
            .obtain_expected_one(Some(PackageType::Test))
            .await?;
        let echo_wire = echo_pkg.payload.unwrap_or_default();
        let echo = match ctx {
            Some(ctx) => ctx.decrypt(&echo_wire).unwrap_or_default(),
            None => echo_wire,
        };
        let ok = echo.len() == probe.len() && shares_byte_value(&probe, &echo);

        let verdict = if ok {
            PackageType::TestTrySuccess
        } else {
            PackageType::TestTryFailure
        };
        handler
            .dispatch(&Package::empty(verdict))
            .await?;

        if !ok {
            return Err(HandshakeError::ValidationFailed);
        }
    }
    Ok(())
}

/// Validation round, echoer side (client in a fresh join) (§4.3.5). `tries`
/// comes from the peer's exported settings (`connection_test_tries`), so
/// both sides run exactly the same number of rounds. The reply is a fresh
/// random buffer with one randomly chosen index overwritten by a byte drawn
/// from the decrypted probe (§4.3.5, §9): it shares a byte value with the
/// probe without simply echoing it back.
async fn run_validation_as_echoer<R, W, Cb>(
    handler: &PackageHandler<R, W, Cb>,
    tries: u8,
    ctx: Option<&AesContext>,
) -> Result<(), HandshakeError>
where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    handler
        .obtain_expected_one(Some(PackageType::TestRequest))
        .await?;

    for _ in 0..tries {
        let probe_pkg = handler
            .obtain_expected_one(Some(PackageType::Test))
            .await?;
        let probe_wire = probe_pkg.payload.unwrap_or_default();
        let probe = match ctx {
            Some(ctx) => ctx.decrypt(&probe_wire).unwrap_or_default(),
            None => probe_wire,
        };

        let mut reply = crypto::random_bytes(probe.len().max(1));
        if !probe.is_empty() {
            let idx = crypto::random_bytes(1)[0] as usize % reply.len();
            let src = crypto::random_bytes(1)[0] as usize % probe.len();
            reply[idx] = probe[src];
        }

        let wire = match ctx {
            Some(ctx) => ctx.encrypt(&reply)?,
            None => reply,
        };
        handler
            .dispatch(&Package::blob(PackageType::Test, wire))
            .await?;
        let verdict = handler
            .obtain_expected_any(&[PackageType::TestTrySuccess, PackageType::TestTryFailure])
            .await?;
        if verdict.package_type == PackageType::TestTryFailure {
            return Err(HandshakeError::ValidationFailed);
        }
    }
    Ok(())
}

fn shares_byte_value(a: &[u8], b: &[u8]) -> bool {
    a.iter().any(|x| b.contains(x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerErrorKind;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::duplex;

    #[test]
    fn shares_byte_value_detects_overlap() {
        assert!(shares_byte_value(&[1, 2, 3], &[9, 9, 2]));
        assert!(!shares_byte_value(&[1, 2, 3], &[4, 5, 6]));
    }

    struct NoopCallbacks;

    #[async_trait]
    impl PackageCallbacks for NoopCallbacks {
        async fn on_internal(&self, _pkg: Package) {}
        fn on_data(&self, _pkg: Package) {}
        async fn on_error(&self, _kind: HandlerErrorKind) {}
    }

    fn handler_pair() -> (
        PackageHandler<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>, NoopCallbacks>,
        PackageHandler<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>, NoopCallbacks>,
    ) {
        let (a, b) = duplex(8192);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let server = PackageHandler::new(
            a_read,
            a_write,
            std::sync::Arc::new(NoopCallbacks),
            Duration::from_millis(500),
            crate::codec::DEFAULT_MAX_PAYLOAD,
        );
        let client = PackageHandler::new(
            b_read,
            b_write,
            std::sync::Arc::new(NoopCallbacks),
            Duration::from_millis(500),
            crate::codec::DEFAULT_MAX_PAYLOAD,
        );
        (server, client)
    }

    #[tokio::test]
    async fn encrypted_handshake_joins_both_sides_with_matching_data_channel() {
        let (server_handler, client_handler) = handler_pair();
        let settings = ServerSettings::new(1).with_password("correct horse battery staple");

        let (server_outcome, client_outcome) = tokio::try_join!(
            run_server_handshake(&server_handler, &settings),
            run_client_handshake(&client_handler, Some("correct horse battery staple")),
        )
        .expect("both sides join");

        let server_ctx = server_outcome.data_channel.expect("server data channel set");
        let client_ctx = client_outcome.data_channel.expect("client data channel set");

        let plaintext = b"after the handshake, data packages are encrypted";
        let ciphertext = server_ctx.encrypt(plaintext).unwrap();
        assert_eq!(client_ctx.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[tokio::test]
    async fn wrong_password_fails_join_on_both_sides() {
        let (server_handler, client_handler) = handler_pair();
        let settings = ServerSettings::new(1).with_password("correct horse battery staple");

        let (server_result, client_result) = tokio::join!(
            run_server_handshake(&server_handler, &settings),
            run_client_handshake(&client_handler, Some("wrong password")),
        );

        assert!(server_result.is_err());
        assert!(client_result.is_err());
    }

    #[tokio::test]
    async fn unencrypted_handshake_skips_straight_to_validation() {
        let (server_handler, client_handler) = handler_pair();
        let settings = ServerSettings::new(1).with_encryption_enabled(false);

        let (server_outcome, client_outcome) = tokio::try_join!(
            run_server_handshake(&server_handler, &settings),
            run_client_handshake(&client_handler, None),
        )
        .expect("both sides join without encryption");

        assert!(server_outcome.data_channel.is_none());
        assert!(client_outcome.data_channel.is_none());
    }
}
