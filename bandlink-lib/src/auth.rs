//! Challenge-response authentication against the band
//!
//! The band proves nothing about itself; the host proves it holds the
//! pre-shared key by encrypting a fresh random challenge.
//!
//! # Handshake
//!
//! 1. Host writes `02 00` (request random) to the auth characteristic
//! 2. Band notifies `10 02 01` followed by a 16-byte challenge
//! 3. Host writes `03 00` followed by AES-128-ECB(key, challenge)
//! 4. Band notifies `10 03 <status>`, where `01` means the key matched
//!
//! Every handshake starts from step 1, so re-authentication after a
//! transient failure never reuses an old challenge.

use crate::codec::AuthKey;
use crate::constants::AUTH_KEY_SIZE;
use crate::error::BandError;
use crate::transport::{Characteristic, Link, TransportSession};
use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Opcode prefixing every notification on the auth characteristic
pub const AUTH_RESPONSE_OPCODE: u8 = 0x10;

/// Status byte of a successful step
pub const AUTH_SUCCESS: u8 = 0x01;

/// Auth commands, echoed back by the band in its responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, strum_macros::Display)]
#[repr(u8)]
pub enum AuthCommand {
    RequestRandom = 0x02,
    EncryptedResponse = 0x03,
}

/// Host to band frames on the auth characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    RequestRandom,
    EncryptedResponse([u8; AUTH_KEY_SIZE]),
}

impl AuthRequest {
    pub fn command(&self) -> AuthCommand {
        match self {
            AuthRequest::RequestRandom => AuthCommand::RequestRandom,
            AuthRequest::EncryptedResponse(_) => AuthCommand::EncryptedResponse,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![self.command().into(), 0x00];
        if let AuthRequest::EncryptedResponse(ciphertext) = self {
            frame.extend_from_slice(ciphertext);
        }
        frame
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BandError> {
        match bytes {
            [0x02, 0x00] => Ok(AuthRequest::RequestRandom),
            [0x03, 0x00, ciphertext @ ..] => Ok(AuthRequest::EncryptedResponse(ciphertext.try_into().map_err(
                |_| BandError::MalformedFrame(format!("encrypted response carries {} bytes", ciphertext.len())),
            )?)),
            other => Err(BandError::ProtocolViolation(format!(
                "unexpected auth request {}",
                hex::encode(other)
            ))),
        }
    }
}

/// Band to host notification on the auth characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub command: AuthCommand,
    pub status: u8,
    pub payload: Bytes,
}

impl AuthResponse {
    pub fn new(command: AuthCommand, status: u8, payload: &[u8]) -> Self {
        Self {
            command,
            status,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![AUTH_RESPONSE_OPCODE, self.command.into(), self.status];
        frame.extend_from_slice(&self.payload);
        frame
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BandError> {
        let [opcode, command, status, payload @ ..] = bytes else {
            return Err(BandError::MalformedFrame(format!(
                "auth response must be at least 3 bytes, got {}",
                bytes.len()
            )));
        };
        if *opcode != AUTH_RESPONSE_OPCODE {
            return Err(BandError::ProtocolViolation(format!(
                "unexpected auth opcode {opcode:#04x}"
            )));
        }
        let command = AuthCommand::try_from(*command)
            .map_err(|_| BandError::ProtocolViolation(format!("unknown auth command {command:#04x}")))?;
        Ok(Self::new(command, *status, payload))
    }

    pub fn is_success(&self) -> bool {
        self.status == AUTH_SUCCESS
    }
}

/// Imported key material for one session. Never persisted, never logged.
#[derive(Clone)]
pub struct Authenticator {
    cipher: Aes128,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Authenticator(<redacted>)")
    }
}

impl Authenticator {
    pub fn new(key: &AuthKey) -> Self {
        Self {
            cipher: Aes128::new(key.as_bytes().into()),
        }
    }

    /// AES-128-ECB, single block, no padding
    pub fn encrypt_challenge(&self, challenge: &[u8; AUTH_KEY_SIZE]) -> [u8; AUTH_KEY_SIZE] {
        let mut block = *challenge;
        self.cipher.encrypt_block((&mut block).into());
        block
    }

    /// Check a host's answer to `challenge`, as the band does
    pub fn verify(&self, challenge: &[u8; AUTH_KEY_SIZE], response: &[u8; AUTH_KEY_SIZE]) -> bool {
        self.encrypt_challenge(challenge) == *response
    }

    /// Run a full handshake over `auth`, bounded by `timeout`
    pub async fn handshake<L: Link>(
        &self,
        session: &TransportSession<L>,
        auth: &Characteristic,
        timeout: Duration,
    ) -> Result<(), BandError> {
        info!("Starting authentication handshake...");
        match tokio::time::timeout(timeout, self.run_handshake(session, auth)).await {
            Ok(Ok(())) => {
                info!("Authentication accepted by band.");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Authentication failed");
                Err(e)
            }
            Err(_) => {
                warn!(?timeout, "Authentication timed out");
                Err(BandError::AuthenticationTimeout(timeout))
            }
        }
    }

    async fn run_handshake<L: Link>(&self, session: &TransportSession<L>, auth: &Characteristic) -> Result<(), BandError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = session
            .subscribe(auth, move |value| {
                let _ = tx.send(value);
            })
            .await?;

        let outcome = self.challenge_response(session, auth, &mut rx).await;
        let released = session.unsubscribe(subscription).await;
        outcome?;
        released
    }

    async fn challenge_response<L: Link>(
        &self,
        session: &TransportSession<L>,
        auth: &Characteristic,
        rx: &mut mpsc::UnboundedReceiver<Bytes>,
    ) -> Result<(), BandError> {
        session.write(auth, &AuthRequest::RequestRandom.encode()).await?;
        let response = next_response(rx, AuthCommand::RequestRandom).await?;
        let challenge: [u8; AUTH_KEY_SIZE] = response.payload.as_ref().try_into().map_err(|_| {
            BandError::MalformedFrame(format!(
                "challenge must be {AUTH_KEY_SIZE} bytes, got {}",
                response.payload.len()
            ))
        })?;
        debug!("Received challenge");

        let answer = AuthRequest::EncryptedResponse(self.encrypt_challenge(&challenge));
        session.write(auth, &answer.encode()).await?;
        next_response(rx, AuthCommand::EncryptedResponse).await?;
        Ok(())
    }
}

/// Wait for the band's answer to `expected`; any other command is a protocol violation
async fn next_response(
    rx: &mut mpsc::UnboundedReceiver<Bytes>,
    expected: AuthCommand,
) -> Result<AuthResponse, BandError> {
    let frame = rx
        .recv()
        .await
        .ok_or_else(|| BandError::Transport("auth notifications ended before the band answered".to_string()))?;
    let response = AuthResponse::decode(&frame)?;
    if response.command != expected {
        return Err(BandError::ProtocolViolation(format!(
            "expected answer to {expected}, band answered {}",
            response.command
        )));
    }
    if !response.is_success() {
        return Err(BandError::AuthenticationRejected {
            status: response.status,
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> AuthKey {
        AuthKey::from_hex(text).unwrap()
    }

    #[test]
    fn test_known_answer() {
        // FIPS-197 appendix C.1
        let auth = Authenticator::new(&key("000102030405060708090a0b0c0d0e0f"));
        let challenge: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        let ciphertext = auth.encrypt_challenge(&challenge);
        assert_eq!(hex::encode(ciphertext), "69c4e0d86a7b0430d8cdb78070b4c55a");
        assert!(auth.verify(&challenge, &ciphertext));
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let ours = Authenticator::new(&key("000102030405060708090a0b0c0d0e0f"));
        let theirs = Authenticator::new(&key("0f0e0d0c0b0a09080706050403020100"));
        let challenge = [0x5A; 16];
        assert!(!theirs.verify(&challenge, &ours.encrypt_challenge(&challenge)));
    }

    #[test]
    fn test_request_frames() {
        assert_eq!(AuthRequest::RequestRandom.encode(), vec![0x02, 0x00]);

        let frame = AuthRequest::EncryptedResponse([0xAB; 16]).encode();
        assert_eq!(frame.len(), 18);
        assert_eq!(&frame[..2], &[0x03, 0x00]);
        assert_eq!(AuthRequest::decode(&frame).unwrap(), AuthRequest::EncryptedResponse([0xAB; 16]));

        assert!(matches!(
            AuthRequest::decode(&[0x03, 0x00, 0x01]),
            Err(BandError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_response_parsing() {
        let challenge = hex::decode("100201000102030405060708090a0b0c0d0e0f").unwrap();
        let response = AuthResponse::decode(&challenge).unwrap();
        assert_eq!(response.command, AuthCommand::RequestRandom);
        assert!(response.is_success());
        assert_eq!(response.payload.len(), 16);

        let rejected = AuthResponse::decode(&[0x10, 0x03, 0x04]).unwrap();
        assert_eq!(rejected.command, AuthCommand::EncryptedResponse);
        assert!(!rejected.is_success());
    }

    #[test]
    fn test_response_rejects_unknown_opcode() {
        assert!(matches!(
            AuthResponse::decode(&[0x11, 0x02, 0x01]),
            Err(BandError::ProtocolViolation(_))
        ));
        assert!(matches!(
            AuthResponse::decode(&[0x10, 0x07, 0x01]),
            Err(BandError::ProtocolViolation(_))
        ));
        assert!(matches!(AuthResponse::decode(&[0x10, 0x02]), Err(BandError::MalformedFrame(_))));
    }

    #[test]
    fn test_authenticator_debug_is_redacted() {
        let auth = Authenticator::new(&key("000102030405060708090a0b0c0d0e0f"));
        assert_eq!(format!("{auth:?}"), "Authenticator(<redacted>)");
    }
}
