//! Stateless OAuth state tokens for CSRF protection.
//!
//! A token carries its own issue time, expiry, nonce and optional payload
//! (the tenant UUID), all covered by an HMAC-SHA256 signature, so the
//! authorize → callback round trip needs no server-side state.
//!
//! Wire format (colon-delimited, every field free of `:`):
//!
//! ```text
//! <issued_at>:<expires_at>:<nonce>:<signature>
//! <issued_at>:<expires_at>:<nonce>:<payload>:<signature>
//! ```
//!
//! `nonce`, `payload` and `signature` are URL-safe base64 without padding.
//! The signature covers every preceding field exactly as transmitted.

use crate::config::{ConfigError, Secret};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime and maximum accepted age (seconds)
pub const DEFAULT_TTL_SECONDS: u32 = 300;

/// Random bytes in the nonce (before encoding)
const NONCE_BYTES: usize = 16;

/// Why a state token was rejected.
///
/// The variants exist for logs; callers show every one of them to users as
/// [`StateTokenError::user_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateTokenError {
    #[error("malformed state token")]
    Malformed,
    #[error("expired state token")]
    Expired,
    #[error("state token age exceeds maximum allowed")]
    TooOld,
    #[error("invalid state token signature")]
    InvalidSignature,
}

impl StateTokenError {
    /// The single message shown to users regardless of the rejection reason.
    pub fn user_message(&self) -> &'static str {
        "Invalid or expired request, please retry the login"
    }
}

/// Mints and validates state tokens with a process-wide secret.
#[derive(Clone)]
pub struct StateTokenCodec {
    mac: HmacSha256,
}

impl std::fmt::Debug for StateTokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateTokenCodec(**redacted**)")
    }
}

impl StateTokenCodec {
    pub fn new(secret: &Secret) -> Result<Self, ConfigError> {
        if secret.is_blank() {
            return Err(ConfigError::MissingSecret);
        }
        let mac = HmacSha256::new_from_slice(secret.expose().as_bytes())
            .map_err(|_| ConfigError::MissingSecret)?;
        Ok(Self { mac })
    }

    /// Generates a token valid for `ttl_seconds` from now.
    ///
    /// An empty payload is the same as no payload.
    pub fn generate(&self, payload: Option<&str>, ttl_seconds: u32) -> String {
        self.generate_at(payload, ttl_seconds, Utc::now().timestamp())
    }

    /// Generates a token as if issued at `now` (unix seconds).
    pub fn generate_at(&self, payload: Option<&str>, ttl_seconds: u32, now: i64) -> String {
        let expires_at = now.saturating_add(i64::from(ttl_seconds));

        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);

        let mut signed = format!("{}:{}:{}", now, expires_at, URL_SAFE_NO_PAD.encode(nonce));
        if let Some(payload) = payload.filter(|p| !p.is_empty()) {
            signed.push(':');
            signed.push_str(&URL_SAFE_NO_PAD.encode(payload.as_bytes()));
        }

        let signature = self.sign(&signed);
        format!("{}:{}", signed, signature)
    }

    /// Validates a token against the current time, returning its payload.
    pub fn validate(
        &self,
        token: &str,
        max_age_seconds: u32,
    ) -> Result<Option<String>, StateTokenError> {
        self.validate_at(token, max_age_seconds, Utc::now().timestamp())
    }

    /// Validates a token as of `now` (unix seconds).
    ///
    /// Checks run in order: shape, declared expiry, age against
    /// `max_age_seconds` (in either direction, bounding clock skew), then the
    /// signature. The payload is only decoded once the signature holds.
    pub fn validate_at(
        &self,
        token: &str,
        max_age_seconds: u32,
        now: i64,
    ) -> Result<Option<String>, StateTokenError> {
        let result = self.check(token, max_age_seconds, now);
        match &result {
            Ok(_) => debug!("State token validated"),
            Err(reason) => warn!(%reason, "State token rejected"),
        }
        result
    }

    fn check(
        &self,
        token: &str,
        max_age_seconds: u32,
        now: i64,
    ) -> Result<Option<String>, StateTokenError> {
        let parts: Vec<&str> = token.split(':').collect();
        let (issued_at, expires_at, payload, signature) = match parts.as_slice() {
            [issued_at, expires_at, _nonce, signature] => (*issued_at, *expires_at, None, *signature),
            [issued_at, expires_at, _nonce, payload, signature] => {
                (*issued_at, *expires_at, Some(*payload), *signature)
            }
            _ => return Err(StateTokenError::Malformed),
        };

        let issued_at: i64 = issued_at.parse().map_err(|_| StateTokenError::Malformed)?;
        let expires_at: i64 = expires_at.parse().map_err(|_| StateTokenError::Malformed)?;

        if now > expires_at {
            return Err(StateTokenError::Expired);
        }
        if now.abs_diff(issued_at) > u64::from(max_age_seconds) {
            return Err(StateTokenError::TooOld);
        }

        // Everything before the final ':' is the signed region
        let signed = &token[..token.len() - signature.len() - 1];
        let expected = self.sign(signed);
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(StateTokenError::InvalidSignature);
        }

        payload
            .map(|encoded| {
                URL_SAFE_NO_PAD
                    .decode(encoded)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .ok_or(StateTokenError::Malformed)
            })
            .transpose()
    }

    fn sign(&self, signed: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(signed.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn codec() -> StateTokenCodec {
        StateTokenCodec::new(&Secret::new("state-token-test-secret")).unwrap()
    }

    fn replace_char(token: &str, index: usize) -> String {
        let mut chars: Vec<char> = token.chars().collect();
        chars[index] = match chars[index] {
            c if c.is_ascii_digit() => {
                if c == '0' {
                    '1'
                } else {
                    '0'
                }
            }
            'A' => 'B',
            _ => 'A',
        };
        chars.into_iter().collect()
    }

    #[test]
    fn test_generate_and_validate_with_payload() {
        let codec = codec();
        let token = codec.generate(Some("tenant-42"), DEFAULT_TTL_SECONDS);

        assert_eq!(token.split(':').count(), 5);
        assert_eq!(
            codec.validate(&token, DEFAULT_TTL_SECONDS).unwrap().as_deref(),
            Some("tenant-42")
        );
    }

    #[test]
    fn test_generate_and_validate_without_payload() {
        let codec = codec();

        let token = codec.generate(None, DEFAULT_TTL_SECONDS);
        assert_eq!(token.split(':').count(), 4);
        assert_eq!(codec.validate(&token, DEFAULT_TTL_SECONDS).unwrap(), None);

        // Empty payload produces the short shape
        let token = codec.generate(Some(""), DEFAULT_TTL_SECONDS);
        assert_eq!(token.split(':').count(), 4);
    }

    #[test]
    fn test_payload_containing_colons_survives() {
        let codec = codec();
        let payload = "shop:demo.myshopify.com:tenant-ü";

        let token = codec.generate_at(Some(payload), 300, NOW);
        assert_eq!(token.split(':').count(), 5);
        assert_eq!(
            codec.validate_at(&token, 300, NOW).unwrap().as_deref(),
            Some(payload)
        );
    }

    #[test]
    fn test_tokens_are_unique() {
        let codec = codec();
        let a = codec.generate_at(Some("t"), 300, NOW);
        let b = codec.generate_at(Some("t"), 300, NOW);
        assert_ne!(a, b);
    }

    #[test]
    fn test_expired_token() {
        let codec = codec();
        let token = codec.generate_at(Some("tenant-42"), 60, NOW);

        assert!(codec.validate_at(&token, 300, NOW + 60).is_ok());
        assert_eq!(
            codec.validate_at(&token, 300, NOW + 61),
            Err(StateTokenError::Expired)
        );
    }

    #[test]
    fn test_age_bound_is_independent_of_expiry() {
        let codec = codec();
        // Declared lifetime is long, but the verifier only accepts 300s of age
        let token = codec.generate_at(None, 3600, NOW);

        assert!(codec.validate_at(&token, 300, NOW + 300).is_ok());
        assert_eq!(
            codec.validate_at(&token, 300, NOW + 301),
            Err(StateTokenError::TooOld)
        );
    }

    #[test]
    fn test_clock_skew_bound() {
        let codec = codec();
        let token = codec.generate_at(None, 300, NOW);

        // Verifier clock slightly behind the issuer
        assert!(codec.validate_at(&token, 300, NOW - 10).is_ok());
        // Token from too far in the future
        assert_eq!(
            codec.validate_at(&token, 300, NOW - 301),
            Err(StateTokenError::TooOld)
        );
    }

    #[test]
    fn test_malformed_tokens() {
        let codec = codec();

        for token in [
            "",
            "abc",
            "1:2:3",
            "1:2:3:4:5:6",
            "x:1700000300:nonce:sig",
            "1700000000:y:nonce:sig",
            "1700000000:1700000300:nonce:payload:sig:extra",
        ] {
            assert_eq!(
                codec.validate_at(token, 300, NOW),
                Err(StateTokenError::Malformed),
                "token {:?}",
                token
            );
        }
    }

    #[test]
    fn test_single_character_tampering_is_detected() {
        let codec = codec();
        let token = codec.generate_at(Some("tenant-42"), 300, NOW);
        let fields: Vec<&str> = token.split(':').collect();

        // Start offset of every field
        let mut offsets = Vec::new();
        let mut pos = 0;
        for field in &fields {
            offsets.push(pos);
            pos += field.len() + 1;
        }

        // Last digit of each timestamp keeps it inside the validity window
        let mut positions = vec![
            offsets[0] + fields[0].len() - 1,
            offsets[1] + fields[1].len() - 1,
        ];
        // Every character of nonce, payload and signature
        for field in 2..5 {
            positions.extend(offsets[field]..offsets[field] + fields[field].len());
        }

        for index in positions {
            let tampered = replace_char(&token, index);
            assert_ne!(tampered, token);
            assert_eq!(
                codec.validate_at(&tampered, 300, NOW),
                Err(StateTokenError::InvalidSignature),
                "tampering at {} not detected",
                index
            );
        }
    }

    #[test]
    fn test_payload_swap_is_detected() {
        let codec = codec();
        let token = codec.generate_at(Some("tenant-a"), 300, NOW);

        let mut fields: Vec<String> = token.split(':').map(str::to_string).collect();
        fields[3] = URL_SAFE_NO_PAD.encode("tenant-b");
        let forged = fields.join(":");

        assert_eq!(
            codec.validate_at(&forged, 300, NOW),
            Err(StateTokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = codec().generate_at(Some("tenant-42"), 300, NOW);
        let other = StateTokenCodec::new(&Secret::new("another-secret")).unwrap();

        assert_eq!(
            other.validate_at(&token, 300, NOW),
            Err(StateTokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_blank_secret_rejected() {
        assert!(matches!(
            StateTokenCodec::new(&Secret::new("")),
            Err(ConfigError::MissingSecret)
        ));
    }

    #[test]
    fn test_user_message_is_uniform() {
        let messages: Vec<&str> = [
            StateTokenError::Malformed,
            StateTokenError::Expired,
            StateTokenError::TooOld,
            StateTokenError::InvalidSignature,
        ]
        .iter()
        .map(|e| e.user_message())
        .collect();

        assert!(messages.windows(2).all(|w| w[0] == w[1]));
    }
}
