//! Engine API JWT helpers.
//!
//! The Engine API authenticates callers with an HS256 JWT whose `iat`
//! claim is the current unix time. The shared secret is configured either
//! as a path to a hex-encoded secret file or as an inline hex string.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("no JWT secret configured")]
    NoSecret,
    #[error("failed to sign token: {0}")]
    Sign(String),
}

#[derive(Serialize)]
struct Claims {
    iat: u64,
}

/// Parse a JWT secret from either a file path or a hex-encoded string.
///
/// Values starting with `/`, `./` or `../` are treated as file paths whose
/// contents are hex-encoded; anything else is parsed as hex directly, with
/// an optional `0x` prefix. Unreadable files and invalid hex yield `None`.
pub fn parse_secret(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if s.starts_with('/') || s.starts_with("./") || s.starts_with("../") {
        let data = match std::fs::read_to_string(s) {
            Ok(data) => data,
            Err(err) => {
                error!(path = %s, error = %err, "failed to read JWT secret from file");
                return None;
            }
        };

        return parse_hex_secret(&data);
    }

    parse_hex_secret(s)
}

fn parse_hex_secret(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);

    hex::decode(s).ok()
}

/// Create an HS256 token with the current time as `iat`.
pub fn create_token(secret: &[u8]) -> Result<String, JwtError> {
    if secret.is_empty() {
        return Err(JwtError::NoSecret);
    }

    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    encode(
        &Header::new(Algorithm::HS256),
        &Claims { iat },
        &EncodingKey::from_secret(secret),
    )
    .map_err(|err| JwtError::Sign(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_secret() {
        assert_eq!(parse_secret("0xdeadbeef"), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(parse_secret("deadbeef"), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(parse_secret("  0xdeadbeef  "), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(parse_secret("not-hex"), None);
        assert_eq!(parse_secret(""), None);
    }

    #[test]
    fn parses_secret_file() {
        let dir = std::env::temp_dir().join("snooper-jwt-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("jwt.hex");
        std::fs::write(&path, "0xdeadbeef\n").unwrap();

        let parsed = parse_secret(path.to_str().unwrap());
        assert_eq!(parsed, Some(vec![0xde, 0xad, 0xbe, 0xef]));

        assert_eq!(parse_secret("/nonexistent/jwt/secret"), None);
    }

    #[test]
    fn creates_hs256_token() {
        let token = create_token(&[0xde, 0xad, 0xbe, 0xef]).unwrap();

        // header.payload.signature
        assert_eq!(token.split('.').count(), 3);

        assert!(matches!(create_token(&[]), Err(JwtError::NoSecret)));
    }
}
