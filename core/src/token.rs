//! Session Token Codec
//!
//! A session token is the 12 character alphanumeric credential the backend
//! issues for an attendance session. Only a 16-bit digest of it fits in a
//! beacon's minor field, so this module owns the digest function every
//! platform must reproduce bit-for-bit.
//!
//! Digest algorithm (signed 32-bit accumulator, two's-complement wrap):
//!
//! ```text
//! h = 0
//! for each ASCII byte c:  h = (h << 5) - h + c
//! digest = |h| mod 65536        (|i32::MIN| is 2^31)
//! ```
//!
//! The digest is a discovery aid. Distinct tokens may share a digest; the
//! backend's lookup of the full token is what authorizes attendance.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Required token length in characters
pub const TOKEN_LENGTH: usize = 12;

/// Token alphabet: A-Z, a-z, 0-9
pub const TOKEN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Errors for token operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Invalid token format: expected 12 alphanumeric characters, got {length} characters")]
    InvalidTokenFormat { length: usize },
}

/// 16-bit digest carried in a beacon's minor field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenDigest(u16);

impl TokenDigest {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for TokenDigest {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for TokenDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A syntactically valid session token.
///
/// The only ways to obtain one are [`SessionToken::parse`] (and the
/// `FromStr`/`TryFrom` impls built on it) and [`SessionToken::generate`], so
/// a malformed string can never reach [`encode`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionToken(String);

impl SessionToken {
    /// Validate and wrap a candidate token
    pub fn parse(candidate: &str) -> Result<Self, TokenError> {
        if !is_valid_format(candidate) {
            return Err(TokenError::InvalidTokenFormat {
                length: candidate.chars().count(),
            });
        }
        Ok(Self(candidate.to_string()))
    }

    /// Generate a uniformly random token
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let token: String = (0..TOKEN_LENGTH)
            .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digest of this token
    pub fn digest(&self) -> TokenDigest {
        digest_bytes(self.0.as_bytes())
    }

    /// Short prefix safe to put in logs
    pub fn redacted(&self) -> String {
        format!("{}…", &self.0[..3])
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.redacted())
    }
}

impl FromStr for SessionToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionToken {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !is_valid_format(&value) {
            return Err(TokenError::InvalidTokenFormat {
                length: value.chars().count(),
            });
        }
        Ok(Self(value))
    }
}

impl From<SessionToken> for String {
    fn from(token: SessionToken) -> Self {
        token.0
    }
}

/// Pure syntactic check: exactly 12 characters, all in A-Z, a-z, 0-9
pub fn is_valid_format(candidate: &str) -> bool {
    candidate.len() == TOKEN_LENGTH && candidate.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Validate `candidate` and compute its digest
pub fn encode(candidate: &str) -> Result<TokenDigest, TokenError> {
    SessionToken::parse(candidate).map(|token| token.digest())
}

fn digest_bytes(bytes: &[u8]) -> TokenDigest {
    let mut hash: i32 = 0;
    for &byte in bytes {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(byte));
    }
    TokenDigest((hash.unsigned_abs() % 65_536) as u16)
}
