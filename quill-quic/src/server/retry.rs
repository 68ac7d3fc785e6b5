//! # Retry Tokens (RFC 9000 Section 8.1.2)
//!
//! Stateless, address-bound, time-limited tokens:
//!
//! ```text
//! Retry Token {
//!   Address Length (8),
//!   Client IP Address (..),
//!   Expiry (i),              // seconds since the Unix epoch, varint
//!   HMAC-SHA256 (256),       // over every preceding byte
//! }
//! ```
//!
//! Validation never fails loudly: any structural problem, address mismatch,
//! expiry or tag mismatch yields [`TokenValidation::Invalid`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::trace;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::varint;

type TokenMac = Hmac<Sha256>;

const TAG_LEN: usize = 32;

/// Outcome of checking a token presented in an Initial packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidation {
    Valid,
    Invalid,
}

impl TokenValidation {
    pub fn is_valid(self) -> bool {
        self == TokenValidation::Valid
    }
}

#[derive(Clone)]
pub struct RetryTokenManager {
    secret: Vec<u8>,
    lifetime: Duration,
}

impl RetryTokenManager {
    pub fn new(secret: impl Into<Vec<u8>>, lifetime: Duration) -> Self {
        Self {
            secret: secret.into(),
            lifetime,
        }
    }

    /// Manager keyed by the configured secret, or by 32 random bytes when
    /// none is configured. Random keys do not survive a restart.
    pub fn from_config(config: &EngineConfig) -> std::result::Result<Self, hex::FromHexError> {
        let secret = match config.retry_secret_bytes() {
            Some(secret) => secret?,
            None => {
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };
        Ok(Self::new(secret, config.retry_token_lifetime()))
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    fn mac(&self) -> Result<TokenMac> {
        TokenMac::new_from_slice(&self.secret)
            .map_err(|_| Error::IllegalState("retry secret rejected by HMAC"))
    }

    /// Token binding `addr` that expires `lifetime` after `now`.
    pub fn mint(&self, addr: IpAddr, now: SystemTime) -> Result<Bytes> {
        let expiry = unix_secs(now) + self.lifetime.as_secs();
        let mut buf = BytesMut::with_capacity(1 + 16 + 8 + TAG_LEN);
        match addr {
            IpAddr::V4(v4) => {
                buf.put_u8(4);
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_u8(16);
                buf.put_slice(&v6.octets());
            }
        }
        varint::encode(expiry, &mut buf)?;

        let mut mac = self.mac()?;
        mac.update(&buf);
        buf.put_slice(&mac.finalize().into_bytes());
        Ok(buf.freeze())
    }

    /// Check `token` against the address the Initial came from.
    pub fn validate(&self, token: &[u8], addr: IpAddr, now: SystemTime) -> TokenValidation {
        match self.check(token, addr, now) {
            Some(()) => TokenValidation::Valid,
            None => TokenValidation::Invalid,
        }
    }

    fn check(&self, token: &[u8], addr: IpAddr, now: SystemTime) -> Option<()> {
        if token.len() <= TAG_LEN {
            trace!(len = token.len(), "retry token too short");
            return None;
        }
        let (body, tag) = token.split_at(token.len() - TAG_LEN);
        let mut mac = self.mac().ok()?;
        mac.update(body);
        // constant-time comparison
        if mac.verify_slice(tag).is_err() {
            trace!("retry token tag mismatch");
            return None;
        }

        let (&addr_len, rest) = body.split_first()?;
        let addr_len = addr_len as usize;
        if rest.len() < addr_len {
            return None;
        }
        let (addr_bytes, mut rest) = rest.split_at(addr_len);
        let bound = match addr_len {
            4 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(addr_bytes).ok()?)),
            16 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(addr_bytes).ok()?)),
            _ => return None,
        };
        let expiry = varint::decode(&mut rest).ok()?;
        if !rest.is_empty() {
            return None;
        }

        if bound != addr {
            trace!(%bound, %addr, "retry token bound to another address");
            return None;
        }
        if unix_secs(now) >= expiry {
            trace!(expiry, "retry token expired");
            return None;
        }
        Some(())
    }
}

impl std::fmt::Debug for RetryTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryTokenManager")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RetryTokenManager {
        RetryTokenManager::new([7u8; 32], Duration::from_secs(30))
    }

    fn v4(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn test_token_valid_for_minting_address() {
        let now = SystemTime::now();
        let token = manager().mint(v4(1), now).unwrap();
        assert_eq!(token[0], 4);
        assert_eq!(manager().validate(&token, v4(1), now), TokenValidation::Valid);
    }

    #[test]
    fn test_ipv6_token() {
        let addr = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let now = SystemTime::now();
        let token = manager().mint(addr, now).unwrap();
        assert_eq!(token[0], 16);
        assert!(manager().validate(&token, addr, now).is_valid());
        assert!(!manager().validate(&token, v4(1), now).is_valid());
    }

    #[test]
    fn test_token_rejected_for_other_address() {
        let now = SystemTime::now();
        let token = manager().mint(v4(1), now).unwrap();
        assert_eq!(manager().validate(&token, v4(2), now), TokenValidation::Invalid);
    }

    #[test]
    fn test_token_expires() {
        let now = SystemTime::now();
        let token = manager().mint(v4(1), now).unwrap();
        let later = now + Duration::from_secs(31);
        assert_eq!(manager().validate(&token, v4(1), later), TokenValidation::Invalid);
    }

    #[test]
    fn test_tampered_token_rejected() {
        let now = SystemTime::now();
        let mut token = manager().mint(v4(1), now).unwrap().to_vec();
        // push the expiry out by flipping a body byte
        token[5] ^= 0x01;
        assert_eq!(manager().validate(&token, v4(1), now), TokenValidation::Invalid);
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let now = SystemTime::now();
        let token = manager().mint(v4(1), now).unwrap();
        let other = RetryTokenManager::new([8u8; 32], Duration::from_secs(30));
        assert_eq!(other.validate(&token, v4(1), now), TokenValidation::Invalid);
    }

    #[test]
    fn test_garbage_fails_closed() {
        let now = SystemTime::now();
        let m = manager();
        assert!(!m.validate(&[], v4(1), now).is_valid());
        assert!(!m.validate(&[0u8; TAG_LEN], v4(1), now).is_valid());
        assert!(!m.validate(&[0xff; 64], v4(1), now).is_valid());
        let token = m.mint(v4(1), now).unwrap();
        assert!(!m.validate(&token[..token.len() - 1], v4(1), now).is_valid());
    }

    #[test]
    fn test_from_config_uses_hex_secret() {
        let config = EngineConfig {
            retry_secret: Some("07".repeat(32)),
            ..EngineConfig::default()
        };
        let now = SystemTime::now();
        let from_config = RetryTokenManager::from_config(&config).unwrap();
        let token = manager().mint(v4(3), now).unwrap();
        assert!(from_config.validate(&token, v4(3), now).is_valid());
    }
}
