//! Node configuration from the environment
//!
//! Key material and tuning knobs arrive as environment variables; everything
//! is validated up front so a misconfigured node refuses to start instead of
//! failing mid-session. The parsed [`NodeConfig`] is injected into the
//! listeners at construction — there is no process-wide key state.

use crate::crypto::{Asymmetric, CryptoError, Symmetric, SymmetricKey, KEY_SIZE, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Reserved peer-ID space: 0 plus the tunnel gateway pair.
const RESERVED_PEER_IDS: usize = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVariable(&'static str),

    #[error("environment variable {name} is invalid: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVariable(name))
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue { name, reason: e.to_string() }),
        Err(_) => Ok(default),
    }
}

fn decode_key(name: &'static str, raw: &str, expected: usize) -> Result<Vec<u8>, ConfigError> {
    let bytes = BASE64
        .decode(raw.trim())
        .map_err(|e| ConfigError::InvalidValue { name, reason: e.to_string() })?;
    if bytes.len() != expected {
        return Err(ConfigError::InvalidValue {
            name,
            reason: format!("expected {expected} bytes, got {}", bytes.len()),
        });
    }
    Ok(bytes)
}

// =============================================================================
// KEYS
// =============================================================================

/// The node's long-lived key material.
#[derive(Clone)]
pub struct NodeKeys {
    /// X25519 keypair clients seal their init messages to.
    pub private: Asymmetric,
    /// Symmetric key shared with the metaserver; the inner token seal.
    pub server_key: SymmetricKey,
}

impl NodeKeys {
    pub fn from_env() -> Result<Self, ConfigError> {
        let private_raw = decode_key("SEASIDE_PRIVATE_KEY", &required("SEASIDE_PRIVATE_KEY")?, PRIVATE_KEY_SIZE + PUBLIC_KEY_SIZE)?;
        let server_raw = decode_key("SEASIDE_SERVER_KEY", &required("SEASIDE_SERVER_KEY")?, KEY_SIZE)?;

        let mut server_key = [0u8; KEY_SIZE];
        server_key.copy_from_slice(&server_raw);
        Ok(Self { private: Asymmetric::from_bytes(&private_raw)?, server_key })
    }

    /// Fresh random keys, for tests and key bootstrapping.
    pub fn generate() -> Self {
        let (server_key, _) = Symmetric::generate();
        Self { private: Asymmetric::generate(), server_key }
    }

    pub fn server_cipher(&self) -> Symmetric {
        Symmetric::new(&self.server_key)
    }
}

// =============================================================================
// PORT
// =============================================================================

#[derive(Clone, Debug)]
pub struct PortConfig {
    /// Upper bound for the randomized obfuscation tail, bytes.
    pub max_tail_length: usize,
    /// Read deadline applied to every socket read during init.
    pub timeout: Duration,
    pub keepalive_idle: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            max_tail_length: 512,
            timeout: Duration::from_secs(32),
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_count: 3,
        }
    }
}

impl PortConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_tail_length: parse_var("PORT_MAX_TAIL_LENGTH", defaults.max_tail_length)?,
            timeout: Duration::from_secs(parse_var("PORT_TIMEOUT", defaults.timeout.as_secs())?),
            keepalive_idle: Duration::from_secs(parse_var("PORT_KEEPALIVE_IDLE", defaults.keepalive_idle.as_secs())?),
            keepalive_interval: Duration::from_secs(parse_var("PORT_KEEPALIVE_INTERVAL", defaults.keepalive_interval.as_secs())?),
            keepalive_count: parse_var("PORT_KEEPALIVE_COUNT", defaults.keepalive_count)?,
        })
    }
}

// =============================================================================
// TYPHOON
// =============================================================================

/// Adaptive-loop tuning. All times are milliseconds unless noted.
#[derive(Clone, Debug)]
pub struct TyphoonConfig {
    /// RFC 6298 smoothing gain for srtt.
    pub alpha: f64,
    /// RFC 6298 smoothing gain for rttvar.
    pub beta: f64,
    pub default_rtt: u32,
    pub min_rtt: u32,
    pub max_rtt: u32,
    /// Variance multiplier in the timeout formula.
    pub rtt_mult: f64,
    pub min_timeout: u32,
    pub max_timeout: u32,
    pub default_timeout: u32,
    /// Accepted bounds for handshake scheduling intervals on the wire.
    pub min_next_in: u32,
    pub max_next_in: u32,
    /// Fraction applied to the first server-advertised interval, so the
    /// first post-connect handshake arrives quickly.
    pub initial_next_in: f64,
    pub max_retries: u32,
    pub max_tail_length: usize,
}

impl Default for TyphoonConfig {
    fn default() -> Self {
        Self {
            alpha: 0.125,
            beta: 0.25,
            default_rtt: 1000,
            min_rtt: 100,
            max_rtt: 8000,
            rtt_mult: 4.0,
            min_timeout: 1000,
            max_timeout: 30_000,
            default_timeout: 30_000,
            min_next_in: 5000,
            max_next_in: 60_000,
            initial_next_in: 0.05,
            max_retries: 8,
            max_tail_length: 1024,
        }
    }
}

impl TyphoonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            alpha: parse_var("TYPHOON_ALPHA", defaults.alpha)?,
            beta: parse_var("TYPHOON_BETA", defaults.beta)?,
            default_rtt: parse_var("TYPHOON_DEFAULT_RTT", defaults.default_rtt)?,
            min_rtt: parse_var("TYPHOON_MIN_RTT", defaults.min_rtt)?,
            max_rtt: parse_var("TYPHOON_MAX_RTT", defaults.max_rtt)?,
            rtt_mult: parse_var("TYPHOON_RTT_MULT", defaults.rtt_mult)?,
            min_timeout: parse_var("TYPHOON_MIN_TIMEOUT", defaults.min_timeout)?,
            max_timeout: parse_var("TYPHOON_MAX_TIMEOUT", defaults.max_timeout)?,
            default_timeout: parse_var("TYPHOON_DEFAULT_TIMEOUT", defaults.default_timeout)?,
            min_next_in: parse_var("TYPHOON_MIN_NEXT_IN", defaults.min_next_in)?,
            max_next_in: parse_var("TYPHOON_MAX_NEXT_IN", defaults.max_next_in)?,
            initial_next_in: parse_var("TYPHOON_INITIAL_NEXT_IN", defaults.initial_next_in)?,
            max_retries: parse_var("TYPHOON_MAX_RETRIES", defaults.max_retries)?,
            max_tail_length: parse_var("TYPHOON_MAX_TAIL_LENGTH", defaults.max_tail_length)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let ordered = [
            ("TYPHOON_MIN_RTT", self.min_rtt <= self.max_rtt),
            ("TYPHOON_MIN_TIMEOUT", self.min_timeout <= self.max_timeout),
            ("TYPHOON_MIN_NEXT_IN", self.min_next_in <= self.max_next_in),
        ];
        for (name, ok) in ordered {
            if !ok {
                return Err(ConfigError::InvalidValue { name, reason: "lower bound exceeds upper bound".into() });
            }
        }
        if !(self.initial_next_in > 0.0 && self.initial_next_in <= 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "TYPHOON_INITIAL_NEXT_IN",
                reason: "fraction must be in (0, 1]".into(),
            });
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0 && self.beta > 0.0 && self.beta < 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "TYPHOON_ALPHA",
                reason: "smoothing gains must be in (0, 1)".into(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// NODE
// =============================================================================

pub struct NodeConfig {
    pub keys: NodeKeys,
    pub max_viridians: usize,
    pub max_admins: usize,
    /// Minimum protocol version clients must advertise.
    pub major_version: u8,
    pub port: PortConfig,
    pub typhoon: TyphoonConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_viridians = parse_var("SEASIDE_MAX_VIRIDIANS", 10usize)?;
        let max_admins = parse_var("SEASIDE_MAX_ADMINS", 5usize)?;
        if max_viridians + max_admins >= (1 << 16) - RESERVED_PEER_IDS {
            return Err(ConfigError::InvalidValue {
                name: "SEASIDE_MAX_VIRIDIANS",
                reason: format!("quota sum must stay below {}", (1 << 16) - RESERVED_PEER_IDS),
            });
        }

        Ok(Self {
            keys: NodeKeys::from_env()?,
            max_viridians,
            max_admins,
            major_version: parse_var("MAJOR_VERSION", 1u8)?,
            port: PortConfig::from_env()?,
            typhoon: TyphoonConfig::from_env()?,
        })
    }

    /// Defaults with the given keys; the integration harness entry point.
    pub fn with_keys(keys: NodeKeys) -> Self {
        Self {
            keys,
            max_viridians: 10,
            max_admins: 5,
            major_version: 1,
            port: PortConfig::default(),
            typhoon: TyphoonConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let typhoon = TyphoonConfig::default();
        assert!(typhoon.validate().is_ok());
        assert_eq!(typhoon.alpha, 0.125);
        assert_eq!(typhoon.beta, 0.25);
        assert_eq!(typhoon.max_retries, 8);

        let port = PortConfig::default();
        assert_eq!(port.max_tail_length, 512);
        assert_eq!(port.timeout, Duration::from_secs(32));
    }

    #[test]
    fn test_validation_rejects_inverted_bounds() {
        let config = TyphoonConfig { min_next_in: 10_000, max_next_in: 5000, ..TyphoonConfig::default() };
        assert!(config.validate().is_err());

        let config = TyphoonConfig { initial_next_in: 0.0, ..TyphoonConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_decoding() {
        let keys = NodeKeys::generate();
        let serialized = BASE64.encode(keys.private.to_bytes().unwrap());
        let decoded = decode_key("SEASIDE_PRIVATE_KEY", &serialized, 64).unwrap();
        assert_eq!(decoded.len(), 64);

        assert!(decode_key("SEASIDE_SERVER_KEY", &BASE64.encode([0u8; 16]), 32).is_err());
        assert!(decode_key("SEASIDE_SERVER_KEY", "!!!not-base64!!!", 32).is_err());
    }
}
