//! Wire protocol layer shared by PORT and TYPHOON
//!
//! Both protocols frame messages the same way at the bottom: an
//! AEAD-sealed header carrying a flag byte and the length of a randomized
//! obfuscation tail, so that a passive observer sees nothing but uniform
//! bytes of unpredictable length. The per-protocol modules build and parse
//! the concrete layouts in both directions; the client direction backs the
//! integration harness.

use crate::buffer::{BufferError, PacketPool};
use crate::crypto::{CryptoError, ASYMMETRIC_OVERHEAD};
use crate::ipv4::Ipv4Error;
use crate::token::TokenError;
use crate::viridian::RegistrationError;
use rand::{Rng, RngCore};
use thiserror::Error;

pub mod port;
pub mod typhoon;

// =============================================================================
// MESSAGE FLAGS
// =============================================================================

/// Message type bits. INIT, DATA and TERM appear alone; TYPHOON additionally
/// allows `HDSK | DATA` for shadow-ridden handshakes.
pub const FLAG_INIT: u8 = 0x01;
pub const FLAG_HDSK: u8 = 0x02;
pub const FLAG_DATA: u8 = 0x04;
pub const FLAG_TERM: u8 = 0x08;

// =============================================================================
// WIRE CONSTANTS
// =============================================================================

/// Ceiling for any cleartext protocol header.
pub const MAX_PROTOCOL_HEADER: usize = 64;

/// Largest payload a single framed message may carry.
pub const MAX_PROTOCOL_BODY: usize = (1 << 16) - MAX_PROTOCOL_HEADER - 2 * ASYMMETRIC_OVERHEAD;

/// The pool every protocol path allocates from: headroom for the largest
/// header plus one asymmetric seal, tailroom for the seal of a full payload.
pub fn packet_pool() -> PacketPool {
    PacketPool::new(MAX_PROTOCOL_HEADER + ASYMMETRIC_OVERHEAD, 1 << 16, ASYMMETRIC_OVERHEAD)
}

// =============================================================================
// RETURN CODES
// =============================================================================

/// Status byte carried in server INIT replies.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnCode {
    Success = 0,
    TokenParseError = 1,
    RegistrationError = 2,
    NextInError = 3,
    UnknownError = 4,
}

impl ReturnCode {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(Self::Success),
            1 => Ok(Self::TokenParseError),
            2 => Ok(Self::RegistrationError),
            3 => Ok(Self::NextInError),
            4 => Ok(Self::UnknownError),
            _ => Err(ProtocolError::InvalidHeader("return code")),
        }
    }
}

/// Transport a viridian session is speaking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Port,
    Typhoon,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Port => write!(f, "PORT"),
            Protocol::Typhoon => write!(f, "TYPHOON"),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid {0} header")]
    InvalidHeader(&'static str),

    #[error("unknown message flag {0:#04x}")]
    UnknownFlag(u8),

    #[error("client version {got} below required {required}")]
    UnsupportedVersion { required: u8, got: u8 },

    #[error("handshake interval {0} ms outside accepted range")]
    NextInOutOfRange(u32),

    #[error("token rejected: {0}")]
    Token(#[from] TokenError),

    #[error("token decryption failed: {0}")]
    TokenDecrypt(CryptoError),

    #[error("registration rejected: {0}")]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Ipv4(#[from] Ipv4Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// The status byte an init-phase failure reports back to the client.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            ProtocolError::Token(_) | ProtocolError::TokenDecrypt(_) => ReturnCode::TokenParseError,
            ProtocolError::Registration(_) => ReturnCode::RegistrationError,
            ProtocolError::NextInOutOfRange(_) => ReturnCode::NextInError,
            _ => ReturnCode::UnknownError,
        }
    }
}

// =============================================================================
// OBFUSCATION TAILS
// =============================================================================

/// Random length for the next obfuscation tail, `0..=max`.
pub fn random_tail_length(max: usize) -> u16 {
    rand::thread_rng().gen_range(0..=max.min(u16::MAX as usize)) as u16
}

/// Fill a tail region with random bytes.
pub fn fill_tail(tail: &mut [u8]) {
    rand::thread_rng().fill_bytes(tail);
}
