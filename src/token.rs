//! Viridian authentication token
//!
//! The metaserver issues tokens over its own authenticated transport; this
//! node only contracts the wire format. A token reaches the node double
//! sealed: under the handshake session key and, inside that, under the
//! node's private server key that only the metaserver shares.

use chrono::{DateTime, Utc};
use prost::Message;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("token carries no subscription deadline")]
    MissingSubscription,

    #[error("token subscription timestamp out of range")]
    InvalidTimestamp,

    #[error("token subscription already expired")]
    SubscriptionExpired,
}

/// The protobuf message the metaserver signs off on.
#[derive(Clone, PartialEq, Message)]
pub struct ViridianToken {
    /// Display name, for logs only.
    #[prost(string, tag = "1")]
    pub name: String,

    /// Stable identifier; one live session per identifier.
    #[prost(string, tag = "2")]
    pub identifier: String,

    /// Privileged viridians bypass the regular quota and never expire.
    #[prost(bool, tag = "3")]
    pub is_admin: bool,

    /// Absolute subscription deadline; required for non-privileged tokens.
    #[prost(message, optional, tag = "4")]
    pub subscription: Option<prost_types::Timestamp>,
}

impl ViridianToken {
    pub fn parse(bytes: &[u8]) -> Result<Self, TokenError> {
        Ok(Self::decode(bytes)?)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Time left on the subscription: `None` for privileged tokens, the
    /// remaining duration otherwise. A deadline in the past is an error —
    /// such a session would be torn down the moment it was registered.
    pub fn remaining_subscription(&self) -> Result<Option<Duration>, TokenError> {
        if self.is_admin {
            return Ok(None);
        }
        let stamp = self.subscription.as_ref().ok_or(TokenError::MissingSubscription)?;
        let deadline = DateTime::<Utc>::from_timestamp(stamp.seconds, stamp.nanos.max(0) as u32)
            .ok_or(TokenError::InvalidTimestamp)?;
        let remaining = (deadline - Utc::now()).to_std().map_err(|_| TokenError::SubscriptionExpired)?;
        if remaining.is_zero() {
            return Err(TokenError::SubscriptionExpired);
        }
        Ok(Some(remaining))
    }
}
