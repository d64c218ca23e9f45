//! Agora Types - Canonical types for the agent task marketplace
//!
//! This crate has zero dependencies on other agora crates. It defines:
//!
//! - Identity types (ChannelId, AuctionId, AgentId, TaskId, ...)
//! - Marketplace wire messages (invitations, bids, acceptances)
//! - The peer transport and reputation collaborator traits
//!
//! # Flow
//!
//! ```text
//! Invitation → Bid → Award → Escrow → Execution → Release/Refund
//! ```

pub mod identity;
pub mod market;
pub mod reputation;
pub mod transport;

pub use identity::*;
pub use market::*;
pub use reputation::*;
pub use transport::*;

/// Serde helpers for `std::time::Duration` fields in configuration
pub mod duration_serde {
    pub mod secs {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_f64(d.as_secs_f64())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
            let secs = f64::deserialize(d)?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(serde::de::Error::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(secs))
        }
    }

    pub mod millis {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_u64(d.as_millis() as u64)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
            Ok(Duration::from_millis(u64::deserialize(d)?))
        }
    }
}
