//! Identity types for Agora
//!
//! Internally generated records (channels, auctions, bids, transactions) use
//! UUID-backed ids. Parties and tasks are named by the outside world, so they
//! are opaque string handles.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate UUID-backed ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

/// Macro to generate string handle types for externally named entities
macro_rules! define_handle_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

// Ledger-owned records
define_id_type!(ChannelId, "chan", "Unique identifier for a payment channel");
define_id_type!(TxId, "tx", "Unique identifier for a channel transaction log entry");

// Auction-owned records
define_id_type!(AuctionId, "auction", "Unique identifier for a task auction");
define_id_type!(BidId, "bid", "Unique identifier for a bid");

// Externally named parties and work
define_handle_type!(AccountId, "Ledger account handle (payer or payee)");
define_handle_type!(AgentId, "Identity of a marketplace agent");
define_handle_type!(TaskId, "Identity of a unit of work being auctioned");
define_handle_type!(WorkflowId, "Identity of a multi-agent workflow");

impl From<&AgentId> for AccountId {
    fn from(agent: &AgentId) -> Self {
        Self(agent.0.clone())
    }
}
