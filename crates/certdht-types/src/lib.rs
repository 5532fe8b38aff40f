//! # certdht-types
//!
//! Shared identity types used across the certdht workspace.
//!
//! A node is addressed in the overlay by a 160-bit [`NodeId`](identity::NodeId)
//! derived from its certificate fingerprint, and reached on the network through
//! the socket address carried in [`NodeInfo`](identity::NodeInfo).

pub mod identity;

pub use identity::{socket_addr_serde, Distance, NodeId, NodeInfo};

/// Length in bytes of a node identifier and of a DHT key (160 bits).
pub const ID_LEN: usize = 20;

/// Error types for identity parsing.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// The input was not valid hexadecimal.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// The input decoded to the wrong number of bytes.
    #[error("invalid identifier length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Convenience result type for identity parsing.
pub type Result<T> = std::result::Result<T, TypesError>;
