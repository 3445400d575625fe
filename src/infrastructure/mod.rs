//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - SIP wire handling (messages, builders, SDP, digest authentication)
//! - The transaction/dialog engine contract and its UDP implementation

pub mod protocols;
