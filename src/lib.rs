//! sipua - Call control for a SIP user agent
//!
//! A layered implementation of a single-identity, single-call SIP user
//! agent: registration with digest authentication, placing and answering
//! calls, instant messages, and re-registration when the network changes.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{Collaborators, SipAgent, SipEventListener};
pub use config::Config;
pub use domain::shared::error::UaError;
pub use domain::shared::result::Result;
pub use domain::{AgentState, CallDirection, IdentityProfile, SipEvent, SipEventType};
