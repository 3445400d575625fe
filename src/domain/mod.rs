//! Domain layer - Call-control state and value objects
//!
//! This layer contains:
//! - Identity profile of the local user
//! - Agent lifecycle state and call direction
//! - Events surfaced to the application
//! - Authentication retry bookkeeping

pub mod agent_state;
pub mod auth_retry;
pub mod event;
pub mod profile;
pub mod shared;

// Re-export commonly used types
pub use agent_state::{AgentState, CallDirection};
pub use auth_retry::{AuthRetryTracker, MAX_REGISTER_ATTEMPTS};
pub use event::{SipEvent, SipEventType};
pub use profile::{IdentityProfile, TransportProtocol};
pub use shared::{Result, UaError};
