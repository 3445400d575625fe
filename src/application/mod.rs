//! Application layer - Call control
//!
//! This layer drives the SIP infrastructure on behalf of the owning
//! application. It's responsible for:
//! - The call and registration state machine
//! - Handing outbound sends to a worker
//! - Publishing events to listeners

pub mod agent;
pub mod dispatcher;
pub mod metrics;
pub mod outbound;

pub use agent::{Collaborators, LocalIpResolver, SipAgent};
pub use dispatcher::{EventDispatcher, SipEventListener};
pub use outbound::OutboundQueue;
