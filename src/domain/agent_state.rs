//! Agent lifecycle state and call direction

use serde::{Deserialize, Serialize};

/// Lifecycle state of the user agent.
///
/// Exactly one value is current at any time. `StackStopped` is terminal
/// until the agent is reinitialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    Registering,
    Ready,
    Calling,
    Incoming,
    Established,
    Idle,
    StackStopped,
}

impl AgentState {
    /// Whether a new incoming INVITE may be offered to the application
    pub fn accepts_new_call(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Ready)
    }

    /// Whether a call is being set up or is up
    pub fn in_call(&self) -> bool {
        matches!(
            self,
            AgentState::Calling | AgentState::Incoming | AgentState::Established
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentState::Registering => "REGISTERING",
            AgentState::Ready => "READY",
            AgentState::Calling => "CALLING",
            AgentState::Incoming => "INCOMING",
            AgentState::Established => "ESTABLISHED",
            AgentState::Idle => "IDLE",
            AgentState::StackStopped => "STACK_STOPPED",
        }
    }
}

/// Which transaction role owns the active call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CallDirection {
    /// No call
    #[default]
    None,
    /// We received the INVITE (server transaction)
    Incoming,
    /// We sent the INVITE (client transaction)
    Outgoing,
}
