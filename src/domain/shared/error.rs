//! Domain errors

use thiserror::Error;

/// Errors surfaced synchronously by the user agent's public surface.
///
/// Protocol-level failures (declines, dropped challenges, transport errors
/// inside a send worker) are never reported through this type; they show up
/// as events or log lines instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UaError {
    #[error("SIP stack not initialized")]
    NotInitialized,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
