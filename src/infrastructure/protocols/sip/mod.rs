//! SIP protocol implementation
//!
//! The pieces a user agent needs underneath its call control (RFC 3261).
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Call control          │
//! │  (application::SipAgent)│
//! └───────────┬─────────────┘
//!             │ SipEngine / EngineEvent
//! ┌───────────▼─────────────┐
//! │    Dialog Layer         │
//! │   (SIP Dialogs)         │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client/Server TXN)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │        (UDP)            │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dialog;
pub mod engine;
pub mod message;
pub mod network;
pub mod sdp;
pub mod transaction;
pub mod transport;
pub mod udp_engine;

pub use auth::{ChallengeHandler, DigestChallenge, DigestChallengeHandler, UserCredentials};
pub use builder::{ExtraHeaders, InviteBody, RequestBuilder, ResponseBuilder};
pub use dialog::{Dialog, DialogId, DialogState};
pub use engine::{EngineEvent, EngineFactory, ListenEndpoint, SipEngine};
pub use message::{HeaderAccess, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::{MediaOffer, SdpSession};
pub use transaction::{ClientTransaction, ServerTransaction, SipTimers, TransactionId};
pub use transport::{Transport, UdpTransport};
pub use udp_engine::UdpEngine;
