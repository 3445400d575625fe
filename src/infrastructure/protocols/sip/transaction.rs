//! Transaction handles
//!
//! The transaction engine owns the transaction state machines (RFC 3261
//! Section 17); the call-control layer only ever holds these handles.

use super::message::{HeaderAccess, SipMethod, SipRequest};
use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Transaction ID - uniquely identifies a transaction
/// Based on branch parameter in Via header
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId(pub String);

impl TransactionId {
    /// Create transaction ID from branch parameter
    pub fn from_branch(branch: &str) -> Self {
        Self(branch.to_string())
    }

    /// Generate a new transaction ID
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let random: u64 = rng.gen();
        Self(format!("z9hG4bK{:x}", random))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl SipTimers {
    /// Timer B / Timer F: give up on a client transaction after 64*T1
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }

    /// Timers scaled so that `transaction_timeout` equals `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            t1: timeout / 64,
            ..Self::default()
        }
    }
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Handle to a transaction we started
#[derive(Debug, Clone)]
pub struct ClientTransaction {
    pub id: TransactionId,
    pub request: SipRequest,
}

impl ClientTransaction {
    pub fn new(request: SipRequest) -> Self {
        let id = request
            .via_branch()
            .map(|b| TransactionId::from_branch(&b))
            .unwrap_or_else(TransactionId::generate);
        Self { id, request }
    }

    pub fn call_id(&self) -> Option<String> {
        self.request.call_id()
    }
}

/// Handle to a transaction the peer started
#[derive(Debug, Clone)]
pub struct ServerTransaction {
    pub id: TransactionId,
    pub request: SipRequest,
    /// Where responses are sent
    pub source: SocketAddr,
    /// To-tag used on responses that create a dialog
    pub local_tag: String,
}

impl ServerTransaction {
    pub fn new(request: SipRequest, source: SocketAddr) -> Self {
        let id = request
            .via_branch()
            .map(|b| TransactionId::from_branch(&b))
            .unwrap_or_else(TransactionId::generate);
        Self {
            id,
            request,
            source,
            local_tag: generate_tag(),
        }
    }

    pub fn method(&self) -> Option<SipMethod> {
        self.request.method()
    }
}

/// Random tag for From/To headers
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}
