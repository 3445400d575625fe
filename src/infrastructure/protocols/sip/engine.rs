//! Transaction/dialog engine contract
//!
//! The call-control layer never touches sockets, retransmission timers or
//! dialog bookkeeping. It drives an engine through [`SipEngine`] and hears
//! back from it through a single [`EngineEvent`] channel.

use super::dialog::{DialogId, DialogState};
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::transaction::{ClientTransaction, ServerTransaction, TransactionId};
use crate::domain::{IdentityProfile, TransportProtocol};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Local endpoint the engine listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenEndpoint {
    pub ip: String,
    pub port: u16,
    pub transport: TransportProtocol,
}

impl ListenEndpoint {
    pub fn from_profile(profile: &IdentityProfile) -> Self {
        Self {
            ip: profile.local_ip.clone(),
            port: profile.local_port,
            transport: profile.transport,
        }
    }
}

/// Callbacks delivered by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new request. `transaction` is set when the engine already holds a
    /// server transaction for it.
    Request {
        request: SipRequest,
        transaction: Option<ServerTransaction>,
    },
    /// A response to one of our requests
    Response {
        response: SipResponse,
        transaction: Option<ClientTransaction>,
        dialog: Option<DialogId>,
    },
    /// A client transaction got no final response in time
    Timeout { transaction: TransactionId },
    TransactionTerminated { transaction: TransactionId },
    DialogTerminated { dialog: DialogId },
    IoError { message: String },
}

/// Transport/transaction engine consumed by the agent
#[async_trait]
pub trait SipEngine: Send + Sync {
    /// Open the listening endpoint and start delivering events to `events`
    async fn listen(
        &self,
        endpoint: ListenEndpoint,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<(), SipError>;

    /// Close the listening endpoint
    async fn unlisten(&self) -> Result<(), SipError>;

    /// Release everything; the engine is not reused afterwards
    async fn stop(&self) -> Result<(), SipError>;

    /// Send a request statefully
    async fn send_request(&self, request: SipRequest) -> Result<ClientTransaction, SipError>;

    /// Server transaction for an incoming request, created if needed
    async fn server_transaction(&self, request: &SipRequest) -> Result<ServerTransaction, SipError>;

    async fn send_response(
        &self,
        transaction: &ServerTransaction,
        response: SipResponse,
    ) -> Result<(), SipError>;

    async fn create_dialog_request(
        &self,
        dialog: &DialogId,
        method: SipMethod,
    ) -> Result<SipRequest, SipError>;

    async fn send_on_dialog(
        &self,
        dialog: &DialogId,
        request: SipRequest,
    ) -> Result<ClientTransaction, SipError>;

    /// ACK a 2xx to the INVITE that created `dialog`
    async fn send_ack(&self, dialog: &DialogId) -> Result<(), SipError>;

    async fn create_cancel(&self, transaction: &ClientTransaction) -> Result<SipRequest, SipError>;

    /// Dialog created by a client or server transaction
    async fn dialog_of(&self, transaction: &TransactionId) -> Option<DialogId>;

    async fn dialog_state(&self, dialog: &DialogId) -> Option<DialogState>;
}

/// Produces a fresh engine each time the agent (re)initializes
pub trait EngineFactory: Send + Sync {
    fn create(&self, profile: &IdentityProfile) -> Result<Arc<dyn SipEngine>, SipError>;
}

impl<F> EngineFactory for F
where
    F: Fn(&IdentityProfile) -> Result<Arc<dyn SipEngine>, SipError> + Send + Sync,
{
    fn create(&self, profile: &IdentityProfile) -> Result<Arc<dyn SipEngine>, SipError> {
        self(profile)
    }
}
