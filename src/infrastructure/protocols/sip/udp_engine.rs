//! UDP implementation of the engine contract
//!
//! Client transactions are keyed by Via branch, server transactions by
//! branch and method (a CANCEL shares its INVITE's branch). Every request
//! leaves through the registrar acting as outbound proxy; responses go back
//! to wherever the request came from.

use super::builder::{build_cancel, build_failure_ack, ResponseBuilder};
use super::dialog::{Dialog, DialogId, DialogState};
use super::engine::{EngineEvent, ListenEndpoint, SipEngine};
use super::message::{HeaderAccess, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transaction::{ClientTransaction, ServerTransaction, SipTimers, TransactionId};
use super::transport::{IncomingMessage, OutgoingMessage, Transport, UdpTransport};
use crate::domain::{IdentityProfile, TransportProtocol};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct ClientEntry {
    transaction: ClientTransaction,
    /// Any response seen; stops retransmission
    responded: bool,
}

struct ServerEntry {
    transaction: ServerTransaction,
    /// Replayed when the request is retransmitted
    last_response: Option<SipResponse>,
}

type ServerKey = (TransactionId, SipMethod);

#[derive(Default)]
struct EngineState {
    endpoint: Option<ListenEndpoint>,
    local_addr: Option<SocketAddr>,
    events: Option<mpsc::Sender<EngineEvent>>,
    transport: Option<Arc<dyn Transport>>,
    pump: Option<JoinHandle<()>>,
    clients: HashMap<TransactionId, ClientEntry>,
    servers: HashMap<ServerKey, ServerEntry>,
    dialogs: HashMap<DialogId, Dialog>,
    dialog_by_txn: HashMap<TransactionId, DialogId>,
}

struct EngineInner {
    outbound_proxy: String,
    timers: SipTimers,
    state: Mutex<EngineState>,
}

/// UDP transaction/dialog engine
pub struct UdpEngine {
    inner: Arc<EngineInner>,
}

impl UdpEngine {
    pub fn new(outbound_proxy: impl Into<String>, timers: SipTimers) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                outbound_proxy: outbound_proxy.into(),
                timers,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Engine sending through the profile's registrar
    pub fn for_profile(profile: &IdentityProfile, timers: SipTimers) -> Self {
        Self::new(profile.remote_endpoint(), timers)
    }

    /// Address the socket is bound to while listening
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().await.local_addr
    }
}

/// Dialog an in-dialog request belongs to, seen from our side
fn incoming_dialog_id(request: &SipRequest) -> Option<DialogId> {
    Some(DialogId {
        call_id: request.call_id()?,
        local_tag: request.to_tag()?,
        remote_tag: request.from_tag()?,
    })
}

/// Dialog a response belongs to, for requests we sent
fn response_dialog_id(response: &SipResponse) -> Option<DialogId> {
    Some(DialogId {
        call_id: response.call_id()?,
        local_tag: response.from_tag()?,
        remote_tag: response.to_tag()?,
    })
}

impl EngineInner {
    async fn emit(&self, event: EngineEvent) {
        // never hold the state lock while the channel may be full
        let events = self.state.lock().await.events.clone();
        if let Some(tx) = events {
            if tx.send(event).await.is_err() {
                debug!("Event receiver dropped");
            }
        }
    }

    async fn transport(&self) -> Result<Arc<dyn Transport>, SipError> {
        self.state
            .lock()
            .await
            .transport
            .clone()
            .ok_or_else(|| SipError::TransportError("Engine is not listening".to_string()))
    }

    async fn proxy_addr(&self) -> Result<SocketAddr, SipError> {
        tokio::net::lookup_host(self.outbound_proxy.as_str())
            .await
            .map_err(|e| {
                SipError::TransportError(format!("Cannot resolve {}: {}", self.outbound_proxy, e))
            })?
            .next()
            .ok_or_else(|| {
                SipError::TransportError(format!("No address for {}", self.outbound_proxy))
            })
    }

    async fn transmit(&self, data: Bytes, destination: SocketAddr) -> Result<(), SipError> {
        self.transport()
            .await?
            .send(OutgoingMessage { data, destination })
            .await
    }

    /// Via for requests the engine builds itself
    async fn via(&self) -> Result<String, SipError> {
        let state = self.state.lock().await;
        let endpoint = state
            .endpoint
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Engine is not listening".to_string()))?;

        let (host, port) = match state.local_addr {
            Some(addr) if endpoint.ip.is_empty() => (addr.ip().to_string(), addr.port()),
            Some(addr) => (endpoint.ip.clone(), addr.port()),
            None => (endpoint.ip.clone(), endpoint.port),
        };

        Ok(format!(
            "SIP/2.0/{} {}:{};rport;branch={}",
            endpoint.transport,
            host,
            port,
            TransactionId::generate()
        ))
    }

    async fn start_client(
        self: &Arc<Self>,
        request: SipRequest,
        dialog: Option<DialogId>,
    ) -> Result<ClientTransaction, SipError> {
        let transaction = ClientTransaction::new(request);
        let destination = self.proxy_addr().await?;
        let data = transaction.request.to_bytes();

        {
            let mut state = self.state.lock().await;
            state.clients.insert(
                transaction.id.clone(),
                ClientEntry {
                    transaction: transaction.clone(),
                    responded: false,
                },
            );
            if let Some(dialog) = dialog {
                state.dialog_by_txn.insert(transaction.id.clone(), dialog);
            }
        }

        if let Err(e) = self.transmit(data.clone(), destination).await {
            self.state.lock().await.clients.remove(&transaction.id);
            return Err(e);
        }

        debug!(
            "Started client transaction {} ({:?})",
            transaction.id,
            transaction.request.method()
        );

        let inner = self.clone();
        let id = transaction.id.clone();
        let is_invite = transaction.request.method() == Some(SipMethod::Invite);
        tokio::spawn(async move {
            inner.client_timer(id, data, destination, is_invite).await;
        });

        Ok(transaction)
    }

    /// Timers A/E (retransmit) and B/F (give up)
    async fn client_timer(
        self: Arc<Self>,
        id: TransactionId,
        data: Bytes,
        destination: SocketAddr,
        is_invite: bool,
    ) {
        let deadline = Instant::now() + self.timers.transaction_timeout();
        let mut interval = self.timers.t1;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;

            let responded = match self.state.lock().await.clients.get(&id) {
                Some(entry) => entry.responded,
                None => return,
            };

            if !responded && Instant::now() < deadline {
                debug!("Retransmitting {}", id);
                if let Err(e) = self.transmit(data.clone(), destination).await {
                    warn!("Retransmission of {} failed: {}", id, e);
                }
            }
            interval = (interval * 2).min(self.timers.t2);
        }

        let expired = {
            let mut state = self.state.lock().await;
            // a ringing INVITE waits for its final response
            let proceeding = state
                .clients
                .get(&id)
                .map(|entry| is_invite && entry.responded);
            match proceeding {
                Some(false) => state.clients.remove(&id).is_some(),
                _ => false,
            }
        };

        if expired {
            warn!("Transaction {} timed out", id);
            self.emit(EngineEvent::Timeout {
                transaction: id.clone(),
            })
            .await;
            self.emit(EngineEvent::TransactionTerminated { transaction: id })
                .await;
        }
    }

    async fn expire_server(self: Arc<Self>, key: ServerKey) {
        tokio::time::sleep(self.timers.transaction_timeout()).await;
        let removed = self.state.lock().await.servers.remove(&key).is_some();
        if removed {
            self.emit(EngineEvent::TransactionTerminated { transaction: key.0 })
                .await;
        }
    }

    async fn retire_dialog(self: Arc<Self>, id: DialogId) {
        tokio::time::sleep(self.timers.transaction_timeout()).await;
        let mut state = self.state.lock().await;
        state.dialogs.remove(&id);
        state.dialog_by_txn.retain(|_, d| *d != id);
    }

    /// Mark a dialog terminated, returning its id when it was known
    async fn terminate_dialog(self: &Arc<Self>, id: &DialogId) -> Option<DialogId> {
        let known = {
            let mut state = self.state.lock().await;
            match state.dialogs.get_mut(id) {
                Some(dialog) => {
                    dialog.state = DialogState::Terminated;
                    true
                }
                None => false,
            }
        };

        if !known {
            return None;
        }
        let inner = self.clone();
        let retired = id.clone();
        tokio::spawn(async move {
            inner.retire_dialog(retired).await;
        });
        Some(id.clone())
    }

    async fn handle_incoming(self: &Arc<Self>, incoming: IncomingMessage) {
        match incoming.message {
            SipMessage::Request(request) => self.handle_request(request, incoming.source).await,
            SipMessage::Response(response) => self.handle_response(response).await,
        }
    }

    async fn handle_request(self: &Arc<Self>, request: SipRequest, source: SocketAddr) {
        let method = match request.method() {
            Some(method) => method,
            None => {
                warn!("Unsupported method {} from {}", request.inner.method, source);
                let rejected = ResponseBuilder::new(501).build_for_request(&request);
                if let Ok(response) = rejected {
                    if let Err(e) = self.transmit(response.to_bytes(), source).await {
                        warn!("Failed to send 501: {}", e);
                    }
                }
                return;
            }
        };

        if method == SipMethod::Ack {
            if let Some(id) = incoming_dialog_id(&request) {
                if let Some(dialog) = self.state.lock().await.dialogs.get_mut(&id) {
                    dialog.state = DialogState::Confirmed;
                }
            }
            self.emit(EngineEvent::Request {
                request,
                transaction: None,
            })
            .await;
            return;
        }

        let transaction = ServerTransaction::new(request.clone(), source);
        let key = (transaction.id.clone(), method);

        let replay = {
            let mut state = self.state.lock().await;
            match state.servers.get(&key) {
                Some(entry) => Some((entry.last_response.clone(), entry.transaction.source)),
                None => {
                    state.servers.insert(
                        key.clone(),
                        ServerEntry {
                            transaction: transaction.clone(),
                            last_response: None,
                        },
                    );
                    None
                }
            }
        };

        if let Some((last_response, destination)) = replay {
            debug!("Retransmitted {} from {}", method, source);
            if let Some(response) = last_response {
                if let Err(e) = self.transmit(response.to_bytes(), destination).await {
                    warn!("Failed to replay response: {}", e);
                }
            }
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            inner.expire_server(key).await;
        });

        let terminated = match (method, incoming_dialog_id(&request)) {
            (SipMethod::Bye, Some(id)) => self.terminate_dialog(&id).await,
            _ => None,
        };

        self.emit(EngineEvent::Request {
            request,
            transaction: Some(transaction),
        })
        .await;

        if let Some(dialog) = terminated {
            self.emit(EngineEvent::DialogTerminated { dialog }).await;
        }
    }

    async fn handle_response(self: &Arc<Self>, response: SipResponse) {
        let Some(branch) = response.via_branch() else {
            warn!("Response without Via branch dropped");
            return;
        };
        let id = TransactionId::from_branch(&branch);
        let method = response.cseq().map(|(_, method)| method);
        let status = response.status_code();

        let mut state = self.state.lock().await;
        let found = state.clients.get_mut(&id).map(|entry| {
            entry.responded = true;
            entry.transaction.clone()
        });
        let transaction = match found {
            Some(transaction) => transaction,
            None => {
                drop(state);
                // a retransmitted 2xx means our ACK was lost
                if method == Some(SipMethod::Invite) && (200..300).contains(&status) {
                    if let Some(dialog) = response_dialog_id(&response) {
                        if let Err(e) = self.send_ack(&dialog).await {
                            debug!("Cannot re-ACK {}: {}", dialog, e);
                        }
                    }
                } else {
                    debug!("Stray {} response for {}", status, id);
                }
                return;
            }
        };

        if status >= 200 {
            state.clients.remove(&id);
        }

        let mut dialog = None;
        let mut ended = None;
        if method == Some(SipMethod::Invite) && status > 100 && status < 300 {
            if let Some(created) = Dialog::from_response(&transaction.request, &response) {
                let dialog_id = created.id.clone();
                state
                    .dialogs
                    .entry(dialog_id.clone())
                    .and_modify(|existing| {
                        if status >= 200 {
                            existing.state = DialogState::Confirmed;
                            existing.remote_target = created.remote_target.clone();
                        }
                    })
                    .or_insert(created);
                state
                    .dialog_by_txn
                    .insert(transaction.id.clone(), dialog_id.clone());
                dialog = Some(dialog_id);
            }
        } else if let Some(dialog_id) = state.dialog_by_txn.get(&transaction.id).cloned() {
            // a failed INVITE takes its early dialog with it
            let ends_dialog = match method {
                Some(SipMethod::Bye) => status >= 200,
                Some(SipMethod::Invite) => status >= 300,
                _ => false,
            };
            if ends_dialog {
                ended = Some(dialog_id.clone());
            }
            dialog = Some(dialog_id);
        }
        drop(state);

        if method == Some(SipMethod::Invite) && status >= 300 {
            match build_failure_ack(&transaction.request, &response) {
                Ok(ack) => {
                    let sent = match self.proxy_addr().await {
                        Ok(destination) => self.transmit(ack.to_bytes(), destination).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!("Failed to ACK {} response: {}", status, e);
                    }
                }
                Err(e) => warn!("Cannot build ACK for {} response: {}", status, e),
            }
        }

        let terminated = match ended {
            Some(id) => self.terminate_dialog(&id).await,
            None => None,
        };

        self.emit(EngineEvent::Response {
            response,
            transaction: Some(transaction),
            dialog,
        })
        .await;

        if let Some(dialog) = terminated {
            self.emit(EngineEvent::DialogTerminated { dialog }).await;
        }
        if status >= 200 {
            self.emit(EngineEvent::TransactionTerminated { transaction: id })
                .await;
        }
    }

    async fn send_ack(&self, dialog: &DialogId) -> Result<(), SipError> {
        let via = self.via().await?;
        let ack = {
            let mut state = self.state.lock().await;
            let entry = state
                .dialogs
                .get_mut(dialog)
                .ok_or_else(|| SipError::TransactionError(format!("Unknown dialog {}", dialog)))?;
            entry.state = DialogState::Confirmed;
            entry.create_request(SipMethod::Ack, &via)?
        };

        let destination = self.proxy_addr().await?;
        self.transmit(ack.to_bytes(), destination).await
    }

    async fn shutdown_transport(&self) -> Result<(), SipError> {
        let (transport, pump) = {
            let mut state = self.state.lock().await;
            state.events = None;
            state.endpoint = None;
            state.local_addr = None;
            state.clients.clear();
            state.servers.clear();
            (state.transport.take(), state.pump.take())
        };

        if let Some(pump) = pump {
            pump.abort();
        }
        match transport {
            Some(transport) => transport.stop().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SipEngine for UdpEngine {
    async fn listen(
        &self,
        endpoint: ListenEndpoint,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<(), SipError> {
        if endpoint.transport != TransportProtocol::Udp {
            return Err(SipError::TransportError(format!(
                "{} transport is not supported",
                endpoint.transport
            )));
        }

        let mut state = self.inner.state.lock().await;
        if state.transport.is_some() {
            return Err(SipError::TransportError("Already listening".to_string()));
        }

        let ip = if endpoint.ip.is_empty() {
            "0.0.0.0"
        } else {
            endpoint.ip.as_str()
        };
        let bind_addr: SocketAddr = format!("{}:{}", ip, endpoint.port)
            .parse()
            .map_err(|e| SipError::TransportError(format!("Invalid listen address: {}", e)))?;

        let mut transport = UdpTransport::new(bind_addr);
        let mut incoming = transport.start().await?;
        state.local_addr = transport.local_addr();
        state.transport = Some(Arc::new(transport));
        state.events = Some(events);
        state.endpoint = Some(endpoint);

        let inner = self.inner.clone();
        state.pump = Some(tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                inner.handle_incoming(message).await;
            }
        }));

        info!(
            "Engine listening on {:?}, outbound proxy {}",
            state.local_addr, self.inner.outbound_proxy
        );
        Ok(())
    }

    async fn unlisten(&self) -> Result<(), SipError> {
        self.inner.shutdown_transport().await
    }

    async fn stop(&self) -> Result<(), SipError> {
        self.inner.shutdown_transport().await?;
        let mut state = self.inner.state.lock().await;
        state.dialogs.clear();
        state.dialog_by_txn.clear();
        info!("Engine stopped");
        Ok(())
    }

    async fn send_request(&self, request: SipRequest) -> Result<ClientTransaction, SipError> {
        self.inner.start_client(request, None).await
    }

    async fn server_transaction(&self, request: &SipRequest) -> Result<ServerTransaction, SipError> {
        let method = request
            .method()
            .ok_or_else(|| SipError::InvalidMessage("Unsupported method".to_string()))?;
        let branch = request
            .via_branch()
            .ok_or_else(|| SipError::InvalidMessage("Request without Via branch".to_string()))?;
        let key = (TransactionId::from_branch(&branch), method);

        if let Some(entry) = self.inner.state.lock().await.servers.get(&key) {
            return Ok(entry.transaction.clone());
        }

        let source = self.inner.proxy_addr().await?;
        let transaction = ServerTransaction::new(request.clone(), source);
        self.inner.state.lock().await.servers.insert(
            key,
            ServerEntry {
                transaction: transaction.clone(),
                last_response: None,
            },
        );
        Ok(transaction)
    }

    async fn send_response(
        &self,
        transaction: &ServerTransaction,
        response: SipResponse,
    ) -> Result<(), SipError> {
        self.inner
            .transmit(response.to_bytes(), transaction.source)
            .await?;

        let status = response.status_code();
        let method = transaction.method();
        let mut state = self.inner.state.lock().await;

        if let Some(method) = method {
            if let Some(entry) = state.servers.get_mut(&(transaction.id.clone(), method)) {
                entry.last_response = Some(response.clone());
            }
        }

        if method == Some(SipMethod::Invite) && status > 100 && status < 300 {
            if let Some(tag) = response.to_tag() {
                if let Some(mut created) = Dialog::from_request(&transaction.request, &tag) {
                    let dialog_id = created.id.clone();
                    if status >= 200 {
                        created.state = DialogState::Confirmed;
                    }
                    state
                        .dialogs
                        .entry(dialog_id.clone())
                        .and_modify(|existing| {
                            if status >= 200 {
                                existing.state = DialogState::Confirmed;
                            }
                        })
                        .or_insert(created);
                    state.dialog_by_txn.insert(transaction.id.clone(), dialog_id);
                }
            }
        }

        let failed = if method == Some(SipMethod::Invite) && status >= 300 {
            state.dialog_by_txn.get(&transaction.id).cloned()
        } else {
            None
        };
        drop(state);

        if let Some(dialog) = failed {
            if let Some(dialog) = self.inner.terminate_dialog(&dialog).await {
                self.inner
                    .emit(EngineEvent::DialogTerminated { dialog })
                    .await;
            }
        }

        Ok(())
    }

    async fn create_dialog_request(
        &self,
        dialog: &DialogId,
        method: SipMethod,
    ) -> Result<SipRequest, SipError> {
        let via = self.inner.via().await?;
        let mut state = self.inner.state.lock().await;
        state
            .dialogs
            .get_mut(dialog)
            .ok_or_else(|| SipError::TransactionError(format!("Unknown dialog {}", dialog)))?
            .create_request(method, &via)
    }

    async fn send_on_dialog(
        &self,
        dialog: &DialogId,
        request: SipRequest,
    ) -> Result<ClientTransaction, SipError> {
        self.inner.start_client(request, Some(dialog.clone())).await
    }

    async fn send_ack(&self, dialog: &DialogId) -> Result<(), SipError> {
        self.inner.send_ack(dialog).await
    }

    async fn create_cancel(&self, transaction: &ClientTransaction) -> Result<SipRequest, SipError> {
        build_cancel(&transaction.request)
    }

    async fn dialog_of(&self, transaction: &TransactionId) -> Option<DialogId> {
        self.inner
            .state
            .lock()
            .await
            .dialog_by_txn
            .get(transaction)
            .cloned()
    }

    async fn dialog_state(&self, dialog: &DialogId) -> Option<DialogState> {
        self.inner
            .state
            .lock()
            .await
            .dialogs
            .get(dialog)
            .map(|d| d.state)
    }
}
