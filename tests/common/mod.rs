//! Shared fixtures for agent scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use rsip::Header;
use sipua::application::{Collaborators, SipAgent, SipEventListener};
use sipua::config::AgentConfig;
use sipua::domain::{IdentityProfile, SipEvent, SipEventType};
use sipua::infrastructure::protocols::sip::builder::{build_cancel, RequestBuilder, ResponseBuilder};
use sipua::infrastructure::protocols::sip::sdp::build_answer;
use sipua::infrastructure::protocols::sip::{
    ClientTransaction, DialogId, DialogState, EngineEvent, HeaderAccess, ListenEndpoint,
    ServerTransaction, SipEngine, SipError, SipMethod, SipRequest, SipResponse, TransactionId,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const LOCAL_IP: &str = "192.168.1.20";
pub const REGISTRAR: &str = "10.0.0.1";

pub fn peer_addr() -> SocketAddr {
    "10.0.0.9:5060".parse().unwrap()
}

/// In-memory engine recording everything the agent asks of it
#[derive(Default)]
pub struct RecordingEngine {
    /// Requests sent statefully or on a dialog, in order
    pub requests: Mutex<Vec<SipRequest>>,
    pub responses: Mutex<Vec<(TransactionId, SipResponse)>>,
    pub acks: Mutex<Vec<DialogId>>,
    pub dialog_requests: Mutex<Vec<(DialogId, SipMethod)>>,
    pub listens: Mutex<Vec<ListenEndpoint>>,
    pub unlistens: AtomicUsize,
    pub stops: AtomicUsize,
    /// Dialog created by a transaction, as `dialog_of` reports it
    pub dialogs: Mutex<HashMap<TransactionId, DialogId>>,
    pub dialog_states: Mutex<HashMap<DialogId, DialogState>>,
    events: Mutex<Option<mpsc::Sender<EngineEvent>>>,
}

impl RecordingEngine {
    pub fn requests(&self) -> Vec<SipRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_of(&self, method: SipMethod) -> Vec<SipRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method() == Some(method))
            .collect()
    }

    pub fn statuses(&self) -> Vec<u16> {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.status_code())
            .collect()
    }

    pub fn responses_on(&self, transaction: &TransactionId) -> Vec<SipResponse> {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == transaction)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn set_dialog(&self, transaction: &TransactionId, dialog: &DialogId, state: DialogState) {
        self.dialogs
            .lock()
            .unwrap()
            .insert(transaction.clone(), dialog.clone());
        self.dialog_states
            .lock()
            .unwrap()
            .insert(dialog.clone(), state);
    }

    pub fn is_listening(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }
}

#[async_trait]
impl SipEngine for RecordingEngine {
    async fn listen(
        &self,
        endpoint: ListenEndpoint,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<(), SipError> {
        self.listens.lock().unwrap().push(endpoint);
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn unlisten(&self) -> Result<(), SipError> {
        self.unlistens.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().take();
        Ok(())
    }

    async fn stop(&self) -> Result<(), SipError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().take();
        Ok(())
    }

    async fn send_request(&self, request: SipRequest) -> Result<ClientTransaction, SipError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(ClientTransaction::new(request))
    }

    async fn server_transaction(&self, request: &SipRequest) -> Result<ServerTransaction, SipError> {
        Ok(ServerTransaction::new(request.clone(), peer_addr()))
    }

    async fn send_response(
        &self,
        transaction: &ServerTransaction,
        response: SipResponse,
    ) -> Result<(), SipError> {
        self.responses
            .lock()
            .unwrap()
            .push((transaction.id.clone(), response));
        Ok(())
    }

    async fn create_dialog_request(
        &self,
        dialog: &DialogId,
        method: SipMethod,
    ) -> Result<SipRequest, SipError> {
        self.dialog_requests
            .lock()
            .unwrap()
            .push((dialog.clone(), method));
        RequestBuilder::new(method, "sip:bob@10.0.0.9:5060")
            .header("Via", "SIP/2.0/UDP 192.168.1.20:5070;rport;branch=z9hG4bKdialog")
            .header("From", format!("<sip:alice@{}>;tag={}", REGISTRAR, dialog.local_tag))
            .header("To", format!("<sip:bob@{}>;tag={}", REGISTRAR, dialog.remote_tag))
            .header("Call-ID", dialog.call_id.clone())
            .header("CSeq", format!("2 {}", method))
            .build()
    }

    async fn send_on_dialog(
        &self,
        _dialog: &DialogId,
        request: SipRequest,
    ) -> Result<ClientTransaction, SipError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(ClientTransaction::new(request))
    }

    async fn send_ack(&self, dialog: &DialogId) -> Result<(), SipError> {
        self.acks.lock().unwrap().push(dialog.clone());
        Ok(())
    }

    async fn create_cancel(&self, transaction: &ClientTransaction) -> Result<SipRequest, SipError> {
        build_cancel(&transaction.request)
    }

    async fn dialog_of(&self, transaction: &TransactionId) -> Option<DialogId> {
        self.dialogs.lock().unwrap().get(transaction).cloned()
    }

    async fn dialog_state(&self, dialog: &DialogId) -> Option<DialogState> {
        self.dialog_states.lock().unwrap().get(dialog).copied()
    }
}

/// Listener keeping every event it sees
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<SipEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<SipEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<SipEventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

impl SipEventListener for EventLog {
    fn on_sip_event(&self, event: &SipEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn profile() -> IdentityProfile {
    IdentityProfile::new("alice", "secret", REGISTRAR, 5060).with_local_port(5070)
}

/// Collaborators handing out `engine`, plus a count of engines created
pub fn collaborators(engine: Arc<RecordingEngine>) -> (Collaborators, Arc<AtomicUsize>) {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let factory = move |_: &IdentityProfile| -> Result<Arc<dyn SipEngine>, SipError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let engine: Arc<dyn SipEngine> = engine.clone();
        Ok(engine)
    };
    let collaborators = Collaborators::new(Arc::new(factory)).with_local_ip(|| LOCAL_IP.to_string());
    (collaborators, created)
}

/// Initialized, bound agent with an event log attached
pub async fn start_with(collaborators: Collaborators) -> (SipAgent, Arc<EventLog>) {
    let agent = SipAgent::new(profile(), AgentConfig::default(), collaborators);
    let log = Arc::new(EventLog::default());
    agent.add_listener(log.clone());
    agent.initialize(true).await.unwrap();
    (agent, log)
}

pub async fn started_agent() -> (SipAgent, Arc<RecordingEngine>, Arc<EventLog>) {
    let engine = Arc::new(RecordingEngine::default());
    let (collaborators, _) = collaborators(engine.clone());
    let (agent, log) = start_with(collaborators).await;
    (agent, engine, log)
}

pub fn peer_sdp(port: u16) -> String {
    build_answer("10.0.0.9", port)
}

/// INVITE from bob with an audio offer on `rtp_port`
pub fn incoming_invite(call_id: &str, rtp_port: u16) -> SipRequest {
    RequestBuilder::new(SipMethod::Invite, format!("sip:alice@{}:5070", LOCAL_IP))
        .header("Via", format!("SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bK{}", call_id))
        .header("Max-Forwards", "70")
        .header("From", "<sip:bob@10.0.0.1>;tag=bobtag")
        .header("To", "<sip:alice@10.0.0.1>")
        .header("Call-ID", call_id)
        .header("CSeq", "1 INVITE")
        .header("Contact", "<sip:bob@10.0.0.9:5060>")
        .body("application/sdp", peer_sdp(rtp_port))
        .build()
        .unwrap()
}

/// In-dialog or out-of-dialog request from bob
pub fn incoming_request(method: SipMethod, call_id: &str, branch: &str, body: Option<&str>) -> SipRequest {
    let builder = RequestBuilder::new(method, format!("sip:alice@{}:5070", LOCAL_IP))
        .header("Via", format!("SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bK{}", branch))
        .header("Max-Forwards", "70")
        .header("From", "<sip:bob@10.0.0.1>;tag=bobtag")
        .header("To", "<sip:alice@10.0.0.1>;tag=alicetag")
        .header("Call-ID", call_id)
        .header("CSeq", format!("2 {}", method));
    match body {
        Some(text) => builder.body("text/plain", text).build().unwrap(),
        None => builder.build().unwrap(),
    }
}

/// Peer response to one of our requests
pub fn response_to(request: &SipRequest, status: u16, sdp: Option<String>) -> SipResponse {
    let mut builder = ResponseBuilder::new(status).to_tag("bobtag");
    if let Some(sdp) = sdp {
        builder = builder.sdp(sdp);
    }
    builder.build_for_request(request).unwrap()
}

pub fn digest_challenge(request: &SipRequest) -> SipResponse {
    ResponseBuilder::new(401)
        .to_tag("regtag")
        .header(Header::Other(
            "WWW-Authenticate".to_string(),
            "Digest realm=\"example.com\", nonce=\"5f1c\", algorithm=MD5".to_string(),
        ))
        .build_for_request(request)
        .unwrap()
}

/// Dialog the peer's response would create for our request
pub fn client_dialog(request: &SipRequest) -> DialogId {
    DialogId {
        call_id: request.call_id().unwrap(),
        local_tag: request.from_tag().unwrap(),
        remote_tag: "bobtag".to_string(),
    }
}

pub fn response_event(response: SipResponse, request: &SipRequest, dialog: Option<DialogId>) -> EngineEvent {
    EngineEvent::Response {
        response,
        transaction: Some(ClientTransaction::new(request.clone())),
        dialog,
    }
}

pub fn request_event(request: SipRequest, transaction: Option<ServerTransaction>) -> EngineEvent {
    EngineEvent::Request {
        request,
        transaction,
    }
}
