//! Call and registration state machine
//!
//! [`SipAgent`] is the single authority over the agent's lifecycle state, the
//! call direction and the handles of the one active call. Engine callbacks
//! arrive on a delivery task and are processed there in order; application
//! actions queue their sends on the [`OutboundQueue`] and return at once.
//!
//! Lock discipline: no lock on call state is held while awaiting the
//! engine, and events are dispatched only after every lock is released.

use super::dispatcher::{EventDispatcher, SipEventListener};
use super::metrics;
use super::outbound::OutboundQueue;
use crate::config::AgentConfig;
use crate::domain::{
    AgentState, AuthRetryTracker, CallDirection, IdentityProfile, Result, SipEvent, SipEventType,
    UaError, MAX_REGISTER_ATTEMPTS,
};
use crate::infrastructure::protocols::sip::builder::{self, InviteBody, ResponseBuilder};
use crate::infrastructure::protocols::sip::network::discover_local_ip;
use crate::infrastructure::protocols::sip::sdp;
use crate::infrastructure::protocols::sip::{
    ChallengeHandler, ClientTransaction, DialogId, DialogState, DigestChallengeHandler,
    EngineEvent, EngineFactory, HeaderAccess, ListenEndpoint, ServerTransaction, SipEngine,
    SipError, SipMethod, SipRequest, SipResponse, UserCredentials,
};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

const TRYING: u16 = 100;
const RINGING: u16 = 180;
const OK: u16 = 200;
const UNAUTHORIZED: u16 = 401;
const PROXY_AUTHENTICATION_REQUIRED: u16 = 407;
const TEMPORARILY_UNAVAILABLE: u16 = 480;
const BUSY_HERE: u16 = 486;
const REQUEST_TERMINATED: u16 = 487;
const NOT_IMPLEMENTED: u16 = 501;
const SERVICE_UNAVAILABLE: u16 = 503;
const DECLINE: u16 = 603;

/// Engine callbacks buffered between the engine and the delivery task
const EVENT_QUEUE_DEPTH: usize = 256;

/// Resolves the address the agent advertises after (re)binding
pub type LocalIpResolver = Arc<dyn Fn() -> String + Send + Sync>;

/// Everything the agent talks to but does not own the logic of
#[derive(Clone)]
pub struct Collaborators {
    pub engines: Arc<dyn EngineFactory>,
    pub authenticator: Arc<dyn ChallengeHandler>,
    pub local_ip: LocalIpResolver,
}

impl Collaborators {
    /// Digest authentication and interface discovery, engines from `engines`
    pub fn new(engines: Arc<dyn EngineFactory>) -> Self {
        Self {
            engines,
            authenticator: Arc::new(DigestChallengeHandler::new()),
            local_ip: Arc::new(discover_local_ip),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn ChallengeHandler>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_local_ip(mut self, resolver: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.local_ip = Arc::new(resolver);
        self
    }
}

/// State of the single active call
struct CallContext {
    state: AgentState,
    direction: CallDirection,
    client: Option<ClientTransaction>,
    server: Option<ServerTransaction>,
    dialog: Option<DialogId>,
    remote_rtp_port: Option<u16>,
}

impl CallContext {
    fn new() -> Self {
        Self {
            state: AgentState::Registering,
            direction: CallDirection::None,
            client: None,
            server: None,
            dialog: None,
            remote_rtp_port: None,
        }
    }

    fn clear_handles(&mut self) {
        self.client = None;
        self.server = None;
        self.dialog = None;
        self.remote_rtp_port = None;
    }

    /// Start tracking a new call, forgetting the previous one
    fn begin(&mut self, state: AgentState, direction: CallDirection) {
        self.clear_handles();
        self.state = state;
        self.direction = direction;
    }

    /// The call is over, whichever side ended it
    fn end_call(&mut self) {
        self.clear_handles();
        self.state = AgentState::Idle;
        self.direction = CallDirection::None;
    }

    fn tracks_server_call(&self, call_id: Option<&str>) -> bool {
        match (&self.server, call_id) {
            (Some(server), Some(call_id)) => server.request.call_id().as_deref() == Some(call_id),
            _ => false,
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    bound: bool,
    /// Registrar the current engine was created for
    registrar: String,
}

struct AgentInner {
    config: AgentConfig,
    collaborators: Collaborators,
    profile: RwLock<IdentityProfile>,
    engine: RwLock<Option<Arc<dyn SipEngine>>>,
    lifecycle: Mutex<Lifecycle>,
    initialized: AtomicBool,
    call: Mutex<CallContext>,
    retries: Mutex<AuthRetryTracker>,
    dispatcher: EventDispatcher,
    outbound: OutboundQueue,
}

/// SIP user agent for one identity and at most one call
#[derive(Clone)]
pub struct SipAgent {
    inner: Arc<AgentInner>,
}

impl SipAgent {
    /// Create an agent in the `Registering` state.
    ///
    /// Nothing touches the network until [`SipAgent::initialize`]. Must be
    /// called from within a Tokio runtime.
    pub fn new(profile: IdentityProfile, config: AgentConfig, collaborators: Collaborators) -> Self {
        let outbound = OutboundQueue::new(config.outbound_queue_capacity);
        Self {
            inner: Arc::new(AgentInner {
                config,
                collaborators,
                profile: RwLock::new(profile),
                engine: RwLock::new(None),
                lifecycle: Mutex::new(Lifecycle::default()),
                initialized: AtomicBool::new(false),
                call: Mutex::new(CallContext::new()),
                retries: Mutex::new(AuthRetryTracker::new()),
                dispatcher: EventDispatcher::new(),
                outbound,
            }),
        }
    }

    // ---- lifecycle ----

    /// Create a fresh engine for the current profile and, with
    /// `connectivity`, bind it. Ends in `Ready`.
    pub async fn initialize(&self, connectivity: bool) -> Result<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;

        inner.call.lock().await.state = AgentState::Registering;

        inner.unbind_locked(&mut lifecycle).await;
        let previous = inner.engine.write().await.take();
        if let Some(previous) = previous {
            if let Err(e) = previous.stop().await {
                warn!("Failed to stop previous engine: {}", e);
            }
        }

        let profile = inner.profile.read().await.clone();
        let engine = inner.collaborators.engines.create(&profile)?;
        *inner.engine.write().await = Some(engine);
        lifecycle.registrar = profile.remote_ip.clone();

        if connectivity {
            inner.bind_locked(&mut lifecycle).await?;
        }

        inner.initialized.store(true, Ordering::SeqCst);
        inner.call.lock().await.state = AgentState::Ready;
        info!(
            "SIP stack initialized for {} via {}",
            profile.address_of_record(),
            profile.remote_endpoint()
        );
        Ok(())
    }

    /// Open the listening endpoint on the current interface. No-op when bound.
    pub async fn bind(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.bind_locked(&mut lifecycle).await
    }

    /// Close the listening endpoint. No-op when not bound.
    pub async fn unbind(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.unbind_locked(&mut lifecycle).await;
    }

    /// Unbind and stop the engine. Idempotent once `StackStopped`.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        if inner.call.lock().await.state == AgentState::StackStopped {
            return;
        }

        inner.unbind_locked(&mut lifecycle).await;
        let engine = inner.engine.write().await.take();
        if let Some(engine) = engine {
            if let Err(e) = engine.stop().await {
                warn!("Failed to stop engine: {}", e);
            }
        }
        inner.initialized.store(false, Ordering::SeqCst);

        let mut call = inner.call.lock().await;
        call.clear_handles();
        call.direction = CallDirection::None;
        call.state = AgentState::StackStopped;
        info!("SIP stack stopped");
    }

    /// Move the registration to a new network interface.
    ///
    /// The old contact is captured before unbinding so it can be
    /// unregistered over the new binding before the new contact registers.
    pub async fn refresh_networking(&self, expiry: u32) -> Result<()> {
        let old_contact = self.contact_address().await;
        info!("Refreshing networking, old contact {}", old_contact);

        self.unbind().await;
        self.bind().await?;

        self.unregister(&old_contact).await?;
        self.register(expiry).await
    }

    // ---- registration ----

    /// Register the current contact. Silently skipped while unbound.
    pub async fn register(&self, expiry: u32) -> Result<()> {
        if !self.ensure_registrar().await? {
            return Ok(());
        }
        self.inner.send_register(expiry, None, "register").await;
        Ok(())
    }

    /// Remove `contact` from the registrar
    pub async fn unregister(&self, contact: &str) -> Result<()> {
        if !self.ensure_registrar().await? {
            return Ok(());
        }
        self.inner.send_register(0, Some(contact), "unregister").await;
        Ok(())
    }

    /// Reinitialize when the profile now names another registrar. Returns
    /// whether a REGISTER may be sent.
    async fn ensure_registrar(&self) -> Result<bool> {
        let (bound, registrar) = {
            let lifecycle = self.inner.lifecycle.lock().await;
            (lifecycle.bound, lifecycle.registrar.clone())
        };
        if !bound {
            debug!("Not bound, skipping REGISTER");
            return Ok(false);
        }

        let current = self.inner.profile.read().await.remote_ip.clone();
        if current == registrar {
            return Ok(true);
        }
        if !self.is_initialized() {
            return Ok(false);
        }

        info!("Registrar changed from {} to {}, reinitializing stack", registrar, current);
        self.shutdown().await;
        self.initialize(true).await?;
        Ok(true)
    }

    // ---- outgoing calls ----

    /// Place a call offering a locally built audio description on `local_rtp_port`
    pub async fn call(&self, to: &str, local_rtp_port: u16, headers: &[(String, String)]) -> Result<()> {
        self.place_call(
            to,
            InviteBody::Audio {
                local_port: local_rtp_port,
            },
            headers,
        )
        .await
    }

    /// Place a call with a caller-supplied offer, sent verbatim
    pub async fn call_with_offer(&self, to: &str, sdp: &str, headers: &[(String, String)]) -> Result<()> {
        self.place_call(to, InviteBody::Offer(sdp.to_string()), headers)
            .await
    }

    async fn place_call(&self, to: &str, body: InviteBody, headers: &[(String, String)]) -> Result<()> {
        let engine = self.inner.require_engine().await?;

        let profile = self.inner.profile.read().await.clone();
        let invite = match builder::build_invite(&profile, to, &body, headers, &self.inner.config.user_agent) {
            Ok(invite) => invite,
            Err(e) => {
                error!("Cannot build INVITE to {}: {}", to, e);
                metrics::record_send_failure("invite");
                return Ok(());
            }
        };

        {
            let mut call = self.inner.call.lock().await;
            if call.state.in_call() {
                warn!("Already in a call ({}), not calling {}", call.state.name(), to);
                return Ok(());
            }
            call.begin(AgentState::Calling, CallDirection::Outgoing);
        }
        metrics::record_call("outgoing");
        info!("Calling {}", to);

        let inner = self.inner.clone();
        self.inner
            .outbound
            .submit(
                "invite",
                async move {
                    let transaction = engine.send_request(invite).await?;
                    let mut call = inner.call.lock().await;
                    // an authenticated retry may already have replaced it
                    if call.direction == CallDirection::Outgoing && call.client.is_none() {
                        call.client = Some(transaction);
                    }
                    Ok(())
                }
                .boxed(),
            )
            .await;
        Ok(())
    }

    /// Send BYE for the active call on the transaction matching its direction.
    ///
    /// An incoming call that was never answered has no dialog to end; it is
    /// declined instead.
    pub async fn hangup(&self) -> Result<()> {
        let engine = self.inner.require_engine().await?;
        if self.state().await == AgentState::Incoming {
            return self.reject_call().await;
        }

        let (transaction, known_dialog) = {
            let mut call = self.inner.call.lock().await;
            let transaction = match call.direction {
                CallDirection::Outgoing => call.client.as_ref().map(|t| t.id.clone()),
                CallDirection::Incoming => call.server.as_ref().map(|t| t.id.clone()),
                CallDirection::None => None,
            };
            if transaction.is_some() {
                call.direction = CallDirection::None;
            }
            (transaction, call.dialog.clone())
        };
        let Some(transaction) = transaction else {
            debug!("No active call to hang up");
            return Ok(());
        };

        info!("Hanging up call on transaction {}", transaction);
        self.inner
            .outbound
            .submit(
                "bye",
                async move {
                    let dialog = match engine.dialog_of(&transaction).await.or(known_dialog) {
                        Some(dialog) => dialog,
                        None => {
                            warn!("Dialog of {} already terminated, not sending BYE", transaction);
                            return Ok(());
                        }
                    };
                    let bye = engine.create_dialog_request(&dialog, SipMethod::Bye).await?;
                    engine.send_on_dialog(&dialog, bye).await?;
                    Ok(())
                }
                .boxed(),
            )
            .await;
        Ok(())
    }

    /// Abort an outgoing call that has not been answered
    pub async fn cancel(&self) -> Result<()> {
        let engine = self.inner.require_engine().await?;

        let transaction = {
            let mut call = self.inner.call.lock().await;
            if call.direction != CallDirection::Outgoing {
                return Ok(());
            }
            let Some(transaction) = call.client.take() else {
                return Ok(());
            };
            // the dialog stays known until the CANCEL completes
            call.server = None;
            call.remote_rtp_port = None;
            call.state = AgentState::Idle;
            call.direction = CallDirection::None;
            transaction
        };

        info!("Cancelling INVITE {}", transaction.id);
        self.inner
            .outbound
            .submit(
                "cancel",
                async move {
                    let cancel = engine.create_cancel(&transaction).await?;
                    engine.send_request(cancel).await?;
                    Ok(())
                }
                .boxed(),
            )
            .await;
        Ok(())
    }

    // ---- incoming calls ----

    /// Answer the offered call with a locally built audio description
    pub async fn accept_call(&self, local_rtp_port: u16) -> Result<()> {
        let local_ip = self.inner.profile.read().await.local_ip.clone();
        self.answer(sdp::build_answer(&local_ip, local_rtp_port))
            .await
    }

    /// Answer the offered call with a caller-supplied description, sent verbatim
    pub async fn accept_call_with_answer(&self, sdp: &str) -> Result<()> {
        self.answer(sdp.to_string()).await
    }

    async fn answer(&self, answer: String) -> Result<()> {
        let engine = self.inner.require_engine().await?;

        let (transaction, remote_port) = {
            let mut call = self.inner.call.lock().await;
            if call.state != AgentState::Incoming {
                warn!("No incoming call to accept ({})", call.state.name());
                return Ok(());
            }
            let Some(transaction) = call.server.clone() else {
                warn!("No incoming call to accept");
                return Ok(());
            };
            call.state = AgentState::Established;
            (transaction, call.remote_rtp_port)
        };
        let contact = self.contact_address().await;

        let inner = self.inner.clone();
        self.inner
            .outbound
            .submit(
                "answer",
                async move {
                    let response = ResponseBuilder::ok()
                        .to_tag(transaction.local_tag.clone())
                        .contact(&contact)
                        .sdp(answer)
                        .build_for_request(&transaction.request)?;
                    engine.send_response(&transaction, response).await?;

                    let mut event = SipEvent::new(SipEventType::CallConnected)
                        .with_from(transaction.request.from_address());
                    if let Some(port) = remote_port {
                        event = event.with_rtp_port(port);
                    }
                    inner.dispatcher.dispatch(&event);
                    Ok(())
                }
                .boxed(),
            )
            .await;
        Ok(())
    }

    /// Decline the offered call
    pub async fn reject_call(&self) -> Result<()> {
        let engine = self.inner.require_engine().await?;

        let transaction = {
            let mut call = self.inner.call.lock().await;
            if call.state != AgentState::Incoming {
                debug!("No incoming call to reject");
                return Ok(());
            }
            let transaction = call.server.take();
            call.end_call();
            transaction
        };
        let Some(transaction) = transaction else {
            return Ok(());
        };

        info!("Declining call from {}", transaction.request.from_address());
        self.inner
            .outbound
            .submit(
                "decline",
                async move {
                    let response = ResponseBuilder::new(DECLINE)
                        .to_tag(transaction.local_tag.clone())
                        .build_for_request(&transaction.request)?;
                    engine.send_response(&transaction, response).await
                }
                .boxed(),
            )
            .await;
        Ok(())
    }

    // ---- messaging ----

    /// Send an out-of-dialog instant message
    pub async fn send_message(&self, to: &str, text: &str) -> Result<()> {
        let engine = self.inner.require_engine().await?;
        let profile = self.inner.profile.read().await.clone();

        match builder::build_message(&profile, to, text, &self.inner.config.user_agent) {
            Ok(request) => {
                self.inner
                    .outbound
                    .submit(
                        "message",
                        async move { engine.send_request(request).await.map(|_| ()) }.boxed(),
                    )
                    .await;
            }
            Err(e) => {
                error!("Cannot build MESSAGE to {}: {}", to, e);
                metrics::record_send_failure("message");
            }
        }
        Ok(())
    }

    /// Reserved. Only checks that the stack is initialized.
    pub async fn send_dtmf(&self, digit: &str) -> Result<()> {
        self.inner.require_engine().await?;
        debug!("DTMF digit {} not sent, DTMF signalling is not supported", digit);
        Ok(())
    }

    // ---- listeners and accessors ----

    pub fn add_listener(&self, listener: Arc<dyn SipEventListener>) -> bool {
        self.inner.dispatcher.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SipEventListener>) -> bool {
        self.inner.dispatcher.remove(listener)
    }

    pub async fn state(&self) -> AgentState {
        self.inner.call.lock().await.state
    }

    pub async fn direction(&self) -> CallDirection {
        self.inner.call.lock().await.direction
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub async fn is_bound(&self) -> bool {
        self.inner.lifecycle.lock().await.bound
    }

    /// Authenticated re-sends recorded for `call_id`
    pub async fn auth_attempts(&self, call_id: &str) -> u32 {
        self.inner.retries.lock().await.attempts(call_id)
    }

    /// Media port of the peer's last offer or answer
    pub async fn remote_rtp_port(&self) -> Option<u16> {
        self.inner.call.lock().await.remote_rtp_port
    }

    pub async fn profile(&self) -> IdentityProfile {
        self.inner.profile.read().await.clone()
    }

    /// Replace the profile. A changed registrar takes effect on the next
    /// [`SipAgent::register`], which reinitializes the stack.
    pub async fn set_profile(&self, profile: IdentityProfile) {
        *self.inner.profile.write().await = profile;
    }

    /// Contact address for the current binding
    pub async fn contact_address(&self) -> String {
        builder::contact_address(&*self.inner.profile.read().await)
    }

    /// Wait until every send queued so far has run
    pub async fn flush(&self) {
        self.inner.outbound.flush().await;
    }

    /// Feed one engine callback through the state machine.
    ///
    /// The delivery task calls this for every event the engine emits.
    pub async fn process_event(&self, event: EngineEvent) {
        self.inner.process_event(event).await;
    }
}

impl AgentInner {
    async fn current_engine(&self) -> Option<Arc<dyn SipEngine>> {
        self.engine.read().await.clone()
    }

    async fn require_engine(&self) -> Result<Arc<dyn SipEngine>> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(UaError::NotInitialized);
        }
        self.current_engine().await.ok_or(UaError::NotInitialized)
    }

    async fn bind_locked(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> Result<()> {
        if lifecycle.bound {
            return Ok(());
        }
        let engine = self.current_engine().await.ok_or(UaError::NotInitialized)?;

        let local_ip = (self.collaborators.local_ip)();
        let endpoint = {
            let mut profile = self.profile.write().await;
            profile.local_ip = local_ip;
            ListenEndpoint::from_profile(&profile)
        };

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        engine.listen(endpoint.clone(), tx).await?;
        spawn_delivery(Arc::downgrade(self), rx);

        lifecycle.bound = true;
        info!(
            "Bound to {}:{} over {}",
            endpoint.ip, endpoint.port, endpoint.transport
        );
        Ok(())
    }

    async fn unbind_locked(&self, lifecycle: &mut Lifecycle) {
        if !lifecycle.bound {
            return;
        }
        // the delivery task ends once the engine drops its sender
        if let Some(engine) = self.current_engine().await {
            if let Err(e) = engine.unlisten().await {
                warn!("Failed to close listening endpoint: {}", e);
            }
        }
        lifecycle.bound = false;
        debug!("Unbound");
    }

    async fn send_register(&self, expiry: u32, contact: Option<&str>, action: &'static str) {
        let Some(engine) = self.current_engine().await else {
            return;
        };
        let profile = self.profile.read().await.clone();

        let request = match builder::build_register(&profile, expiry, contact, &self.config.user_agent) {
            Ok(request) => request,
            Err(e) => {
                error!("Cannot build REGISTER: {}", e);
                metrics::record_send_failure(action);
                return;
            }
        };

        debug!(
            "Queueing REGISTER for {} (expires {})",
            profile.address_of_record(),
            expiry
        );
        self.outbound
            .submit(
                action,
                async move { engine.send_request(request).await.map(|_| ()) }.boxed(),
            )
            .await;
    }

    async fn process_event(&self, event: EngineEvent) {
        let Some(engine) = self.current_engine().await else {
            debug!("Stack not running, dropping engine event");
            return;
        };

        match event {
            EngineEvent::Request {
                request,
                transaction,
            } => self.on_request(&engine, request, transaction).await,
            EngineEvent::Response {
                response,
                transaction,
                dialog,
            } => self.on_response(&engine, response, transaction, dialog).await,
            EngineEvent::Timeout { transaction } => {
                warn!("Transaction {} timed out", transaction);
            }
            EngineEvent::TransactionTerminated { transaction } => {
                debug!("Transaction {} terminated", transaction);
            }
            EngineEvent::DialogTerminated { dialog } => {
                debug!("Dialog {} terminated", dialog);
                let mut call = self.call.lock().await;
                if call.dialog.as_ref() == Some(&dialog) {
                    call.dialog = None;
                }
            }
            EngineEvent::IoError { message } => {
                error!("Transport I/O error: {}", message);
            }
        }
    }

    // ---- requests ----

    async fn on_request(
        &self,
        engine: &Arc<dyn SipEngine>,
        request: SipRequest,
        transaction: Option<ServerTransaction>,
    ) {
        let Some(method) = request.method() else {
            return;
        };
        debug!("Received {} from {}", method, request.from_address());

        match method {
            SipMethod::Message => self.on_message(engine, request, transaction).await,
            SipMethod::Invite => self.on_invite(engine, request, transaction).await,
            SipMethod::Bye => self.on_bye(engine, request, transaction).await,
            SipMethod::Cancel => self.on_cancel(engine, request, transaction).await,
            SipMethod::Ack => {
                debug!("ACK for {}", request.call_id().unwrap_or_default());
            }
            other => {
                if let Some(transaction) = obtain_transaction(engine, &request, transaction).await {
                    if let Err(e) = reply(engine, &transaction, ResponseBuilder::new(NOT_IMPLEMENTED)).await {
                        warn!("Failed to reject {}: {}", other, e);
                    }
                }
            }
        }
    }

    async fn on_message(
        &self,
        engine: &Arc<dyn SipEngine>,
        request: SipRequest,
        transaction: Option<ServerTransaction>,
    ) {
        if let Some(transaction) = obtain_transaction(engine, &request, transaction).await {
            if let Err(e) = reply(engine, &transaction, ResponseBuilder::ok()).await {
                warn!("Failed to answer MESSAGE: {}", e);
            }
        }

        let event = SipEvent::new(SipEventType::Message)
            .with_content(request.body_text())
            .with_from(request.from_address());
        self.dispatcher.dispatch(&event);
    }

    async fn on_invite(
        &self,
        engine: &Arc<dyn SipEngine>,
        request: SipRequest,
        transaction: Option<ServerTransaction>,
    ) {
        let call_id = request.call_id().unwrap_or_default();
        if self.call.lock().await.tracks_server_call(Some(call_id.as_str())) {
            debug!("Retransmitted INVITE {}, ignoring", call_id);
            return;
        }

        let Some(transaction) = obtain_transaction(engine, &request, transaction).await else {
            return;
        };

        let accepted = {
            let mut call = self.call.lock().await;
            if call.state.accepts_new_call() {
                call.begin(AgentState::Incoming, CallDirection::Incoming);
                call.server = Some(transaction.clone());
                true
            } else {
                false
            }
        };

        if !accepted {
            warn!("Busy, rejecting INVITE {}", call_id);
            let busy = ResponseBuilder::new(BUSY_HERE).to_tag(transaction.local_tag.clone());
            if let Err(e) = reply(engine, &transaction, busy).await {
                warn!("Failed to send 486: {}", e);
            }
            return;
        }

        metrics::record_call("incoming");
        info!("Incoming call from {}", request.from_address());
        if let Err(e) = reply(engine, &transaction, ResponseBuilder::new(TRYING)).await {
            warn!("Failed to send 100 Trying: {}", e);
        }

        match sdp::parse_offer(request.body()) {
            Ok(offer) => {
                self.call.lock().await.remote_rtp_port = Some(offer.media_port);
                let event = SipEvent::new(SipEventType::LocalRinging)
                    .with_from(request.from_address())
                    .with_rtp_port(offer.media_port)
                    .with_sdp(offer.raw);
                self.dispatcher.dispatch(&event);
            }
            Err(e) => {
                // no event: the application never hears of this call
                warn!("INVITE {} carries no usable offer: {}", call_id, e);
            }
        }
    }

    async fn on_bye(
        &self,
        engine: &Arc<dyn SipEngine>,
        request: SipRequest,
        transaction: Option<ServerTransaction>,
    ) {
        info!("BYE received from {}", request.from_address());
        match obtain_transaction(engine, &request, transaction).await {
            Some(transaction) => {
                if let Err(e) = reply(engine, &transaction, ResponseBuilder::ok()).await {
                    error!("Failed to answer BYE: {}", e);
                }
            }
            None => warn!("BYE without a server transaction"),
        }

        self.call.lock().await.end_call();
        let event =
            SipEvent::new(SipEventType::IncomingByeRequest).with_from(request.from_address());
        self.dispatcher.dispatch(&event);
    }

    async fn on_cancel(
        &self,
        engine: &Arc<dyn SipEngine>,
        request: SipRequest,
        transaction: Option<ServerTransaction>,
    ) {
        info!("CANCEL received from {}", request.from_address());
        match obtain_transaction(engine, &request, transaction).await {
            Some(transaction) => {
                if let Err(e) = reply(engine, &transaction, ResponseBuilder::ok()).await {
                    error!("Failed to answer CANCEL: {}", e);
                }
            }
            None => warn!("CANCEL without a server transaction"),
        }

        let invite = {
            let call = self.call.lock().await;
            let unrelated = match &call.server {
                Some(_) => !call.tracks_server_call(request.call_id().as_deref()),
                // only an offered call can be cancelled by the peer
                None => call.direction != CallDirection::None || call.state.in_call(),
            };
            if unrelated {
                debug!(
                    "CANCEL for a call we are not tracking ({})",
                    request.call_id().unwrap_or_default()
                );
                return;
            }
            call.server.clone()
        };

        if let Some(invite) = invite {
            let terminated = ResponseBuilder::new(REQUEST_TERMINATED).to_tag(invite.local_tag.clone());
            if let Err(e) = reply(engine, &invite, terminated).await {
                error!("Failed to send 487 for the cancelled INVITE: {}", e);
            }
        }

        self.call.lock().await.end_call();
        let event = SipEvent::new(SipEventType::RemoteCancel).with_from(request.from_address());
        self.dispatcher.dispatch(&event);
    }

    // ---- responses ----

    async fn on_response(
        &self,
        engine: &Arc<dyn SipEngine>,
        response: SipResponse,
        transaction: Option<ClientTransaction>,
        dialog: Option<DialogId>,
    ) {
        let Some((seq, method)) = response.cseq() else {
            warn!("Response without CSeq dropped");
            return;
        };
        let status = response.status_code();
        debug!("{} response to {} (CSeq {})", status, method, seq);

        if method == SipMethod::Invite {
            if let Some(dialog) = &dialog {
                let mut call = self.call.lock().await;
                if call.direction == CallDirection::Outgoing {
                    call.dialog = Some(dialog.clone());
                }
            }
        }

        match status {
            UNAUTHORIZED | PROXY_AUTHENTICATION_REQUIRED => {
                self.on_challenge(engine, &response, transaction, method)
                    .await;
            }
            OK => match method {
                SipMethod::Invite => {
                    self.on_invite_accepted(engine, &response, transaction, dialog)
                        .await;
                }
                SipMethod::Register => {
                    self.retries.lock().await.clear();
                    info!("Registration accepted by {}", response.to_address());
                }
                SipMethod::Cancel => self.on_cancel_accepted(engine, &response).await,
                SipMethod::Bye => {
                    self.call.lock().await.end_call();
                    self.dispatcher
                        .dispatch(&SipEvent::new(SipEventType::IncomingByeResponse));
                }
                other => debug!("{} accepted", other),
            },
            DECLINE | TEMPORARILY_UNAVAILABLE | BUSY_HERE if method == SipMethod::Invite => {
                info!("Call declined with {}", status);
                self.call.lock().await.end_call();
                self.dispatcher.dispatch(&SipEvent::new(SipEventType::Declined));
            }
            RINGING => {
                self.dispatcher
                    .dispatch(&SipEvent::new(SipEventType::RemoteRinging));
            }
            SERVICE_UNAVAILABLE => {
                self.dispatcher
                    .dispatch(&SipEvent::new(SipEventType::ServiceUnavailable));
            }
            _ => debug!("No handling for {} to {}", status, method),
        }
    }

    async fn on_challenge(
        &self,
        engine: &Arc<dyn SipEngine>,
        response: &SipResponse,
        transaction: Option<ClientTransaction>,
        method: SipMethod,
    ) {
        let Some(call_id) = response.call_id() else {
            warn!("Challenge without Call-ID dropped");
            return;
        };
        let Some(original) = transaction.map(|t| t.request) else {
            warn!("Challenge for an unknown transaction of {}, ignoring", call_id);
            return;
        };

        if !self.retries.lock().await.may_retry(&call_id) {
            // silent by policy: no event reports the failed authentication
            warn!(
                "Giving up on {} for {} after {} attempts",
                method, call_id, MAX_REGISTER_ATTEMPTS
            );
            metrics::record_auth_challenge_dropped();
            return;
        }

        let credentials = {
            let profile = self.profile.read().await;
            UserCredentials::new(profile.username.clone(), profile.password.clone())
        };
        let retry = match self
            .collaborators
            .authenticator
            .handle_challenge(response, &original, &credentials)
        {
            Ok(retry) => retry,
            Err(e) => {
                warn!("Cannot answer challenge for {}: {}", call_id, e);
                return;
            }
        };

        let transaction = match engine.send_request(retry).await {
            Ok(transaction) => transaction,
            Err(e) => {
                error!("Failed to resend {} with credentials: {}", method, e);
                metrics::record_send_failure("auth_retry");
                return;
            }
        };

        if method == SipMethod::Invite {
            let mut call = self.call.lock().await;
            if call.direction == CallDirection::Outgoing {
                call.client = Some(transaction);
            }
        }

        let attempts = self.retries.lock().await.record_attempt(&call_id);
        metrics::record_auth_retry(method.as_str());
        info!("Sent authenticated {} for {} (retry {})", method, call_id, attempts);
    }

    async fn on_invite_accepted(
        &self,
        engine: &Arc<dyn SipEngine>,
        response: &SipResponse,
        transaction: Option<ClientTransaction>,
        dialog: Option<DialogId>,
    ) {
        let dialog = match (dialog, transaction) {
            (Some(dialog), _) => Some(dialog),
            (None, Some(transaction)) => engine.dialog_of(&transaction.id).await,
            (None, None) => None,
        };
        let known = self.call.lock().await.dialog.clone();
        let Some(dialog) = dialog.or(known) else {
            warn!("200 OK to INVITE without a dialog, cannot ACK");
            return;
        };

        if let Err(e) = engine.send_ack(&dialog).await {
            error!("Failed to ACK {}: {}", dialog, e);
            return;
        }
        let abandoned = {
            let mut call = self.call.lock().await;
            let current = call.direction == CallDirection::Outgoing
                && call
                    .client
                    .as_ref()
                    .map_or(true, |client| client.call_id() == response.call_id());
            if current {
                call.dialog = Some(dialog.clone());
                call.state = AgentState::Established;
            } else if call.dialog.as_ref() == Some(&dialog) {
                // the BYE below ends it; a later 200 to CANCEL must not repeat it
                call.dialog = None;
            }
            !current
        };

        if abandoned {
            warn!("Answer arrived after the call was abandoned, sending BYE on {}", dialog);
            let sent = match engine.create_dialog_request(&dialog, SipMethod::Bye).await {
                Ok(bye) => engine.send_on_dialog(&dialog, bye).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                error!("Failed to end abandoned {}: {}", dialog, e);
            }
            return;
        }

        match sdp::parse_offer(response.body()) {
            Ok(answer) => {
                self.call.lock().await.remote_rtp_port = Some(answer.media_port);
                let event = SipEvent::new(SipEventType::CallConnected)
                    .with_from(response.to_address())
                    .with_rtp_port(answer.media_port)
                    .with_sdp(answer.raw);
                self.dispatcher.dispatch(&event);
            }
            Err(e) => {
                // no event: the call is up but never reported as connected
                warn!("Answer on {} is unusable: {}", dialog, e);
            }
        }
    }

    /// CANCEL completed. If the INVITE won the race the dialog is up and
    /// has to be torn down with a BYE.
    async fn on_cancel_accepted(&self, engine: &Arc<dyn SipEngine>, response: &SipResponse) {
        let call_id = response.call_id();
        let dialog = self
            .call
            .lock()
            .await
            .dialog
            .clone()
            .filter(|d| call_id.as_deref() == Some(d.call_id.as_str()));
        let Some(dialog) = dialog else {
            return;
        };

        if engine.dialog_state(&dialog).await != Some(DialogState::Confirmed) {
            debug!("CANCEL of {} completed before the answer", dialog);
            return;
        }

        warn!("CANCEL went in too late, sending BYE on {}", dialog);
        let sent = match engine.create_dialog_request(&dialog, SipMethod::Bye).await {
            Ok(bye) => engine.send_on_dialog(&dialog, bye).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            error!("Failed to end {} after late CANCEL: {}", dialog, e);
        }
    }
}

fn spawn_delivery(agent: Weak<AgentInner>, mut events: mpsc::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = agent.upgrade() else {
                break;
            };
            inner.process_event(event).await;
        }
        debug!("Engine event delivery finished");
    });
}

/// Server transaction for `request`, asking the engine when none came with it
async fn obtain_transaction(
    engine: &Arc<dyn SipEngine>,
    request: &SipRequest,
    transaction: Option<ServerTransaction>,
) -> Option<ServerTransaction> {
    if transaction.is_some() {
        return transaction;
    }
    match engine.server_transaction(request).await {
        Ok(transaction) => Some(transaction),
        Err(e) => {
            warn!("No server transaction for incoming request: {}", e);
            None
        }
    }
}

async fn reply(
    engine: &Arc<dyn SipEngine>,
    transaction: &ServerTransaction,
    response: ResponseBuilder,
) -> std::result::Result<(), SipError> {
    let response = response.build_for_request(&transaction.request)?;
    engine.send_response(transaction, response).await
}
