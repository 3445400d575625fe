//! Events surfaced to the owning application

use serde::{Deserialize, Serialize};

/// Kind of a [`SipEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SipEventType {
    Message,
    CallConnected,
    LocalRinging,
    RemoteRinging,
    IncomingByeRequest,
    IncomingByeResponse,
    RemoteCancel,
    Declined,
    ServiceUnavailable,
}

impl SipEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipEventType::Message => "MESSAGE",
            SipEventType::CallConnected => "CALL_CONNECTED",
            SipEventType::LocalRinging => "LOCAL_RINGING",
            SipEventType::RemoteRinging => "REMOTE_RINGING",
            SipEventType::IncomingByeRequest => "INCOMING_BYE_REQUEST",
            SipEventType::IncomingByeResponse => "INCOMING_BYE_RESPONSE",
            SipEventType::RemoteCancel => "REMOTE_CANCEL",
            SipEventType::Declined => "DECLINED",
            SipEventType::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

/// One notification to listeners. Built fresh per dispatch, never retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipEvent {
    pub event_type: SipEventType,
    /// Message body for `MESSAGE`, empty otherwise
    pub content: String,
    /// Address of the originating party, empty when unknown
    pub from: String,
    pub remote_rtp_port: Option<u16>,
    pub sdp: Option<String>,
}

impl SipEvent {
    pub fn new(event_type: SipEventType) -> Self {
        Self {
            event_type,
            content: String::new(),
            from: String::new(),
            remote_rtp_port: None,
            sdp: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_rtp_port(mut self, port: u16) -> Self {
        self.remote_rtp_port = Some(port);
        self
    }

    pub fn with_sdp(mut self, sdp: impl Into<String>) -> Self {
        self.sdp = Some(sdp.into());
        self
    }
}
