//! SIP message types and parsing

use crate::domain::UaError;
use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<SipError> for UaError {
    fn from(err: SipError) -> Self {
        UaError::Protocol(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Subscribe,
    Notify,
    Refer,
    Message,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "OPTIONS" => Some(SipMethod::Options),
            "INFO" => Some(SipMethod::Info),
            "UPDATE" => Some(SipMethod::Update),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "REFER" => Some(SipMethod::Refer),
            "MESSAGE" => Some(SipMethod::Message),
            _ => None,
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        Self::from_name(&method.to_string())
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Split a header into its wire name and value.
///
/// rsip's `Display` for a header renders `Name: value`, which works the same
/// for typed variants and `Header::Other`.
pub fn split_header(header: &Header) -> (String, String) {
    let line = header.to_string();
    match line.split_once(':') {
        Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
        None => (line.trim().to_string(), String::new()),
    }
}

fn compact_form(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "call-id" => Some("i"),
        "from" => Some("f"),
        "to" => Some("t"),
        "via" => Some("v"),
        "contact" => Some("m"),
        "content-type" => Some("c"),
        "content-length" => Some("l"),
        _ => None,
    }
}

fn name_matches(actual: &str, wanted: &str) -> bool {
    actual.eq_ignore_ascii_case(wanted)
        || compact_form(wanted).is_some_and(|c| actual.eq_ignore_ascii_case(c))
}

/// First value of the named header
pub fn header_value(headers: &Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|h| {
        let (actual, value) = split_header(h);
        name_matches(&actual, name).then_some(value)
    })
}

/// Copy of `headers` without any header called `name`
pub fn without_header(headers: &Headers, name: &str) -> Vec<Header> {
    headers
        .iter()
        .filter(|h| !name_matches(&split_header(h).0, name))
        .cloned()
        .collect()
}

/// Value of a `;name=value` parameter in a header value.
///
/// For name-addr values the URI inside `<...>` is skipped so URI parameters
/// never shadow header parameters.
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let params = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|p| {
        let (key, val) = p.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| val.trim().trim_matches('"').to_string())
    })
}

/// The address part of a From/To/Contact value, without header parameters
pub fn address_part(value: &str) -> String {
    match value.rfind('>') {
        Some(idx) => value[..=idx].trim().to_string(),
        None => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

/// The bare URI of a From/To/Contact value
pub fn uri_part(value: &str) -> String {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_string(),
        _ => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

/// Accessors shared by requests and responses
pub trait HeaderAccess {
    fn header_list(&self) -> &Headers;

    fn header(&self, name: &str) -> Option<String> {
        header_value(self.header_list(), name)
    }

    fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    /// CSeq number and method
    fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = SipMethod::from_name(parts.next()?)?;
        Some((seq, method))
    }

    fn from_header(&self) -> Option<String> {
        self.header("From")
    }

    fn to_header(&self) -> Option<String> {
        self.header("To")
    }

    fn from_tag(&self) -> Option<String> {
        self.from_header().and_then(|v| header_param(&v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.to_header().and_then(|v| header_param(&v, "tag"))
    }

    /// From address with the tag stripped, e.g. `"Alice" <sip:alice@example.com>`
    fn from_address(&self) -> String {
        self.from_header().map(|v| address_part(&v)).unwrap_or_default()
    }

    fn to_address(&self) -> String {
        self.to_header().map(|v| address_part(&v)).unwrap_or_default()
    }

    fn contact_uri(&self) -> Option<String> {
        self.header("Contact").map(|v| uri_part(&v))
    }

    /// Branch parameter of the top Via
    fn via_branch(&self) -> Option<String> {
        let via = self.header("Via")?;
        via.split(';').skip(1).find_map(|p| {
            let (key, val) = p.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("branch")
                .then(|| val.trim().to_string())
        })
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.inner.body).into_owned()
    }

    /// Replace every header called `name` with `header`
    pub fn set_header(&mut self, name: &str, header: Header) {
        let mut headers = without_header(&self.inner.headers, name);
        headers.push(header);
        self.inner.headers = Headers::from(headers);
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipRequest {
    fn header_list(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.inner.body).into_owned()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipResponse {
    fn header_list(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        // Try parsing as response
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}
