//! SIP message builder utilities

use super::message::{header_param, split_header, HeaderAccess, SipError, SipMethod, SipRequest, SipResponse};
use super::transaction::{generate_tag, TransactionId};
use crate::domain::IdentityProfile;
use rsip::{Header, Headers, Response, StatusCode, Version};

/// Caller-supplied headers, appended verbatim in order
pub type ExtraHeaders = Vec<(String, String)>;

pub const MAX_FORWARDS: u32 = 70;

/// Build an outgoing SIP request.
///
/// The request is rendered to wire text and parsed back, so anything that
/// leaves the builder is exactly what a peer would see.
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, extra: &[(String, String)]) -> Self {
        self.headers.extend(extra.iter().cloned());
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<SipRequest, SipError> {
        let mut head = format!("{} {} SIP/2.0\r\n", self.method, self.uri);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));

        let mut data = head.into_bytes();
        data.extend_from_slice(&self.body);

        SipRequest::parse(&data)
            .map_err(|e| SipError::InvalidMessage(format!("built {} is malformed: {}", self.method, e)))
    }
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
    to_tag: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Vec::new(),
            to_tag: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn trying() -> Self {
        Self::new(100)
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Tag added to the To header when the request carried none
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn contact(self, uri: &str) -> Self {
        self.header(Header::Contact(format!("<{}>", uri).into()))
    }

    pub fn sdp(self, body: impl Into<Vec<u8>>) -> Self {
        self.header(Header::ContentType("application/sdp".into()))
            .body(body.into())
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(_) => {
                    let value = split_header(header).1;
                    match &self.to_tag {
                        Some(tag) if header_param(&value, "tag").is_none() => {
                            headers.push(Header::To(format!("{};tag={}", value, tag).into()));
                        }
                        _ => headers.push(header.clone()),
                    }
                }
                _ => {}
            }
        }

        headers.extend(self.headers);

        // Add Content-Length
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Where the agent can currently be reached
pub fn contact_address(profile: &IdentityProfile) -> String {
    format!(
        "sip:{}@{};transport={};registering_acc={}",
        profile.username,
        profile.local_endpoint(),
        profile.transport.param(),
        profile.remote_ip
    )
}

/// Top Via for a new client transaction
pub fn via_value(profile: &IdentityProfile) -> String {
    format!(
        "SIP/2.0/{} {};rport;branch={}",
        profile.transport,
        profile.local_endpoint(),
        TransactionId::generate()
    )
}

pub fn new_call_id(profile: &IdentityProfile) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), profile.local_ip)
}

fn name_addr(uri: &str) -> String {
    if uri.contains('<') {
        uri.to_string()
    } else {
        format!("<{}>", uri)
    }
}

/// REGISTER for the profile's address of record.
///
/// `contact` overrides the current contact address; unregistering a stale
/// contact after a network change passes the pre-change address here.
pub fn build_register(
    profile: &IdentityProfile,
    expiry: u32,
    contact: Option<&str>,
    user_agent: &str,
) -> Result<SipRequest, SipError> {
    let aor = profile.address_of_record();
    let contact = contact
        .map(str::to_string)
        .unwrap_or_else(|| contact_address(profile));

    RequestBuilder::new(
        SipMethod::Register,
        format!("sip:{}", profile.remote_endpoint()),
    )
    .header("Via", via_value(profile))
    .header("Max-Forwards", MAX_FORWARDS.to_string())
    .header("From", format!("<{}>;tag={}", aor, generate_tag()))
    .header("To", format!("<{}>", aor))
    .header("Call-ID", new_call_id(profile))
    .header("CSeq", format!("1 {}", SipMethod::Register))
    .header("Contact", name_addr(&contact))
    .header("Expires", expiry.to_string())
    .header("User-Agent", user_agent)
    .build()
}

/// Session description carried by an INVITE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteBody {
    /// Locally built audio offer on this RTP port
    Audio { local_port: u16 },
    /// Caller-supplied offer, sent verbatim
    Offer(String),
}

pub fn build_invite(
    profile: &IdentityProfile,
    to: &str,
    body: &InviteBody,
    extra: &[(String, String)],
    user_agent: &str,
) -> Result<SipRequest, SipError> {
    let sdp = match body {
        InviteBody::Audio { local_port } => super::sdp::build_answer(&profile.local_ip, *local_port),
        InviteBody::Offer(sdp) => sdp.clone(),
    };

    RequestBuilder::new(SipMethod::Invite, super::message::uri_part(to))
        .header("Via", via_value(profile))
        .header("Max-Forwards", MAX_FORWARDS.to_string())
        .header(
            "From",
            format!("<{}>;tag={}", profile.address_of_record(), generate_tag()),
        )
        .header("To", name_addr(to))
        .header("Call-ID", new_call_id(profile))
        .header("CSeq", format!("1 {}", SipMethod::Invite))
        .header("Contact", name_addr(&contact_address(profile)))
        .header("User-Agent", user_agent)
        .headers(extra)
        .body("application/sdp", sdp)
        .build()
}

/// Out-of-dialog instant message
pub fn build_message(
    profile: &IdentityProfile,
    to: &str,
    text: &str,
    user_agent: &str,
) -> Result<SipRequest, SipError> {
    RequestBuilder::new(SipMethod::Message, super::message::uri_part(to))
        .header("Via", via_value(profile))
        .header("Max-Forwards", MAX_FORWARDS.to_string())
        .header(
            "From",
            format!("<{}>;tag={}", profile.address_of_record(), generate_tag()),
        )
        .header("To", name_addr(to))
        .header("Call-ID", new_call_id(profile))
        .header("CSeq", format!("1 {}", SipMethod::Message))
        .header("User-Agent", user_agent)
        .body("text/plain;charset=UTF-8", text)
        .build()
}

/// CANCEL for a pending INVITE (RFC 3261 Section 9.1)
pub fn build_cancel(invite: &SipRequest) -> Result<SipRequest, SipError> {
    let missing = |name: &str| SipError::InvalidMessage(format!("INVITE without {}", name));

    let (seq, _) = invite.cseq().ok_or_else(|| missing("CSeq"))?;

    RequestBuilder::new(SipMethod::Cancel, invite.uri().to_string())
        .header("Via", invite.header("Via").ok_or_else(|| missing("Via"))?)
        .header("Max-Forwards", MAX_FORWARDS.to_string())
        .header("From", invite.from_header().ok_or_else(|| missing("From"))?)
        .header("To", invite.to_header().ok_or_else(|| missing("To"))?)
        .header("Call-ID", invite.call_id().ok_or_else(|| missing("Call-ID"))?)
        .header("CSeq", format!("{} {}", seq, SipMethod::Cancel))
        .build()
}

/// ACK for a non-2xx final response, sent within the INVITE transaction
/// (RFC 3261 Section 17.1.1.3)
pub fn build_failure_ack(invite: &SipRequest, response: &SipResponse) -> Result<SipRequest, SipError> {
    let missing = |name: &str| SipError::InvalidMessage(format!("cannot ACK without {}", name));

    let (seq, _) = invite.cseq().ok_or_else(|| missing("CSeq"))?;

    RequestBuilder::new(SipMethod::Ack, invite.uri().to_string())
        .header("Via", invite.header("Via").ok_or_else(|| missing("Via"))?)
        .header("Max-Forwards", MAX_FORWARDS.to_string())
        .header("From", invite.from_header().ok_or_else(|| missing("From"))?)
        .header("To", response.to_header().ok_or_else(|| missing("To"))?)
        .header("Call-ID", invite.call_id().ok_or_else(|| missing("Call-ID"))?)
        .header("CSeq", format!("{} {}", seq, SipMethod::Ack))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransportProtocol;

    fn profile() -> IdentityProfile {
        let mut profile = IdentityProfile::new("alice", "secret", "10.0.0.1", 5060)
            .with_local_port(5070)
            .with_transport(TransportProtocol::Udp);
        profile.local_ip = "192.168.1.20".to_string();
        profile
    }

    #[test]
    fn test_contact_address() {
        assert_eq!(
            contact_address(&profile()),
            "sip:alice@192.168.1.20:5070;transport=udp;registering_acc=10.0.0.1"
        );
    }

    #[test]
    fn test_build_register() {
        let request = build_register(&profile(), 3600, None, "sipua-test").unwrap();

        assert_eq!(request.method(), Some(SipMethod::Register));
        assert_eq!(request.uri().to_string(), "sip:10.0.0.1:5060");
        assert_eq!(request.cseq(), Some((1, SipMethod::Register)));
        assert_eq!(request.header("Expires"), Some("3600".to_string()));
        assert_eq!(request.to_address(), "<sip:alice@10.0.0.1>");
        assert!(request.from_tag().is_some());
        assert_eq!(
            request.contact_uri().as_deref(),
            Some("sip:alice@192.168.1.20:5070;transport=udp;registering_acc=10.0.0.1")
        );

        let via = request.header("Via").unwrap();
        assert!(via.starts_with("SIP/2.0/UDP 192.168.1.20:5070;rport"));
        assert!(request.via_branch().unwrap().starts_with("z9hG4bK"));
    }

    #[test]
    fn test_build_unregister_uses_given_contact() {
        let old = "sip:alice@172.16.0.9:5070;transport=udp;registering_acc=10.0.0.1";
        let request = build_register(&profile(), 0, Some(old), "sipua-test").unwrap();

        assert_eq!(request.header("Expires"), Some("0".to_string()));
        assert_eq!(request.contact_uri().as_deref(), Some(old));
    }

    #[test]
    fn test_build_invite_with_offer_and_headers() {
        let offer = "v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=-\r\nt=0 0\r\nm=audio 7000 RTP/AVP 0\r\n";
        let extra = vec![("X-Token".to_string(), "abc".to_string())];
        let request = build_invite(
            &profile(),
            "sip:bob@example.com",
            &InviteBody::Offer(offer.to_string()),
            &extra,
            "sipua-test",
        )
        .unwrap();

        assert_eq!(request.method(), Some(SipMethod::Invite));
        assert_eq!(request.uri().to_string(), "sip:bob@example.com");
        assert_eq!(request.body_text(), offer);
        assert_eq!(request.header("Content-Type"), Some("application/sdp".to_string()));
        assert_eq!(request.header("X-Token"), Some("abc".to_string()));
        assert_eq!(request.to_tag(), None);
    }

    #[test]
    fn test_build_invite_plain_audio() {
        let request = build_invite(
            &profile(),
            "sip:bob@example.com",
            &InviteBody::Audio { local_port: 5000 },
            &[],
            "sipua-test",
        )
        .unwrap();

        assert!(request.body_text().contains("m=audio 5000 RTP/AVP 0 4 18"));
    }

    #[test]
    fn test_build_message() {
        let request = build_message(&profile(), "sip:bob@example.com", "hello", "sipua-test").unwrap();

        assert_eq!(request.method(), Some(SipMethod::Message));
        assert_eq!(
            request.header("Content-Type"),
            Some("text/plain;charset=UTF-8".to_string())
        );
        assert_eq!(request.body_text(), "hello");
    }

    #[test]
    fn test_build_cancel_mirrors_invite() {
        let invite = build_invite(
            &profile(),
            "sip:bob@example.com",
            &InviteBody::Audio { local_port: 5000 },
            &[],
            "sipua-test",
        )
        .unwrap();
        let cancel = build_cancel(&invite).unwrap();

        assert_eq!(cancel.method(), Some(SipMethod::Cancel));
        assert_eq!(cancel.uri().to_string(), invite.uri().to_string());
        assert_eq!(cancel.via_branch(), invite.via_branch());
        assert_eq!(cancel.call_id(), invite.call_id());
        assert_eq!(cancel.from_tag(), invite.from_tag());
        assert_eq!(cancel.cseq(), Some((1, SipMethod::Cancel)));
    }

    #[test]
    fn test_response_adds_to_tag_and_contact() {
        let invite = build_invite(
            &profile(),
            "sip:bob@example.com",
            &InviteBody::Audio { local_port: 5000 },
            &[],
            "sipua-test",
        )
        .unwrap();

        let response = ResponseBuilder::ok()
            .to_tag("4321")
            .contact("sip:bob@192.168.1.30:5060")
            .sdp("v=0\r\n")
            .build_for_request(&invite)
            .unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.to_tag(), Some("4321".to_string()));
        assert_eq!(response.call_id(), invite.call_id());
        assert_eq!(response.cseq(), Some((1, SipMethod::Invite)));
        assert_eq!(response.contact_uri().as_deref(), Some("sip:bob@192.168.1.30:5060"));
        assert_eq!(response.body_text(), "v=0\r\n");
    }
}
