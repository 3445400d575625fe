//! SIP dialogs (RFC 3261 Section 12)

use super::builder::{RequestBuilder, MAX_FORWARDS};
use super::message::{uri_part, HeaderAccess, SipError, SipMethod, SipRequest, SipResponse};
use std::fmt;

/// Call-ID plus both tags
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

/// Dialog state kept by the engine
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    /// Our From/To value, tag included
    pub local_uri: String,
    /// Peer's From/To value, tag included
    pub remote_uri: String,
    /// Request-URI for requests inside the dialog
    pub remote_target: String,
    pub local_seq: u32,
    /// CSeq of the INVITE that created the dialog, reused by its ACK
    pub invite_seq: u32,
}

impl Dialog {
    /// UAC side: dialog created by a response carrying a To-tag
    pub fn from_response(invite: &SipRequest, response: &SipResponse) -> Option<Self> {
        let remote_tag = response.to_tag()?;
        let local_tag = invite.from_tag()?;
        let (seq, _) = invite.cseq()?;
        let state = if response.is_provisional() {
            DialogState::Early
        } else {
            DialogState::Confirmed
        };

        Some(Self {
            id: DialogId {
                call_id: invite.call_id()?,
                local_tag,
                remote_tag,
            },
            state,
            local_uri: invite.from_header()?,
            remote_uri: response.to_header()?,
            remote_target: response
                .contact_uri()
                .unwrap_or_else(|| invite.uri().to_string()),
            local_seq: seq,
            invite_seq: seq,
        })
    }

    /// UAS side: dialog created by an INVITE we answer with `local_tag`
    pub fn from_request(invite: &SipRequest, local_tag: &str) -> Option<Self> {
        let (seq, _) = invite.cseq()?;

        Some(Self {
            id: DialogId {
                call_id: invite.call_id()?,
                local_tag: local_tag.to_string(),
                remote_tag: invite.from_tag()?,
            },
            state: DialogState::Early,
            local_uri: format!("{};tag={}", invite.to_header()?, local_tag),
            remote_uri: invite.from_header()?,
            remote_target: invite
                .contact_uri()
                .or_else(|| invite.from_header().map(|from| uri_part(&from)))?,
            local_seq: 0,
            invite_seq: seq,
        })
    }

    /// Build a request inside this dialog.
    ///
    /// ACK reuses the INVITE's sequence number; anything else takes the next
    /// local one.
    pub fn create_request(&mut self, method: SipMethod, via: &str) -> Result<SipRequest, SipError> {
        let seq = match method {
            SipMethod::Ack => self.invite_seq,
            _ => {
                self.local_seq += 1;
                self.local_seq
            }
        };

        RequestBuilder::new(method, self.remote_target.clone())
            .header("Via", via)
            .header("Max-Forwards", MAX_FORWARDS.to_string())
            .header("From", self.local_uri.clone())
            .header("To", self.remote_uri.clone())
            .header("Call-ID", self.id.call_id.clone())
            .header("CSeq", format!("{} {}", seq, method))
            .build()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DialogState::Confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:bob@192.168.1.30 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.20:5060;rport;branch=z9hG4bKinv\r\n\
        From: <sip:alice@10.0.0.1>;tag=alice1\r\n\
        To: <sip:bob@10.0.0.1>\r\n\
        Call-ID: call-1@192.168.1.20\r\n\
        CSeq: 7 INVITE\r\n\
        Contact: <sip:alice@192.168.1.20:5060>\r\n\
        Content-Length: 0\r\n\r\n";

    const OK: &[u8] = b"SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 192.168.1.20:5060;rport;branch=z9hG4bKinv\r\n\
        From: <sip:alice@10.0.0.1>;tag=alice1\r\n\
        To: <sip:bob@10.0.0.1>;tag=bob1\r\n\
        Call-ID: call-1@192.168.1.20\r\n\
        CSeq: 7 INVITE\r\n\
        Contact: <sip:bob@192.168.1.30:5062>\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_uac_dialog_requests() {
        let invite = SipRequest::parse(INVITE).unwrap();
        let ok = SipResponse::parse(OK).unwrap();
        let mut dialog = Dialog::from_response(&invite, &ok).unwrap();

        assert!(dialog.is_confirmed());
        assert_eq!(dialog.id.local_tag, "alice1");
        assert_eq!(dialog.id.remote_tag, "bob1");

        let ack = dialog
            .create_request(SipMethod::Ack, "SIP/2.0/UDP 192.168.1.20:5060;branch=z9hG4bKack")
            .unwrap();
        assert_eq!(ack.cseq(), Some((7, SipMethod::Ack)));
        assert_eq!(ack.uri().to_string(), "sip:bob@192.168.1.30:5062");
        assert_eq!(ack.to_tag(), Some("bob1".to_string()));

        let bye = dialog
            .create_request(SipMethod::Bye, "SIP/2.0/UDP 192.168.1.20:5060;branch=z9hG4bKbye")
            .unwrap();
        assert_eq!(bye.cseq(), Some((8, SipMethod::Bye)));
        assert_eq!(bye.from_tag(), Some("alice1".to_string()));
    }

    #[test]
    fn test_uas_dialog_swaps_roles() {
        let invite = SipRequest::parse(INVITE).unwrap();
        let mut dialog = Dialog::from_request(&invite, "bob2").unwrap();

        assert_eq!(dialog.state, DialogState::Early);
        assert_eq!(dialog.id.remote_tag, "alice1");

        let bye = dialog
            .create_request(SipMethod::Bye, "SIP/2.0/UDP 192.168.1.30:5060;branch=z9hG4bKb")
            .unwrap();
        assert_eq!(bye.uri().to_string(), "sip:alice@192.168.1.20:5060");
        assert_eq!(bye.from_tag(), Some("bob2".to_string()));
        assert_eq!(bye.to_tag(), Some("alice1".to_string()));
        assert_eq!(bye.cseq(), Some((1, SipMethod::Bye)));
    }

    #[test]
    fn test_provisional_without_tag_creates_no_dialog() {
        let invite = SipRequest::parse(INVITE).unwrap();
        let ringing = SipResponse::parse(
            b"SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/UDP 192.168.1.20:5060;rport;branch=z9hG4bKinv\r\n\
            From: <sip:alice@10.0.0.1>;tag=alice1\r\n\
            To: <sip:bob@10.0.0.1>\r\n\
            Call-ID: call-1@192.168.1.20\r\n\
            CSeq: 7 INVITE\r\n\
            Content-Length: 0\r\n\r\n",
        )
        .unwrap();

        assert!(Dialog::from_response(&invite, &ringing).is_none());
    }
}
