//! SIP Digest Authentication, client side (RFC 2617, RFC 3261 Section 22)

use super::message::{HeaderAccess, SipError, SipRequest, SipResponse};
use super::transaction::TransactionId;
use rand::Rng;
use rsip::Header;
use std::collections::HashMap;
use tracing::debug;

/// Credentials used to answer a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Parsed `WWW-Authenticate` / `Proxy-Authenticate` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// Parse a challenge header value
    pub fn parse(header_value: &str) -> Result<Self, SipError> {
        let trimmed = header_value.trim();
        if trimmed.len() < 7 || !trimmed[..7].eq_ignore_ascii_case("digest ") {
            return Err(SipError::Authentication(format!(
                "Unsupported challenge scheme: {}",
                trimmed
            )));
        }

        let mut params = parse_digest_params(&trimmed[7..]);
        let realm = params
            .remove("realm")
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?;
        let nonce = params
            .remove("nonce")
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;

        Ok(Self {
            realm,
            nonce,
            algorithm: params.remove("algorithm"),
            qop: params.remove("qop"),
            opaque: params.remove("opaque"),
        })
    }

    /// `auth` when the server offers it; `auth-int` alone is not supported
    fn selected_qop(&self) -> Option<&'static str> {
        self.qop.as_deref().and_then(|offered| {
            offered
                .split(',')
                .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                .then_some("auth")
        })
    }
}

/// Parse Digest authentication parameters (`key="value"` pairs)
fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut parts = Vec::new();

    // commas may appear inside quoted values, e.g. qop="auth,auth-int"
    for c in value.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }

    params
}

/// Calculate digest response
#[allow(clippy::too_many_arguments)]
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));

    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
    match qop {
        Some(qop_value) => {
            let nc_value = nc.unwrap_or("00000001");
            let cnonce_value = cnonce.unwrap_or("");
            format!(
                "{:x}",
                md5::compute(format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1, nonce, nc_value, cnonce_value, qop_value, ha2
                ))
            )
        }
        None => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2))),
    }
}

/// Build the `Authorization` header value answering `challenge`
pub fn authorization_value(
    credentials: &UserCredentials,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
) -> Result<String, SipError> {
    if let Some(algorithm) = challenge.algorithm.as_deref() {
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return Err(SipError::Authentication(format!(
                "Unsupported digest algorithm: {}",
                algorithm
            )));
        }
    }

    let qop = challenge.selected_qop();
    let nc = "00000001";
    let cnonce = qop.map(|_| hex::encode(rand::thread_rng().gen::<[u8; 8]>()));

    let response = calculate_response(
        &credentials.username,
        &credentials.password,
        &challenge.realm,
        &challenge.nonce,
        method,
        uri,
        qop,
        qop.map(|_| nc),
        cnonce.as_deref(),
    );

    let mut value = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
        credentials.username, challenge.realm, challenge.nonce, uri, response
    );
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(r#", opaque="{}""#, opaque));
    }
    if let (Some(qop), Some(cnonce)) = (qop, cnonce) {
        value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
    }

    Ok(value)
}

/// Turns a 401/407 into a new, authenticated copy of the challenged request
#[cfg_attr(test, mockall::automock)]
pub trait ChallengeHandler: Send + Sync {
    fn handle_challenge(
        &self,
        response: &SipResponse,
        original: &SipRequest,
        credentials: &UserCredentials,
    ) -> Result<SipRequest, SipError>;
}

/// MD5 digest implementation of [`ChallengeHandler`]
#[derive(Debug, Default, Clone)]
pub struct DigestChallengeHandler;

impl DigestChallengeHandler {
    pub fn new() -> Self {
        Self
    }
}

impl ChallengeHandler for DigestChallengeHandler {
    fn handle_challenge(
        &self,
        response: &SipResponse,
        original: &SipRequest,
        credentials: &UserCredentials,
    ) -> Result<SipRequest, SipError> {
        let (challenge_header, auth_header) = match response.status_code() {
            401 => ("WWW-Authenticate", "Authorization"),
            407 => ("Proxy-Authenticate", "Proxy-Authorization"),
            other => {
                return Err(SipError::Authentication(format!(
                    "Status {} is not a challenge",
                    other
                )))
            }
        };

        let challenge_value = response.header(challenge_header).ok_or_else(|| {
            SipError::Authentication(format!("Missing {} header", challenge_header))
        })?;
        let challenge = DigestChallenge::parse(&challenge_value)?;

        let (seq, method) = original
            .cseq()
            .ok_or_else(|| SipError::InvalidMessage("Missing CSeq".to_string()))?;
        let uri = original.uri().to_string();
        let value = authorization_value(credentials, method.as_str(), &uri, &challenge)?;

        debug!(
            "Answering {} challenge for realm {} ({} {})",
            response.status_code(),
            challenge.realm,
            method,
            uri
        );

        let mut request = original.clone();

        // a retry is a new transaction: fresh branch, next CSeq
        let via = original
            .header("Via")
            .ok_or_else(|| SipError::InvalidMessage("Missing Via".to_string()))?;
        let mut via_parts: Vec<&str> = via
            .split(';')
            .filter(|p| !p.trim().to_ascii_lowercase().starts_with("branch="))
            .collect();
        let branch = format!("branch={}", TransactionId::generate());
        via_parts.push(&branch);
        request.set_header("Via", Header::Via(via_parts.join(";").into()));
        request.set_header("CSeq", Header::CSeq(format!("{} {}", seq + 1, method).into()));
        request.set_header(
            auth_header,
            Header::Other(auth_header.to_string(), value),
        );

        Ok(request)
    }
}
