//! Simple SDP (Session Description Protocol) handling
//!
//! Only what call control needs: read the remote media port out of an
//! offer or answer, and produce the fixed audio description we send.

use super::message::SipError;

/// Payload types offered/answered by the agent: PCMU, G723, G729A
pub const AUDIO_CODECS: &[(&str, &str)] = &[
    ("0", "PCMU/8000"),
    ("4", "G723/8000"),
    ("18", "G729A/8000"),
];

/// Packetization time in milliseconds
pub const PTIME_MS: u32 = 20;

/// Simple SDP session
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,  // "audio", "video"
    pub port: u16,
    pub protocol: String,    // "RTP/AVP", "UDP/TLS/RTP/SAVPF"
    pub formats: Vec<String>, // Codec payload types
    pub rtpmap: Vec<(String, String)>, // (payload_type, encoding)
    pub ptime: Option<u32>,
}

/// What call control keeps from a remote offer or answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaOffer {
    /// Port of the first media description
    pub media_port: u16,
    /// The description exactly as received
    pub raw: String,
}

fn address_type(ip: &str) -> &'static str {
    if ip.contains(':') {
        "IP6"
    } else {
        "IP4"
    }
}

impl SdpSession {
    /// Create the agent's audio description
    pub fn create_audio_session(local_ip: &str, local_port: u16) -> Self {
        let session_id = chrono::Utc::now().timestamp().to_string();
        Self {
            version: 0,
            origin: SdpOrigin {
                username: "sipua".to_string(),
                session_version: session_id.clone(),
                session_id,
                network_type: "IN".to_string(),
                address_type: address_type(local_ip).to_string(),
                address: local_ip.to_string(),
            },
            session_name: "sipua session".to_string(),
            connection: Some(SdpConnection {
                network_type: "IN".to_string(),
                address_type: address_type(local_ip).to_string(),
                address: local_ip.to_string(),
            }),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats: AUDIO_CODECS.iter().map(|(pt, _)| pt.to_string()).collect(),
                rtpmap: AUDIO_CODECS
                    .iter()
                    .map(|(pt, enc)| (pt.to_string(), enc.to_string()))
                    .collect(),
                ptime: Some(PTIME_MS),
            }],
        }
    }

    /// Convert to SDP string
    pub fn to_string(&self) -> String {
        let mut sdp = String::new();

        sdp.push_str(&format!("v={}\r\n", self.version));

        sdp.push_str(&format!(
            "o={} {} {} {} {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.network_type,
            self.origin.address_type,
            self.origin.address
        ));

        sdp.push_str(&format!("s={}\r\n", self.session_name));

        if let Some(connection) = &self.connection {
            sdp.push_str(&format!(
                "c={} {} {}\r\n",
                connection.network_type, connection.address_type, connection.address
            ));
        }

        sdp.push_str("t=0 0\r\n");

        for media in &self.media {
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            ));

            for (pt, encoding) in &media.rtpmap {
                sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, encoding));
            }

            if let Some(ptime) = media.ptime {
                sdp.push_str(&format!("a=ptime:{}\r\n", ptime));
            }

            sdp.push_str("a=sendrecv\r\n");
        }

        sdp
    }

    /// Parse SDP from string
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp_body.lines() {
            let line = line.trim();
            if line.len() < 2 || !line.contains('=') {
                continue;
            }

            let (field_type, value) = line.split_at(2);
            let value = value.trim();

            match field_type {
                "v=" => {
                    version = value.parse().ok()?;
                }
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            network_type: parts[3].to_string(),
                            address_type: parts[4].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s=" => {
                    session_name = value.to_string();
                }
                "c=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    // media-level connection lines are ignored
                    if parts.len() >= 3 && current_media.is_none() {
                        connection = Some(SdpConnection {
                            network_type: parts[0].to_string(),
                            address_type: parts[1].to_string(),
                            address: parts[2].to_string(),
                        });
                    }
                }
                "m=" => {
                    if let Some(m) = current_media.take() {
                        media.push(m);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return None;
                    }
                    // "port/count" form
                    let port = parts[1].split('/').next()?.parse().ok()?;

                    current_media = Some(SdpMedia {
                        media_type: parts[0].to_string(),
                        port,
                        protocol: parts[2].to_string(),
                        formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                        rtpmap: Vec::new(),
                        ptime: None,
                    });
                }
                "a=" => {
                    if let Some(media) = current_media.as_mut() {
                        if let Some(rtpmap_value) = value.strip_prefix("rtpmap:") {
                            if let Some((pt, encoding)) = rtpmap_value.split_once(' ') {
                                media.rtpmap.push((pt.to_string(), encoding.to_string()));
                            }
                        } else if let Some(ptime) = value.strip_prefix("ptime:") {
                            media.ptime = ptime.trim().parse().ok();
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(m) = current_media.take() {
            media.push(m);
        }

        let origin = origin?;

        Some(Self {
            version,
            origin,
            session_name,
            connection,
            media,
        })
    }

    /// Get media description for audio
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Get supported codecs
    pub fn audio_codecs(&self) -> Vec<u8> {
        self.audio_media()
            .map(|audio| {
                audio
                    .formats
                    .iter()
                    .filter_map(|f| f.parse::<u8>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Extract the remote media port from an offer or answer body
pub fn parse_offer(body: &[u8]) -> Result<MediaOffer, SipError> {
    let raw = std::str::from_utf8(body)
        .map_err(|e| SipError::Sdp(format!("body is not UTF-8: {}", e)))?;

    let session = SdpSession::parse(raw)
        .ok_or_else(|| SipError::Sdp("malformed session description".to_string()))?;

    let media = session
        .media
        .first()
        .ok_or_else(|| SipError::Sdp("no media description".to_string()))?;

    Ok(MediaOffer {
        media_port: media.port,
        raw: raw.to_string(),
    })
}

/// Build the audio answer (or plain offer) for `local_ip:port`
pub fn build_answer(local_ip: &str, port: u16) -> String {
    SdpSession::create_audio_session(local_ip, port).to_string()
}
