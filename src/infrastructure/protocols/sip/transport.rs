//! SIP transport layer - UDP datagrams in and out

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport, returning the stream of parsed incoming messages
    async fn start(&mut self) -> Result<mpsc::Receiver<IncomingMessage>, SipError>;

    /// Stop the transport
    async fn stop(&self) -> Result<(), SipError>;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Address actually bound, once started
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            socket: None,
            receive_task: Mutex::new(None),
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // keep-alive CRLFs
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            if let Err(e) = tx.send(IncomingMessage { message, source }).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<IncomingMessage>, SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;

        if let Ok(addr) = socket.local_addr() {
            info!("UDP transport listening on {}", addr);
        }

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let (tx, rx) = mpsc::channel(1000);
        let handle = tokio::spawn(async move {
            Self::receive_loop(socket, tx).await;
        });
        *self.receive_task.lock().await = Some(handle);

        Ok(rx)
    }

    async fn stop(&self) -> Result<(), SipError> {
        info!("Stopping UDP transport on {}", self.bind_addr);
        if let Some(handle) = self.receive_task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Socket not initialized".to_string()))?;

        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS: &[u8] = b"OPTIONS sip:bob@127.0.0.1 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 127.0.0.1:5999;branch=z9hG4bKopt\r\n\
        From: <sip:alice@127.0.0.1>;tag=1\r\n\
        To: <sip:bob@127.0.0.1>\r\n\
        Call-ID: opt-1\r\n\
        CSeq: 1 OPTIONS\r\n\
        Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_udp_transport_start() {
        let bind_addr = "127.0.0.1:0".parse().unwrap();
        let mut transport = UdpTransport::new(bind_addr);

        let result = transport.start().await;
        assert!(result.is_ok());
        assert!(transport.local_addr().is_some());

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_transport_delivers_parsed_messages() {
        let mut receiver = UdpTransport::new("127.0.0.1:0".parse().unwrap());
        let mut rx = receiver.start().await.unwrap();
        let destination = receiver.local_addr().unwrap();

        let mut sender = UdpTransport::new("127.0.0.1:0".parse().unwrap());
        let _ = sender.start().await.unwrap();
        sender
            .send(OutgoingMessage {
                data: Bytes::from_static(OPTIONS),
                destination,
            })
            .await
            .unwrap();

        let incoming = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(incoming.message.is_request());
        assert_eq!(incoming.source, sender.local_addr().unwrap());

        receiver.stop().await.unwrap();
        sender.stop().await.unwrap();
    }
}
