//! Request dispatcher: accepts read requests on the listening socket and starts
//! one independent transfer per request.

use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::channel::UdpChannel;
use crate::packet::{DecodeError, ErrorPacket, ReadRequest};
use crate::protocol::*;
use crate::session::{Session, SessionConfig};
use crate::shutdown_mgr::ShutdownManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: String,
    pub retries: u8,
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "127.0.0.1:69".to_owned(),
            retries: TFTP_DEFAULT_RETRIES,
            timeout: TFTP_DEFAULT_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Session settings, with zero values replaced by the defaults.
    pub fn session(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            retries: if self.retries == 0 {
                defaults.retries
            } else {
                self.retries
            },
            timeout: if self.timeout.is_zero() {
                defaults.timeout
            } else {
                self.timeout
            },
        }
    }
}

pub struct UdpServer {
    pub own_addr: SocketAddr,
    socket: UdpSocket,
    payload: Bytes,
    session: SessionConfig,
    shutdown: ShutdownManager,
}

impl UdpServer {
    pub async fn bind(
        config: &ServerConfig,
        payload: Bytes,
        shutdown: ShutdownManager,
    ) -> io::Result<UdpServer> {
        let socket = UdpSocket::bind(config.address.as_str()).await?;
        let own_addr = socket.local_addr()?;
        Ok(UdpServer {
            own_addr,
            socket,
            payload,
            session: config.session(),
            shutdown,
        })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Runs until shutdown is requested. Malformed requests are answered and
    /// skipped; only a failing listening socket ends the loop with an error.
    pub async fn listen(&mut self) -> io::Result<()> {
        let mut in_buffer = [0u8; TFTP_DATAGRAM_SIZE];
        info!(address = %self.own_addr, "listening");
        while !self.shutdown.is_shutdown() {
            tokio::select! {
                received = self.socket.recv_from(&mut in_buffer[..]) => {
                    let (len, client_addr) = received.inspect_err(|e| {
                        error!(error = %e, "receiving request failed");
                    })?;
                    match ReadRequest::decode(&in_buffer[..len]) {
                        Ok(request) => self.serve_file(client_addr, request),
                        Err(e) => {
                            warn!(peer = %client_addr, error = %e, "rejected request");
                            self.reject(client_addr, &e).await;
                        }
                    }
                }
                _ = self.shutdown.recv() => {
                    info!("terminating listener");
                }
            }
        }
        Ok(())
    }

    fn serve_file(&self, client: SocketAddr, request: ReadRequest) {
        info!(peer = %client, filename = %request.filename, "requested file");
        let payload = Cursor::new(self.payload.clone());
        let config = self.session;
        tokio::spawn(async move {
            let channel = match UdpChannel::connect(client).await {
                Ok(channel) => channel,
                Err(e) => {
                    error!(peer = %client, error = %e, "dial failed");
                    return;
                }
            };
            let _ = Session::new(client, channel, payload, config).run().await;
        });
    }

    async fn reject(&self, client: SocketAddr, reason: &DecodeError) {
        let Some(packet) = rejection(reason) else {
            return;
        };
        if let Err(e) = self.socket.send_to(&packet.encode(), client).await {
            warn!(peer = %client, error = %e, "sending rejection failed");
        }
    }
}

// Never answer an error packet with another one.
fn rejection(reason: &DecodeError) -> Option<ErrorPacket> {
    let packet = match reason {
        DecodeError::UnexpectedOpcode {
            found: Opcode::Error,
            ..
        } => return None,
        DecodeError::UnexpectedOpcode { found, .. } => {
            ErrorPacket::new(ErrorCode::IllegalOperation, format!("{found} not supported"))
        }
        DecodeError::InvalidOpcode(_) => {
            ErrorPacket::new(ErrorCode::IllegalOperation, reason.to_string())
        }
        DecodeError::UnsupportedMode(_) => {
            ErrorPacket::new(ErrorCode::IllegalOperation, "only octet mode is supported")
        }
        other => ErrorPacket::new(ErrorCode::Unknown, other.to_string()),
    };
    Some(packet)
}
