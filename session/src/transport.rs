//! CoAP client over a single DTLS session.
//!
//! The bootstrap protocol needs both directions on one session: the device
//! sends outbound confirmable requests, and the server initiates its own
//! requests (object writes, the finish signal) back over the same
//! connection. A background receive loop matches response tokens to
//! outstanding requests and routes server-initiated requests to the
//! handlers registered before dial.

use crate::SessionError;
use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc_dtls::config::{Config, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_dtls::crypto::Certificate;
use webrtc_util::Conn;

/// RFC 7252 initial retransmission timeout for confirmable messages.
const ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// RFC 7252 maximum number of retransmissions for confirmable messages.
const MAX_RETRANSMIT: u32 = 4;
/// Largest datagram accepted from the session (DTLS record bound).
const MAX_DATAGRAM: usize = 16384;

/// Handler for requests the server initiates on the session.
///
/// Handlers run on the receive loop; failures are reported to the peer as
/// response codes and never tear down the session.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one inbound request, returning the response code to send.
    async fn handle(&self, request: &Packet) -> ResponseType;
}

/// Routes inbound requests by their first `Uri-Path` segment.
pub struct Router {
    routes: Vec<(String, Arc<dyn InboundHandler>)>,
    default_handler: Arc<dyn InboundHandler>,
}

impl Router {
    /// Create a router that answers unmatched requests with
    /// `4.03 Forbidden`.
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            default_handler: Arc::new(Forbidden),
        }
    }

    /// Register a handler for requests whose path starts with `segment`.
    pub fn route(mut self, segment: &str, handler: Arc<dyn InboundHandler>) -> Self {
        self.routes.push((segment.to_string(), handler));
        self
    }

    fn lookup(&self, first_segment: &str) -> &Arc<dyn InboundHandler> {
        self.routes
            .iter()
            .find(|(segment, _)| segment == first_segment)
            .map(|(_, handler)| handler)
            .unwrap_or(&self.default_handler)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler answering every request with `4.03 Forbidden`.
struct Forbidden;

#[async_trait]
impl InboundHandler for Forbidden {
    async fn handle(&self, request: &Packet) -> ResponseType {
        warn!("unsupported request to /{}", request_path(request));
        ResponseType::Forbidden
    }
}

/// Transport-level options shared by both sessions.
#[derive(Clone)]
pub struct TransportConfig {
    /// Client certificate presented during the DTLS handshake
    pub certificate: Certificate,
    /// Skip verification of the peer's certificate.
    ///
    /// The deployed platform attests the server identity out of band, so
    /// this defaults to `true`.
    pub insecure_skip_verify: bool,
}

impl TransportConfig {
    /// Transport config for `certificate` with the deployed defaults.
    pub fn new(certificate: Certificate) -> Self {
        Self {
            certificate,
            insecure_skip_verify: true,
        }
    }
}

/// CoAP client multiplexing one DTLS session between outbound requests
/// and server-initiated inbound requests.
pub struct CoapClient {
    conn: Arc<DTLSConn>,
    pending: Arc<DashMap<Vec<u8>, oneshot::Sender<Packet>>>,
    next_message_id: AtomicU16,
    next_token: AtomicU64,
    recv_task: JoinHandle<()>,
}

impl CoapClient {
    /// Dial `host` over DTLS and serve `router` until the session closes.
    ///
    /// The handshake presents the configured client certificate and
    /// requires the extended master secret extension.
    pub async fn dial(
        host: &str,
        config: TransportConfig,
        router: Router,
    ) -> Result<Self, SessionError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(host).await?;
        debug!("dtls dial {}", host);

        let dtls_config = Config {
            certificates: vec![config.certificate],
            insecure_skip_verify: config.insecure_skip_verify,
            extended_master_secret: ExtendedMasterSecretType::Require,
            ..Default::default()
        };
        let conn = Arc::new(DTLSConn::new(Arc::new(socket), dtls_config, true, None).await?);

        let pending: Arc<DashMap<Vec<u8>, oneshot::Sender<Packet>>> = Arc::new(DashMap::new());
        let recv_task = tokio::spawn(recv_loop(conn.clone(), pending.clone(), router));

        Ok(Self {
            conn,
            pending,
            next_message_id: AtomicU16::new(rand::random()),
            next_token: AtomicU64::new(rand::random()),
            recv_task,
        })
    }

    /// Send a confirmable request and await the matching response.
    ///
    /// The request is retransmitted with exponential backoff until a
    /// response carrying its token arrives or the retransmission budget
    /// is exhausted.
    pub async fn request(
        &self,
        method: RequestType,
        path: &str,
        queries: &[String],
        content_format: Option<u16>,
        payload: Vec<u8>,
    ) -> Result<Packet, SessionError> {
        let token = self
            .next_token
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec();

        let mut request = Packet::new();
        request.header.set_type(MessageType::Confirmable);
        request.header.message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        request.header.code = MessageClass::Request(method);
        request.set_token(token.clone());
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            request.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        if let Some(code) = content_format {
            request.add_option(CoapOption::ContentFormat, content_format_bytes(code));
        }
        for query in queries {
            request.add_option(CoapOption::UriQuery, query.clone().into_bytes());
        }
        request.payload = payload;
        let datagram = request.to_bytes()?;

        let (response_tx, mut response_rx) = oneshot::channel();
        self.pending.insert(token.clone(), response_tx);

        let mut timeout = ACK_TIMEOUT;
        for attempt in 0..=MAX_RETRANSMIT {
            if attempt > 0 {
                debug!("retransmit {:?} /{} (attempt {})", method, path, attempt);
            }
            if let Err(e) = self.conn.send(&datagram).await {
                self.pending.remove(&token);
                return Err(e.into());
            }
            tokio::select! {
                response = &mut response_rx => {
                    return response.map_err(|_| {
                        SessionError::Protocol("session closed while awaiting response".into())
                    });
                }
                _ = tokio::time::sleep(timeout) => {
                    timeout *= 2;
                }
            }
        }
        self.pending.remove(&token);
        Err(SessionError::NoResponse(MAX_RETRANSMIT))
    }

    /// `POST` to `path`.
    pub async fn post(
        &self,
        path: &str,
        queries: &[String],
        content_format: Option<u16>,
        payload: Vec<u8>,
    ) -> Result<Packet, SessionError> {
        self.request(RequestType::Post, path, queries, content_format, payload)
            .await
    }

    /// `DELETE` `path`.
    pub async fn delete(&self, path: &str) -> Result<Packet, SessionError> {
        self.request(RequestType::Delete, path, &[], None, Vec::new())
            .await
    }

    /// Close the DTLS session and stop the receive loop.
    pub async fn close(&self) {
        if let Err(e) = self.conn.close().await {
            debug!("closing dtls session: {}", e);
        }
        self.recv_task.abort();
    }
}

async fn recv_loop(
    conn: Arc<DTLSConn>,
    pending: Arc<DashMap<Vec<u8>, oneshot::Sender<Packet>>>,
    router: Router,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = match conn.recv(&mut buffer).await {
            Ok(len) => len,
            Err(e) => {
                debug!("session receive loop ending: {}", e);
                break;
            }
        };
        let packet = match Packet::from_bytes(&buffer[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping undecodable datagram ({} bytes): {}", len, e);
                continue;
            }
        };
        match packet.header.code {
            MessageClass::Response(_) => {
                let token = packet.get_token().to_vec();
                match pending.remove(&token) {
                    Some((_, response_tx)) => {
                        let _ = response_tx.send(packet);
                    }
                    None => debug!("response with unknown token {:02x?}", token),
                }
            }
            MessageClass::Request(method) => {
                serve(&conn, &router, method, &packet).await;
            }
            other => {
                debug!("ignoring message {:?}", other);
            }
        }
    }
    // Drop any outstanding waiters so their requests fail fast.
    pending.clear();
}

async fn serve(conn: &DTLSConn, router: &Router, method: RequestType, request: &Packet) {
    let path = request_path(request);
    let first_segment = path.split('/').next().unwrap_or_default();
    debug!("inbound {:?} /{}", method, path);

    let code = router.lookup(first_segment).handle(request).await;

    let mut response = Packet::new();
    response.header.set_type(MessageType::Acknowledgement);
    response.header.message_id = request.header.message_id;
    response.header.code = MessageClass::Response(code);
    response.set_token(request.get_token().to_vec());
    response.add_option(CoapOption::ContentFormat, content_format_bytes(0));
    match response.to_bytes() {
        Ok(datagram) => {
            if let Err(e) = conn.send(&datagram).await {
                warn!("sending response to inbound request: {}", e);
            }
        }
        Err(e) => warn!("encoding response to inbound request: {}", e),
    }
}

/// Joined `Uri-Path` of a packet, without a leading slash.
pub fn request_path(packet: &Packet) -> String {
    match packet.get_option(CoapOption::UriPath) {
        Some(segments) => segments
            .iter()
            .map(|segment| String::from_utf8_lossy(segment))
            .collect::<Vec<_>>()
            .join("/"),
        None => String::new(),
    }
}

/// Numeric content-format of a packet, if it carries one.
pub fn content_format(packet: &Packet) -> Option<u16> {
    let raw = packet.get_option(CoapOption::ContentFormat)?.front()?;
    match raw.as_slice() {
        [] => Some(0),
        [low] => Some(*low as u16),
        [high, low] => Some(u16::from_be_bytes([*high, *low])),
        _ => None,
    }
}

fn content_format_bytes(code: u16) -> Vec<u8> {
    if code == 0 {
        Vec::new()
    } else if code <= 0xFF {
        vec![code as u8]
    } else {
        code.to_be_bytes().to_vec()
    }
}

/// Check a response against the code the exchange expects.
pub(crate) fn expect_code(response: &Packet, expected: ResponseType) -> Result<(), SessionError> {
    match response.header.code {
        MessageClass::Response(code) if code == expected => Ok(()),
        other => Err(SessionError::Protocol(format!(
            "unexpected response code {:?}, wanted {:?}",
            other, expected
        ))),
    }
}
