//! Session error types.

use lwm2m_storage::StoreError;
use lwm2m_wire::TlvError;
use thiserror::Error;

/// Errors from device setup and the bootstrap/registration sessions
#[derive(Error, Debug)]
pub enum SessionError {
    /// Configuration is unusable: bad URL, wrong scheme, bad account query
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Certificate or key material is unreadable or malformed
    #[error("invalid credential: {0}")]
    Credential(String),

    /// A session precondition is unmet; names the missing device field
    #[error("{0} missing")]
    NotReady(&'static str),

    /// DTLS handshake or record-layer failure
    #[error("dtls error: {0}")]
    Dtls(#[from] webrtc_dtls::Error),

    /// Transport-level failure on the DTLS session
    #[error("transport error: {0}")]
    Transport(#[from] webrtc_util::Error),

    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A CoAP message could not be encoded or decoded
    #[error("coap message error: {0}")]
    Coap(#[from] coap_lite::error::MessageError),

    /// The peer broke the exchange contract: wrong code, missing option
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No response to a confirmable request after all retransmissions
    #[error("no response from peer after {0} retransmissions")]
    NoResponse(u32),

    /// A TLV payload failed to decode
    #[error(transparent)]
    Tlv(#[from] TlvError),

    /// Blob store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The bootstrap finish signal did not arrive in time
    #[error("timeout waiting for bootstrap to finish")]
    Timeout,

    /// The caller cancelled the session
    #[error("cancelled waiting for session to complete")]
    Cancelled,
}
