//! LWM2M TLV wire encoding and decoding.
//!
//! This crate implements the binary TLV format the LWM2M device-management
//! protocol uses to carry object instances between server and device
//! (OMA-TS-LightweightM2M §6.4.3). Entries are self-describing and nest:
//! object instances and multiple resources carry further TLV entries inside
//! their value bytes, so a decoded payload forms a tree of typed nodes.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+--------------------------------------+
//! | header (1B)          | bits 7-6 type, bit 5 id width,       |
//! |                      | bits 4-3 length-of-length,           |
//! |                      | bits 2-0 inline value length         |
//! +----------------------+--------------------------------------+
//! | identifier (1-2B)    | big-endian                           |
//! +----------------------+--------------------------------------+
//! | length (0-3B)        | big-endian, absent when inline       |
//! +----------------------+--------------------------------------+
//! | value                | raw bytes or nested TLV entries      |
//! +----------------------+--------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod tlv;

pub use error::TlvError;
pub use tlv::{Tlv, TlvType};

/// CoAP content-format code used for LWM2M TLV payloads.
pub const MEDIA_TYPE_TLV: u16 = 99;
