//! Parsing and serialization of LWM2M TLV entries.

use crate::TlvError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Entry kind carried in bits 7-6 of the TLV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    /// An LWM2M object instance; carries resources and multiple resources
    ObjectInstance,
    /// One entry of a multiple resource
    ResourceInstance,
    /// A resource with multiple instances; carries resource instances
    MultiResource,
    /// A single-instance resource
    Resource,
}

impl TlvType {
    fn from_header(header: u8) -> Self {
        match (header >> 6) & 0x3 {
            0 => TlvType::ObjectInstance,
            1 => TlvType::ResourceInstance,
            2 => TlvType::MultiResource,
            _ => TlvType::Resource,
        }
    }

    fn header_bits(self) -> u8 {
        let tag: u8 = match self {
            TlvType::ObjectInstance => 0,
            TlvType::ResourceInstance => 1,
            TlvType::MultiResource => 2,
            TlvType::Resource => 3,
        };
        tag << 6
    }

    /// Whether entries of this type carry child entries in their value.
    pub fn is_container(self) -> bool {
        matches!(self, TlvType::ObjectInstance | TlvType::MultiResource)
    }
}

impl fmt::Display for TlvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TlvType::ObjectInstance => "Object Instance",
            TlvType::ResourceInstance => "Resource Instance",
            TlvType::MultiResource => "Multiple Resource",
            TlvType::Resource => "Resource",
        };
        f.write_str(name)
    }
}

/// A parsed TLV entry.
///
/// `value` always holds the raw value bytes. For container types the same
/// bytes are also parsed into `children`, so re-encoding the children
/// yields `value` again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    /// Entry kind
    pub tlv_type: TlvType,
    /// Entry identifier (object instance id, resource id, ...)
    pub identifier: u16,
    /// Raw value bytes
    pub value: Bytes,
    /// Parsed child entries; empty for non-container types
    pub children: Vec<Tlv>,
}

impl Tlv {
    /// Parse the first TLV entry in `data`, returning it and the bytes
    /// that follow it.
    ///
    /// Object instances and multiple resources are parsed recursively:
    /// their value bytes must decode as a sequence of child entries that
    /// exactly exhausts the value range.
    pub fn decode_one(data: &[u8]) -> Result<(Tlv, &[u8]), TlvError> {
        let header = *data.first().ok_or(TlvError::Short { needed: 1, have: 0 })?;
        let tlv_type = TlvType::from_header(header);
        let mut rest = &data[1..];

        let id_width = if header & 0x20 == 0 { 1 } else { 2 };
        if rest.len() < id_width {
            return Err(TlvError::Short {
                needed: id_width,
                have: rest.len(),
            });
        }
        let identifier = if id_width == 1 {
            rest[0] as u16
        } else {
            u16::from_be_bytes([rest[0], rest[1]])
        };
        rest = &rest[id_width..];

        let length_width = ((header >> 3) & 0x3) as usize;
        let length = if length_width == 0 {
            // No length field; bits 2-0 of the header hold the value length.
            (header & 0x7) as usize
        } else {
            // Explicit length field; bits 2-0 of the header are ignored.
            if rest.len() < length_width {
                return Err(TlvError::Short {
                    needed: length_width,
                    have: rest.len(),
                });
            }
            let mut length = 0usize;
            for &byte in &rest[..length_width] {
                length = (length << 8) | byte as usize;
            }
            rest = &rest[length_width..];
            length
        };

        if rest.len() < length {
            return Err(TlvError::Short {
                needed: length,
                have: rest.len(),
            });
        }
        let (value, rest) = rest.split_at(length);
        let value = Bytes::copy_from_slice(value);

        let children = if tlv_type.is_container() {
            Self::decode_children(identifier, &value)?
        } else {
            Vec::new()
        };

        Ok((
            Tlv {
                tlv_type,
                identifier,
                value,
                children,
            },
            rest,
        ))
    }

    fn decode_children(parent: u16, mut value: &[u8]) -> Result<Vec<Tlv>, TlvError> {
        let mut children = Vec::new();
        while !value.is_empty() {
            let (child, rest) = Self::decode_one(value).map_err(|source| TlvError::Structure {
                parent,
                source: Box::new(source),
            })?;
            children.push(child);
            value = rest;
        }
        Ok(children)
    }

    /// Parse every TLV entry in `data` until it is exhausted.
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<Tlv>, TlvError> {
        let mut entries = Vec::new();
        while !data.is_empty() {
            let (entry, rest) = Self::decode_one(data)?;
            entries.push(entry);
            data = rest;
        }
        Ok(entries)
    }

    /// A single-instance resource entry.
    pub fn resource(identifier: u16, value: impl Into<Bytes>) -> Tlv {
        Tlv {
            tlv_type: TlvType::Resource,
            identifier,
            value: value.into(),
            children: Vec::new(),
        }
    }

    /// One instance of a multiple resource.
    pub fn resource_instance(identifier: u16, value: impl Into<Bytes>) -> Tlv {
        Tlv {
            tlv_type: TlvType::ResourceInstance,
            identifier,
            value: value.into(),
            children: Vec::new(),
        }
    }

    /// An object instance whose value is the encoding of `children`.
    pub fn object_instance(identifier: u16, children: Vec<Tlv>) -> Tlv {
        Self::container(TlvType::ObjectInstance, identifier, children)
    }

    /// A multiple resource whose value is the encoding of `children`.
    pub fn multi_resource(identifier: u16, children: Vec<Tlv>) -> Tlv {
        Self::container(TlvType::MultiResource, identifier, children)
    }

    fn container(tlv_type: TlvType, identifier: u16, children: Vec<Tlv>) -> Tlv {
        let mut value = BytesMut::new();
        for child in &children {
            child.encode_into(&mut value);
        }
        Tlv {
            tlv_type,
            identifier,
            value: value.freeze(),
            children,
        }
    }

    /// Serialized length of this entry in bytes.
    pub fn encoded_len(&self) -> usize {
        let id_width = if self.identifier > 0xFF { 2 } else { 1 };
        let length_width = match self.value.len() {
            0..=7 => 0,
            8..=0xFF => 1,
            0x100..=0xFFFF => 2,
            _ => 3,
        };
        1 + id_width + length_width + self.value.len()
    }

    /// Append the wire encoding of this entry to `buf`.
    ///
    /// The length field uses the smallest width that fits; values longer
    /// than 2^24 - 1 bytes are not representable in the TLV length field.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut header = self.tlv_type.header_bits();
        if self.identifier > 0xFF {
            header |= 1 << 5;
        }
        let length = self.value.len();
        let length_width: usize = match length {
            0..=7 => {
                header |= length as u8;
                0
            }
            8..=0xFF => {
                header |= 1 << 3;
                1
            }
            0x100..=0xFFFF => {
                header |= 2 << 3;
                2
            }
            _ => {
                header |= 3 << 3;
                3
            }
        };
        buf.put_u8(header);
        if self.identifier > 0xFF {
            buf.put_u16(self.identifier);
        } else {
            buf.put_u8(self.identifier as u8);
        }
        for shift in (0..length_width).rev() {
            buf.put_u8((length >> (shift * 8)) as u8);
        }
        buf.extend_from_slice(&self.value);
    }

    /// Wire encoding of this entry.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

impl fmt::Display for Tlv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} id={} size={} children={}",
            self.tlv_type,
            self.identifier,
            self.value.len(),
            self.children.len()
        )
    }
}
