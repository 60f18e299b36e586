//! TLV decoding error types.

use thiserror::Error;

/// TLV decoding errors
#[derive(Error, Debug)]
pub enum TlvError {
    /// Input ended before the entry its header describes
    #[error("input truncated: entry needs {needed} more bytes, {have} remain")]
    Short {
        /// Bytes the current field still requires
        needed: usize,
        /// Bytes actually remaining
        have: usize,
    },

    /// A container's value bytes do not decode as a sequence of child entries
    #[error("container {parent} has malformed child entries")]
    Structure {
        /// Identifier of the container whose children failed to decode
        parent: u16,
        /// The failure inside the container's value range
        #[source]
        source: Box<TlvError>,
    },
}
