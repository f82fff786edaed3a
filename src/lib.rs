#![deny(unsafe_code)]
//! Module for parsing the box structure of HEIF (ISO/IEC 23008-12) files and
//! other ISO Base Media File Format derivatives.
//!
//! Parsing never trusts a declared box size beyond what its parent has left.
//! Truncated or malformed input decodes to a partially populated tree and a
//! sticky end-of-data state instead of an error; see [`BoxTree::status`].
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::ReadBytesExt;
use fallible_collections::TryReserveError;

mod boxes;
mod dump;
mod header;
mod hvcc;
mod iloc;
mod items;
mod range;
mod tree;

pub use crate::boxes::{BoxType, FourCC};
pub use crate::header::{BoxHeader, BoxSize, FullBoxHeader};
pub use crate::hvcc::{HevcConfigurationBox, NalArray};
pub use crate::iloc::{ElementaryStream, Extent, FailedExtent, ItemLocationBox, ItemLocationItem};
pub use crate::items::{
    FileTypeBox, HandlerBox, ImageSpatialExtents, ItemDataBox, ItemInfoBox, ItemInfoEntry,
    ItemPropertyAssociationBox, ItemPropertyAssociations, ItemReferenceBox, PixelInformationBox,
    PrimaryItemBox, PropertyAssociation, SingleItemTypeReference,
};
pub use crate::range::{BitstreamRange, ByteBudget};
pub use crate::tree::{BoxId, BoxKind, BoxNode, BoxTree};

pub use enough::{Stop, StopReason, Unstoppable};

/// Marker that separates units of an elementary stream.
pub(crate) const START_CODE: [u8; 3] = [0, 0, 1];

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;
#[doc(hidden)]
pub type TryString = fallible_collections::TryVec<u8>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes parser failures.
///
/// Truncated and over-long box bodies are not reported through this type while
/// a tree is being decoded. They end up in the range state instead, and
/// [`BoxTree::error`] keeps the first one seen.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// The source or a range budget was exhausted before a read could complete.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during parsing
    ResourceLimitExceeded(&'static str),
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) | Self::ResourceLimitExceeded(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Resource limits applied while decoding a box tree and materializing
/// elementary streams from it.
///
/// # Examples
///
/// ```rust
/// use heif_box_parse::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Strict limits for untrusted input
/// let config = DecodeConfig::default()
///     .with_max_box_depth(8)
///     .with_peak_memory_limit(16_000_000);
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Deepest box nesting that is decoded. Boxes below this level are kept
    /// in the tree as generic boxes and their bodies are skipped.
    /// Default: 32
    ///
    /// Decoding recurses once per nesting level, so this limit is applied
    /// even by [`DecodeConfig::unlimited()`].
    pub max_box_depth: u32,

    /// Maximum size in bytes of a single materialized elementary stream.
    /// Default: 1GB (1,000,000,000 bytes)
    pub peak_memory_limit: Option<u64>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_box_depth: 32,
            peak_memory_limit: Some(1_000_000_000),
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no memory limit.
    pub fn unlimited() -> Self {
        Self {
            peak_memory_limit: None,
            ..Self::default()
        }
    }

    /// Set the deepest box nesting level that is decoded
    pub fn with_max_box_depth(mut self, depth: u32) -> Self {
        self.max_box_depth = depth;
        self
    }

    /// Set the peak memory limit in bytes
    pub fn with_peak_memory_limit(mut self, bytes: u64) -> Self {
        self.peak_memory_limit = Some(bytes);
        self
    }

    /// Fails once a buffer would grow past `peak_memory_limit`.
    pub(crate) fn reserve(&self, current: usize, additional: u64) -> Result<()> {
        if let Some(limit) = self.peak_memory_limit {
            if current.to_u64().saturating_add(additional) > limit {
                return Err(Error::ResourceLimitExceeded("peak memory limit exceeded"));
            }
        }
        Ok(())
    }
}

/// Read the box tree of a HEIF file, starting at the current position of `f`
/// and running to the end of the source.
///
/// Uses the default [`DecodeConfig`].
pub fn read_box_tree<T: std::io::Read + std::io::Seek>(f: &mut T) -> Result<BoxTree> {
    BoxTree::from_reader_with_config(f, &DecodeConfig::default(), &Unstoppable)
}

fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

#[test]
fn decode_config_reserve() {
    let config = DecodeConfig::default().with_peak_memory_limit(10);
    assert!(config.reserve(4, 6).is_ok());
    assert!(matches!(config.reserve(4, 7), Err(Error::ResourceLimitExceeded(_))));
    assert!(DecodeConfig::unlimited().reserve(usize::MAX, u64::MAX).is_ok());
}
