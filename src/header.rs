// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use arrayvec::ArrayVec;
use log::debug;
use std::fmt::Write as _;
use std::io::{Read, Seek};

use crate::boxes::{BoxType, FourCC};
use crate::range::BitstreamRange;
use crate::{Error, Result};

/// Declared size of a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxSize {
    /// Total size in bytes, header included.
    Fixed(u64),
    /// A size field of 0: the box runs to the end of the file.
    UntilEndOfFile,
}

/// Version and flags that open the body of a "full box".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FullBoxHeader {
    pub version: u8,
    /// 24 bits.
    pub flags: u32,
}

/// Basic ISO box structure.
///
/// mp4 files are a sequence of possibly-nested 'box' structures.  Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box. Together these
/// are enough to interpret the contents of that section of the file.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    name: BoxType,
    size: BoxSize,
    /// Bytes consumed by this header, including the full box fields once
    /// they have been read.
    header_size: u32,
    /// Extended type of a 'uuid' box.
    uuid: Option<[u8; 16]>,
    full_box: Option<FullBoxHeader>,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub const MIN_SIZE: u32 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    pub const MIN_LARGE_SIZE: u32 = 16;
    const UUID_SIZE: u32 = 16;
    const FULL_BOX_SIZE: u32 = 4;

    /// Read and parse a box header.
    ///
    /// Call this first to determine the type of a particular box and its
    /// length. A short read is reported as [`Error::UnexpectedEOF`] and is
    /// also visible in the state of `range`. A size smaller than the header
    /// itself is [`Error::InvalidData`].
    pub fn read<R: Read + Seek>(range: &mut BitstreamRange<'_, R>) -> Result<Self> {
        let size32 = range.read32();
        let name = BoxType::from(range.read32());
        let mut header_size = Self::MIN_SIZE;

        let size = match size32 {
            0 => BoxSize::UntilEndOfFile,
            1 => {
                header_size += 8;
                BoxSize::Fixed(range.read64())
            },
            _ => BoxSize::Fixed(u64::from(size32)),
        };

        let uuid = if name == BoxType::UuidBox {
            let mut buffer = [0; 16];
            header_size += Self::UUID_SIZE;
            range.read_exact_into(&mut buffer).then_some(buffer)
        } else {
            None
        };

        if range.error() {
            return Err(Error::UnexpectedEOF);
        }

        if let BoxSize::Fixed(size) = size {
            if size < u64::from(header_size) {
                debug!("'{}' box declares {size} bytes, less than its {header_size} byte header", FourCC::from(name));
                return Err(Error::InvalidData("malformed size"));
            }
        }

        Ok(Self {
            name,
            size,
            header_size,
            uuid,
            full_box: None,
        })
    }

    /// Parse the version and flags of a full box and return the header
    /// extended with them.
    pub fn read_full_box_header<R: Read + Seek>(self, range: &mut BitstreamRange<'_, R>) -> Self {
        let data = range.read32();
        self.with_full_box(FullBoxHeader {
            version: (data >> 24) as u8,
            flags: data & 0x00FF_FFFF,
        })
    }

    pub(crate) fn with_full_box(self, full_box: FullBoxHeader) -> Self {
        Self {
            header_size: self.header_size + Self::FULL_BOX_SIZE,
            full_box: Some(full_box),
            ..self
        }
    }

    pub const fn box_type(&self) -> BoxType {
        self.name
    }

    pub fn fourcc(&self) -> FourCC {
        self.name.into()
    }

    pub const fn size(&self) -> BoxSize {
        self.size
    }

    /// The raw size field: 0 for a box that runs to the end of the file.
    pub const fn declared_size(&self) -> u64 {
        match self.size {
            BoxSize::Fixed(size) => size,
            BoxSize::UntilEndOfFile => 0,
        }
    }

    pub const fn header_size(&self) -> u32 {
        self.header_size
    }

    /// Length of the body that follows the plain header, or `None` when the
    /// box runs to the end of the file.
    pub(crate) fn body_length(&self) -> Option<u64> {
        let plain_header = self.header_size - self.full_box.map_or(0, |_| Self::FULL_BOX_SIZE);
        match self.size {
            BoxSize::Fixed(size) => Some(size.saturating_sub(u64::from(plain_header))),
            BoxSize::UntilEndOfFile => None,
        }
    }

    pub const fn extended_type(&self) -> Option<&[u8; 16]> {
        self.uuid.as_ref()
    }

    pub const fn full_box(&self) -> Option<FullBoxHeader> {
        self.full_box
    }

    /// Full box version, 0 for plain boxes.
    pub fn version(&self) -> u8 {
        self.full_box.map_or(0, |f| f.version)
    }

    /// Full box flags, 0 for plain boxes.
    pub fn flags(&self) -> u32 {
        self.full_box.map_or(0, |f| f.flags)
    }

    /// The type identity: the 16-byte extended type for 'uuid' boxes, the
    /// four type bytes otherwise.
    pub fn type_bytes(&self) -> ArrayVec<u8, 16> {
        let mut bytes = ArrayVec::new();
        match &self.uuid {
            Some(uuid) => bytes.extend(uuid.iter().copied()),
            None => bytes.extend(self.fourcc().value),
        }
        bytes
    }

    /// The type as text. Extended types are rendered as a hyphenated UUID.
    pub fn type_string(&self) -> std::string::String {
        match &self.uuid {
            Some(uuid) => format_uuid(uuid),
            None => self.fourcc().to_string(),
        }
    }
}

/// 8-4-4-4-12 lowercase hex.
fn format_uuid(uuid: &[u8; 16]) -> std::string::String {
    let mut s = std::string::String::with_capacity(36);
    for (i, b) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            s.push('-');
        }
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
fn parse(bytes: &[u8]) -> (Result<BoxHeader>, u64) {
    let mut src = std::io::Cursor::new(bytes);
    let mut range = BitstreamRange::new(&mut src, bytes.len() as u64);
    let header = BoxHeader::read(&mut range);
    let left = range.remaining();
    (header, left)
}

#[test]
fn compact_header() {
    let (header, left) = parse(b"\0\0\0\x18ftypheic\0\0\0\0mif1heic");
    let header = header.unwrap();
    assert_eq!(header.box_type(), BoxType::FileTypeBox);
    assert_eq!(header.declared_size(), 24);
    assert_eq!(header.header_size(), 8);
    assert_eq!(header.body_length(), Some(16));
    assert_eq!(header.type_string(), "ftyp");
    assert_eq!(left, 16);
}

#[test]
fn large_size_header() {
    let mut bytes = b"\0\0\0\x01mdat".to_vec();
    bytes.extend_from_slice(&0x1_0000_0010u64.to_be_bytes());
    let header = parse(&bytes).0.unwrap();
    assert_eq!(header.size(), BoxSize::Fixed(0x1_0000_0010));
    assert_eq!(header.header_size(), 16);
    assert_eq!(header.body_length(), Some(0x1_0000_0000));
}

#[test]
fn until_end_of_file_header() {
    let header = parse(b"\0\0\0\0mdat").0.unwrap();
    assert_eq!(header.size(), BoxSize::UntilEndOfFile);
    assert_eq!(header.declared_size(), 0);
    assert_eq!(header.body_length(), None);
}

#[test]
fn extended_type_header() {
    let uuid = [
        0x6d, 0x1d, 0x9b, 0x05, 0x42, 0xd5, 0x44, 0xe6, 0x80, 0xe2, 0x14, 0x1d, 0xaf, 0xf7, 0x57, 0xb2,
    ];
    let mut bytes = b"\0\0\0\x01uuid".to_vec();
    bytes.extend_from_slice(&40u64.to_be_bytes());
    bytes.extend_from_slice(&uuid);
    let header = parse(&bytes).0.unwrap();
    assert_eq!(header.header_size(), 32);
    assert_eq!(header.extended_type(), Some(&uuid));
    assert_eq!(header.type_string(), "6d1d9b05-42d5-44e6-80e2-141daff757b2");
    assert_eq!(&header.type_bytes()[..], &uuid[..]);

    let mut compact = b"\0\0\0\x1cuuid".to_vec();
    compact.extend_from_slice(&uuid);
    let header = parse(&compact).0.unwrap();
    assert_eq!(header.header_size(), 24);
    assert_eq!(header.body_length(), Some(4));
}

#[test]
fn full_box_header_extends_header_size() {
    let bytes = b"\0\0\0\x14ispe\x01\x00\x02\x03\0\0\0\x40\0\0\0\x20";
    let mut src = std::io::Cursor::new(&bytes[..]);
    let mut range = BitstreamRange::new(&mut src, bytes.len() as u64);
    let header = BoxHeader::read(&mut range).unwrap().read_full_box_header(&mut range);
    assert_eq!(header.header_size(), 12);
    assert_eq!(header.full_box(), Some(FullBoxHeader { version: 1, flags: 0x0203 }));
    assert_eq!(header.body_length(), Some(12));
}

#[test]
fn undersized_box_is_invalid() {
    assert!(matches!(parse(b"\0\0\0\x04free").0, Err(Error::InvalidData(_))));
    let mut bytes = b"\0\0\0\x01free".to_vec();
    bytes.extend_from_slice(&8u64.to_be_bytes());
    assert!(matches!(parse(&bytes).0, Err(Error::InvalidData(_))));
}

#[test]
fn truncated_header_is_eof() {
    let (header, left) = parse(b"\0\0\0\x10ft");
    assert!(matches!(header, Err(Error::UnexpectedEOF)));
    assert_eq!(left, 0);
}
