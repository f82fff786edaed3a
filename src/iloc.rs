// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitreader::BitReader;
use log::{debug, warn};
use std::io::{Read, Seek, SeekFrom};

use crate::range::BitstreamRange;
use crate::{DecodeConfig, Result, ToU64, TryVec, START_CODE};

/// Potential sizes (in bytes) of variable-sized fields of the 'iloc' box
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

/// Any code other than 4 or 8 means the field is absent.
impl From<u8> for IlocFieldSize {
    fn from(value: u8) -> Self {
        match value {
            4 => Self::Four,
            8 => Self::Eight,
            _ => Self::Zero,
        }
    }
}

impl IlocFieldSize {
    fn read<R: Read + Seek>(self, src: &mut BitstreamRange<'_, R>) -> u64 {
        match self {
            Self::Zero => 0,
            Self::Four => src.read32().into(),
            Self::Eight => src.read64(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Relative to the item's `base_offset`.
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug)]
pub struct ItemLocationItem {
    pub item_id: u16,
    pub data_reference_index: u16,
    pub base_offset: u64,
    pub extents: TryVec<Extent>,
}

/// Item location box 'iloc'.
///
/// Every version is read with the version 0 layout: 16-bit item IDs and no
/// construction method or extent index.
#[derive(Debug)]
pub struct ItemLocationBox {
    pub(crate) offset_size: IlocFieldSize,
    pub(crate) length_size: IlocFieldSize,
    pub(crate) base_offset_size: IlocFieldSize,
    pub(crate) items: TryVec<ItemLocationItem>,
}

/// Output of reconstructing an elementary stream from 'iloc' extents.
#[derive(Debug)]
pub struct ElementaryStream {
    /// Start-code delimited units.
    pub data: TryVec<u8>,
    /// Extents whose units could not be read; none of their bytes are in `data`.
    pub failed_extents: TryVec<FailedExtent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedExtent {
    pub item_id: u16,
    /// Position in the item's extent list.
    pub extent_index: usize,
}

/// Parse an item location box inside a meta box
pub(crate) fn read_iloc<R: Read + Seek>(src: &mut BitstreamRange<'_, R>) -> Result<ItemLocationBox> {
    let sizes = src.read16().to_be_bytes();
    let mut sizes = BitReader::new(&sizes);
    let offset_size = IlocFieldSize::from(sizes.read_u8(4)?);
    let length_size = IlocFieldSize::from(sizes.read_u8(4)?);
    let base_offset_size = IlocFieldSize::from(sizes.read_u8(4)?);
    let _reserved = sizes.read_u8(4)?;

    let item_count = src.read16();
    let mut items = TryVec::new();

    for _ in 0..item_count {
        let item_id = src.read16();
        let data_reference_index = src.read16();
        let base_offset = base_offset_size.read(src);
        let mut extent_count = src.read16();

        // Without offset or length fields every extent is empty and reads
        // no bytes, so the count is not bounded by the box size.
        if offset_size == IlocFieldSize::Zero && length_size == IlocFieldSize::Zero && extent_count > 1 {
            debug!("iloc: item {item_id} has {extent_count} zero-width extents, keeping one");
            extent_count = 1;
        }

        let mut extents = TryVec::new();
        for _ in 0..extent_count {
            if src.error() {
                break;
            }
            let offset = offset_size.read(src);
            let length = length_size.read(src);
            extents.push(Extent { offset, length })?;
        }

        // A damaged item is dropped, and nothing after it can be read either.
        if src.error() {
            debug!("iloc: item {item_id} truncated");
            break;
        }
        items.push(ItemLocationItem {
            item_id,
            data_reference_index,
            base_offset,
            extents,
        })?;
    }

    Ok(ItemLocationBox {
        offset_size,
        length_size,
        base_offset_size,
        items,
    })
}

impl ItemLocationBox {
    pub fn items(&self) -> &[ItemLocationItem] {
        &self.items
    }

    pub fn item(&self, item_id: u16) -> Option<&ItemLocationItem> {
        self.items.iter().find(|item| item.item_id == item_id)
    }

    /// Byte widths of the offset, length and base offset fields.
    pub fn field_sizes(&self) -> (u8, u8, u8) {
        let bytes = |size: IlocFieldSize| match size {
            IlocFieldSize::Zero => 0,
            IlocFieldSize::Four => 4,
            IlocFieldSize::Eight => 8,
        };
        (bytes(self.offset_size), bytes(self.length_size), bytes(self.base_offset_size))
    }

    /// Convert the length-prefixed units stored in every extent of every
    /// item, in declaration order, into one start-code delimited stream.
    ///
    /// Extents are addressed by absolute position in `src`. A corrupt extent
    /// is left out of the output and listed in
    /// [`ElementaryStream::failed_extents`]; only I/O-independent failures
    /// such as running into `config.peak_memory_limit` abort the whole call.
    pub fn read_all_data<R: Read + Seek>(&self, src: &mut R, config: &DecodeConfig) -> Result<ElementaryStream> {
        let mut stream = ElementaryStream::new();
        for item in self.items.iter() {
            stream.append_item(item, src, config)?;
        }
        Ok(stream)
    }

    /// Like [`Self::read_all_data`], for a single item.
    pub fn read_item_data<R: Read + Seek>(
        &self,
        item_id: u16,
        src: &mut R,
        config: &DecodeConfig,
    ) -> Result<Option<ElementaryStream>> {
        let Some(item) = self.item(item_id) else {
            return Ok(None);
        };
        let mut stream = ElementaryStream::new();
        stream.append_item(item, src, config)?;
        Ok(Some(stream))
    }
}

impl ElementaryStream {
    fn new() -> Self {
        Self {
            data: TryVec::new(),
            failed_extents: TryVec::new(),
        }
    }

    fn append_item<R: Read + Seek>(&mut self, item: &ItemLocationItem, src: &mut R, config: &DecodeConfig) -> Result<()> {
        for (extent_index, extent) in item.extents.iter().enumerate() {
            match read_extent_units(src, item.base_offset, extent, self.data.len(), config)? {
                Some(units) => self.data.extend_from_slice(&units)?,
                None => {
                    warn!("iloc: item {} extent {extent_index} is corrupt, skipped", item.item_id);
                    self.failed_extents.push(FailedExtent {
                        item_id: item.item_id,
                        extent_index,
                    })?;
                },
            }
        }
        Ok(())
    }
}

/// Rewrite the length-prefixed units of one extent with start codes.
///
/// Returns `None` if a length prefix points past the end of the extent or
/// the source cannot supply the declared bytes.
fn read_extent_units<R: Read + Seek>(
    src: &mut R,
    base_offset: u64,
    extent: &Extent,
    already_materialized: usize,
    config: &DecodeConfig,
) -> Result<Option<TryVec<u8>>> {
    let Some(start) = base_offset.checked_add(extent.offset) else {
        return Ok(None);
    };
    if let Err(e) = src.seek(SeekFrom::Start(start)) {
        debug!("cannot seek to extent at {start}: {e}");
        return Ok(None);
    }

    let mut units = TryVec::new();
    let mut chunk = [0u8; 4096];
    let mut consumed = 0u64;
    while consumed < extent.length {
        let left = extent.length - consumed;
        if left < 4 {
            debug!("{left} trailing bytes in extent at {start}");
            return Ok(None);
        }
        let Ok(unit_length) = crate::be_u32(src).map(u64::from) else {
            return Ok(None);
        };
        if unit_length > left - 4 {
            debug!("unit of {unit_length} bytes overruns extent at {start}");
            return Ok(None);
        }

        config.reserve(already_materialized + units.len(), START_CODE.len().to_u64() + unit_length)?;
        units.extend_from_slice(&START_CODE)?;
        let mut unit_left = unit_length;
        while unit_left > 0 {
            let n = chunk.len().min(usize::try_from(unit_left).unwrap_or(usize::MAX));
            if let Err(e) = src.read_exact(&mut chunk[..n]) {
                debug!("reading extent at {start}: {e}");
                return Ok(None);
            }
            units.extend_from_slice(&chunk[..n])?;
            unit_left -= n.to_u64();
        }
        consumed += 4 + unit_length;
    }

    Ok(Some(units))
}

#[cfg(test)]
fn parse_iloc(body: &[u8]) -> (ItemLocationBox, bool) {
    let mut src = std::io::Cursor::new(body);
    let mut range = BitstreamRange::new(&mut src, body.len() as u64);
    let iloc = read_iloc(&mut range).unwrap();
    (iloc, range.error())
}

#[cfg(test)]
fn single_item_body(sizes: u16, base_offset: u64, offset: u64, length: u64) -> std::vec::Vec<u8> {
    fn field(out: &mut std::vec::Vec<u8>, code: u16, value: u64) {
        match code {
            4 => out.extend_from_slice(&(value as u32).to_be_bytes()),
            8 => out.extend_from_slice(&value.to_be_bytes()),
            _ => {},
        }
    }
    let mut body = sizes.to_be_bytes().to_vec();
    body.extend_from_slice(&1u16.to_be_bytes()); // item_count
    body.extend_from_slice(&7u16.to_be_bytes()); // item_ID
    body.extend_from_slice(&0u16.to_be_bytes()); // data_reference_index
    field(&mut body, (sizes >> 4) & 0xF, base_offset);
    body.extend_from_slice(&1u16.to_be_bytes()); // extent_count
    field(&mut body, sizes >> 12, offset);
    field(&mut body, (sizes >> 8) & 0xF, length);
    body
}

#[test]
fn iloc_field_widths() {
    for offset_code in [0u16, 4, 8] {
        for length_code in [0u16, 4, 8] {
            for base_code in [0u16, 4, 8] {
                let sizes = offset_code << 12 | length_code << 8 | base_code << 4;
                let value = |code: u16, v: u64| match code {
                    0 => 0,
                    4 => v & 0xFFFF_FFFF,
                    _ => v,
                };
                let (base, offset, length) = (0x1_2345_6789, 0x2_0000_0010, 0x3_0000_0020);
                let (iloc, error) = parse_iloc(&single_item_body(sizes, base, offset, length));
                assert!(!error, "sizes {sizes:#06x}");
                let item = &iloc.items()[0];
                assert_eq!(item.item_id, 7);
                assert_eq!(item.base_offset, value(base_code, base));
                assert_eq!(&item.extents[..], &[Extent {
                    offset: value(offset_code, offset),
                    length: value(length_code, length),
                }]);
                assert_eq!(iloc.field_sizes(), (offset_code as u8, length_code as u8, base_code as u8));
            }
        }
    }
}

#[test]
fn iloc_unknown_width_code_is_absent() {
    let (iloc, error) = parse_iloc(&single_item_body(0x4230, 0, 12, 34));
    assert!(!error);
    assert_eq!(iloc.field_sizes(), (4, 0, 0));
    assert_eq!(&iloc.items()[0].extents[..], &[Extent { offset: 12, length: 0 }]);
}

#[test]
fn iloc_zero_width_extents_are_collapsed() {
    let mut body = 0u16.to_be_bytes().to_vec();
    body.extend_from_slice(&1000u16.to_be_bytes()); // item_count
    for item_id in 1..=1000u16 {
        body.extend_from_slice(&item_id.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // data_reference_index
        body.extend_from_slice(&0xFFFFu16.to_be_bytes()); // extent_count
    }
    let (iloc, error) = parse_iloc(&body);
    assert!(!error);
    assert_eq!(iloc.items().len(), 1000);
    assert!(iloc.items().iter().all(|item| item.extents[..] == [Extent { offset: 0, length: 0 }]));
}

#[test]
fn iloc_extent_count_limited_by_box_size() {
    let mut body = single_item_body(0x4000, 0, 16, 0);
    body[8..10].copy_from_slice(&0xFFFFu16.to_be_bytes()); // extent_count
    body.extend_from_slice(&[0, 0, 0, 32]);
    let (iloc, error) = parse_iloc(&body);
    assert!(error);
    assert!(iloc.items().is_empty());
}

#[test]
fn iloc_truncated_item_is_dropped() {
    let mut body = single_item_body(0x4400, 0, 100, 10);
    body[3] = 2; // claim a second item
    body.extend_from_slice(&[0, 8, 0, 0, 0, 1, 0, 0]);
    let (iloc, error) = parse_iloc(&body);
    assert!(error);
    assert_eq!(iloc.items().len(), 1);
    assert_eq!(iloc.items()[0].item_id, 7);
}

#[cfg(test)]
fn length_prefixed(units: &[&[u8]]) -> std::vec::Vec<u8> {
    let mut out = std::vec::Vec::new();
    for unit in units {
        out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
        out.extend_from_slice(unit);
    }
    out
}

#[cfg(test)]
fn location(extents: &[(u64, u64)]) -> ItemLocationBox {
    let mut items = TryVec::new();
    let mut list = TryVec::new();
    for &(offset, length) in extents {
        list.push(Extent { offset, length }).unwrap();
    }
    items
        .push(ItemLocationItem {
            item_id: 1,
            data_reference_index: 0,
            base_offset: 4,
            extents: list,
        })
        .unwrap();
    ItemLocationBox {
        offset_size: IlocFieldSize::Four,
        length_size: IlocFieldSize::Four,
        base_offset_size: IlocFieldSize::Four,
        items,
    }
}

#[test]
fn materialize_two_units() {
    let mut file = b"junk".to_vec();
    file.extend_from_slice(&length_prefixed(&[b"\x40\x01abc", b"\x26\x01slice"]));
    let iloc = location(&[(0, file.len() as u64 - 4)]);
    let stream = iloc.read_all_data(&mut std::io::Cursor::new(&file), &DecodeConfig::default()).unwrap();
    assert_eq!(&*stream.data, b"\0\0\x01\x40\x01abc\0\0\x01\x26\x01slice");
    assert!(stream.failed_extents.is_empty());
}

#[test]
fn materialize_extents_in_order() {
    let first = length_prefixed(&[b"one"]);
    let second = length_prefixed(&[b"two"]);
    let mut file = b"hdr!".to_vec();
    file.extend_from_slice(&second);
    file.extend_from_slice(&first);
    let iloc = location(&[(second.len() as u64, first.len() as u64), (0, second.len() as u64)]);
    let stream = iloc.read_all_data(&mut std::io::Cursor::new(&file), &DecodeConfig::default()).unwrap();
    assert_eq!(&*stream.data, b"\0\0\x01one\0\0\x01two");
}

#[test]
fn corrupt_length_prefix_fails_only_its_extent() {
    let good = length_prefixed(&[b"ok"]);
    let mut file = b"....".to_vec();
    file.extend_from_slice(&good);
    file.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xF0, 1, 2, 3]);
    let iloc = location(&[(good.len() as u64, 7), (0, good.len() as u64)]);
    let stream = iloc.read_all_data(&mut std::io::Cursor::new(&file), &DecodeConfig::default()).unwrap();
    assert_eq!(&*stream.data, b"\0\0\x01ok");
    assert_eq!(&stream.failed_extents[..], &[FailedExtent { item_id: 1, extent_index: 0 }]);
}

#[test]
fn materialize_unit_larger_than_copy_chunk() {
    let unit: std::vec::Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    let mut file = b"head".to_vec();
    file.extend_from_slice(&length_prefixed(&[&unit]));
    let iloc = location(&[(0, file.len() as u64 - 4)]);
    let stream = iloc.read_all_data(&mut std::io::Cursor::new(&file), &DecodeConfig::unlimited()).unwrap();
    assert_eq!(&stream.data[..3], &START_CODE);
    assert_eq!(&stream.data[3..], &unit[..]);
}

#[test]
fn unit_cut_short_by_source_fails_its_extent() {
    let mut file = b"head".to_vec();
    file.extend_from_slice(&length_prefixed(&[&[0x11; 9000]]));
    file.truncate(5000);
    let iloc = location(&[(0, 9004)]);
    let stream = iloc.read_all_data(&mut std::io::Cursor::new(&file), &DecodeConfig::unlimited()).unwrap();
    assert!(stream.data.is_empty());
    assert_eq!(&stream.failed_extents[..], &[FailedExtent { item_id: 1, extent_index: 0 }]);
}

#[test]
fn extent_past_end_of_source_fails() {
    let file = length_prefixed(&[b"abcdef"]);
    let iloc = location(&[(0, 64)]);
    let stream = iloc.read_all_data(&mut std::io::Cursor::new(&file), &DecodeConfig::default()).unwrap();
    assert!(stream.data.is_empty());
    assert_eq!(stream.failed_extents.len(), 1);
}

#[test]
fn materialize_respects_memory_limit() {
    let mut file = b"----".to_vec();
    file.extend_from_slice(&length_prefixed(&[&[0x55; 64]]));
    let iloc = location(&[(0, 68)]);
    let config = DecodeConfig::default().with_peak_memory_limit(32);
    let result = iloc.read_all_data(&mut std::io::Cursor::new(&file), &config);
    assert!(matches!(result, Err(crate::Error::ResourceLimitExceeded(_))));
}

#[test]
fn read_item_data_unknown_item() {
    let iloc = location(&[]);
    let mut src = std::io::Cursor::new(std::vec::Vec::<u8>::new());
    assert!(iloc.read_item_data(9, &mut src, &DecodeConfig::default()).unwrap().is_none());
    assert!(iloc.read_item_data(1, &mut src, &DecodeConfig::default()).unwrap().is_some());
}
