// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoders for the fixed-layout boxes found under 'meta'.

use arrayvec::ArrayVec;
use bitreader::BitReader;
use log::{debug, warn};
use std::borrow::Cow;
use std::io::{Read, Seek};

use crate::boxes::FourCC;
use crate::header::BoxHeader;
use crate::range::BitstreamRange;
use crate::{Result, TryString, TryVec};

fn lossy(s: &TryString) -> Cow<'_, str> {
    std::string::String::from_utf8_lossy(s)
}

/// File type box 'ftyp'.
/// See ISO 14496-12:2015 § 4.3
#[derive(Debug)]
pub struct FileTypeBox {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: TryVec<FourCC>,
}

/// Handler reference box 'hdlr'.
/// See ISO 14496-12:2015 § 8.4.3
#[derive(Debug)]
pub struct HandlerBox {
    pub pre_defined: u32,
    pub handler_type: FourCC,
    pub reserved: [u32; 3],
    pub name: TryString,
}

impl HandlerBox {
    pub fn name(&self) -> Cow<'_, str> {
        lossy(&self.name)
    }
}

/// Primary item box 'pitm'.
///
/// The item ID is always read as 16 bits, including in version 1 boxes
/// where ISO 14496-12 widens it to 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryItemBox {
    pub item_id: u16,
}

/// Item information box 'iinf'. The entries are its 'infe' children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfoBox {
    /// Declared entry count. Not checked against the children.
    pub entry_count: u32,
}

/// Used for 'infe' boxes within 'iinf' boxes
/// See ISO 14496-12:2015 § 8.11.6
#[derive(Debug)]
pub struct ItemInfoEntry {
    pub item_id: u32,
    pub item_protection_index: u16,
    /// Only present in version 2+ entries with a non-zero type.
    pub item_type: Option<FourCC>,
    pub item_name: TryString,
    pub content_type: TryString,
    pub content_encoding: TryString,
    pub item_uri_type: TryString,
}

impl ItemInfoEntry {
    pub fn item_name(&self) -> Cow<'_, str> {
        lossy(&self.item_name)
    }

    pub fn content_type(&self) -> Cow<'_, str> {
        lossy(&self.content_type)
    }

    pub fn content_encoding(&self) -> Cow<'_, str> {
        lossy(&self.content_encoding)
    }

    pub fn item_uri_type(&self) -> Cow<'_, str> {
        lossy(&self.item_uri_type)
    }
}

/// Image spatial extents (dimensions)
/// See ISO/IEC 23008-12:2017 § 6.5.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpatialExtents {
    pub width: u32,
    pub height: u32,
}

/// See ISO 14496-12:2015 § 8.11.12
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleItemTypeReference {
    pub reference_type: FourCC,
    pub from_item_id: u32,
    pub to_item_id: u32,
    /// Position of this reference among those of the same type from the same item
    pub reference_index: u16,
}

/// Item reference box 'iref', flattened.
#[derive(Debug)]
pub struct ItemReferenceBox {
    pub references: TryVec<SingleItemTypeReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyAssociation {
    pub essential: bool,
    /// 1-based index into the 'ipco' children; 0 means no property.
    pub property_index: u16,
}

#[derive(Debug)]
pub struct ItemPropertyAssociations {
    pub item_id: u32,
    pub associations: TryVec<PropertyAssociation>,
}

/// Item property association box 'ipma'.
/// See ISO/IEC 23008-12:2017 § 9.3.1
#[derive(Debug)]
pub struct ItemPropertyAssociationBox {
    pub entries: TryVec<ItemPropertyAssociations>,
}

/// Pixel information property 'pixi'.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelInformationBox {
    pub bits_per_channel: ArrayVec<u8, 16>,
}

/// Item data box 'idat'.
#[derive(Debug)]
pub struct ItemDataBox {
    pub data: TryVec<u8>,
}

const MIME: u32 = 0x6d69_6d65; // "mime"
const URI: u32 = 0x7572_6920; // "uri "

/// Parse an ftyp box.
/// The compatible brands fill whatever the range has left after the first two fields.
pub(crate) fn read_ftyp<R: Read + Seek>(src: &mut BitstreamRange<'_, R>) -> Result<FileTypeBox> {
    let major = src.read32();
    let minor = src.read32();
    let brand_count = src.remaining() / 4;
    let mut brands = TryVec::new();
    for _ in 0..brand_count {
        brands.push(src.read32().into())?;
    }
    Ok(FileTypeBox {
        major_brand: From::from(major),
        minor_version: minor,
        compatible_brands: brands,
    })
}

pub(crate) fn read_hdlr<R: Read + Seek>(src: &mut BitstreamRange<'_, R>) -> Result<HandlerBox> {
    let pre_defined = src.read32();
    let handler_type = src.read32().into();
    let reserved = [src.read32(), src.read32(), src.read32()];
    let name = src.read_string()?;
    Ok(HandlerBox { pre_defined, handler_type, reserved, name })
}

pub(crate) fn read_pitm<R: Read + Seek>(src: &mut BitstreamRange<'_, R>) -> PrimaryItemBox {
    PrimaryItemBox { item_id: src.read16() }
}

/// Parse an Item Info Entry
/// See ISO 14496-12:2015 § 8.11.6.2
pub(crate) fn read_infe<R: Read + Seek>(src: &mut BitstreamRange<'_, R>, version: u8) -> Result<ItemInfoEntry> {
    let mut entry = ItemInfoEntry {
        item_id: 0,
        item_protection_index: 0,
        item_type: None,
        item_name: TryVec::new(),
        content_type: TryVec::new(),
        content_encoding: TryVec::new(),
        item_uri_type: TryVec::new(),
    };

    if version <= 1 {
        entry.item_id = src.read16().into();
        entry.item_protection_index = src.read16();
        entry.item_name = src.read_string()?;
        entry.content_type = src.read_string()?;
        entry.content_encoding = src.read_string()?;
        return Ok(entry);
    }

    entry.item_id = if version == 2 { src.read16().into() } else { src.read32() };
    entry.item_protection_index = src.read16();
    let item_type = src.read32();
    entry.item_name = src.read_string()?;
    match item_type {
        MIME => {
            entry.content_type = src.read_string()?;
            entry.content_encoding = src.read_string()?;
        },
        URI => entry.item_uri_type = src.read_string()?,
        _ => {},
    }
    if item_type != 0 {
        entry.item_type = Some(item_type.into());
    }
    debug!("infe item_id {} item_type: {:?}", entry.item_id, entry.item_type);

    Ok(entry)
}

/// The entry count of an 'iinf'; 16 bits wide in version 0, 32 bits otherwise.
pub(crate) fn read_iinf<R: Read + Seek>(src: &mut BitstreamRange<'_, R>, version: u8) -> ItemInfoBox {
    ItemInfoBox { entry_count: read_version_sized(src, version) }
}

/// Parse an Image Spatial Extents property box
pub(crate) fn read_ispe<R: Read + Seek>(src: &mut BitstreamRange<'_, R>) -> ImageSpatialExtents {
    let width = src.read32();
    let height = src.read32();
    ImageSpatialExtents { width, height }
}

/// 16 bits wide in version 0 boxes, 32 bits otherwise.
fn read_version_sized<R: Read + Seek>(src: &mut BitstreamRange<'_, R>, version: u8) -> u32 {
    if version == 0 { src.read16().into() } else { src.read32() }
}

/// Parse an item reference box. Each child box is one reference list whose
/// box type is the reference type.
pub(crate) fn read_iref<R: Read + Seek>(src: &mut BitstreamRange<'_, R>, version: u8) -> Result<ItemReferenceBox> {
    let mut references = TryVec::new();

    while !src.eof() {
        let header = match BoxHeader::read(src) {
            Ok(header) => header,
            Err(e) => {
                warn!("iref: {e}");
                src.abandon();
                break;
            },
        };
        let body_length = header.body_length().unwrap_or_else(|| src.remaining());
        src.push_child(body_length)?;
        let pushed = read_reference_list(src, &header, version, &mut references);
        src.pop_child();
        pushed?;
    }

    Ok(ItemReferenceBox { references })
}

fn read_reference_list<R: Read + Seek>(
    src: &mut BitstreamRange<'_, R>,
    header: &BoxHeader,
    version: u8,
    references: &mut TryVec<SingleItemTypeReference>,
) -> Result<()> {
    let from_item_id = read_version_sized(src, version);
    let reference_count = src.read16();
    for reference_index in 0..reference_count {
        let to_item_id = read_version_sized(src, version);
        if src.error() {
            break;
        }
        references.push(SingleItemTypeReference {
            reference_type: header.fourcc(),
            from_item_id,
            to_item_id,
            reference_index,
        })?;
    }
    Ok(())
}

pub(crate) fn read_ipma<R: Read + Seek>(
    src: &mut BitstreamRange<'_, R>,
    version: u8,
    flags: u32,
) -> Result<ItemPropertyAssociationBox> {
    let mut entries = TryVec::new();

    let entry_count = src.read32();
    for _ in 0..entry_count {
        let item_id = read_version_sized(src, version);
        let association_count = src.read_u8();
        let mut associations = TryVec::new();
        for _ in 0..association_count {
            let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };
            let association = &mut [0; 2][..num_association_bytes];
            src.read_exact_into(association);
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let property_index = association.read_u16(association.remaining().try_into()?)?;
            associations.push(PropertyAssociation { essential, property_index })?;
        }
        if src.error() {
            break;
        }
        entries.push(ItemPropertyAssociations { item_id, associations })?;
    }

    Ok(ItemPropertyAssociationBox { entries })
}

/// Channels past the sixteenth are read but not kept.
pub(crate) fn read_pixi<R: Read + Seek>(src: &mut BitstreamRange<'_, R>) -> PixelInformationBox {
    let num_channels = src.read_u8();
    let mut bits_per_channel = ArrayVec::new();
    for _ in 0..num_channels {
        let bits = src.read_u8();
        if src.error() {
            break;
        }
        if bits_per_channel.try_push(bits).is_err() {
            debug!("pixi: dropping channel beyond {}", bits_per_channel.capacity());
        }
    }
    PixelInformationBox { bits_per_channel }
}

pub(crate) fn read_idat<R: Read + Seek>(src: &mut BitstreamRange<'_, R>) -> Result<ItemDataBox> {
    let len = src.remaining();
    Ok(ItemDataBox { data: src.read_vec(len)? })
}

#[cfg(test)]
fn with_range<T>(bytes: &[u8], f: impl FnOnce(&mut BitstreamRange<'_, std::io::Cursor<&[u8]>>) -> T) -> (T, bool) {
    let mut src = std::io::Cursor::new(bytes);
    let mut range = BitstreamRange::new(&mut src, bytes.len() as u64);
    let out = f(&mut range);
    (out, range.error())
}

#[test]
fn ftyp_brands_fill_body() {
    let (ftyp, error) = with_range(b"heic\0\0\0\x01mif1heicmiaf", |r| read_ftyp(r).unwrap());
    assert!(!error);
    assert_eq!(ftyp.major_brand, b"heic");
    assert_eq!(ftyp.minor_version, 1);
    let brands: std::vec::Vec<FourCC> = ftyp.compatible_brands.iter().copied().collect();
    assert_eq!(brands, [FourCC::from(*b"mif1"), FourCC::from(*b"heic"), FourCC::from(*b"miaf")]);
}

#[test]
fn hdlr_fields() {
    let bytes = b"\0\0\0\0pict\0\0\0\x01\0\0\0\x02\0\0\0\x03libheif\0";
    let (hdlr, error) = with_range(bytes, |r| read_hdlr(r).unwrap());
    assert!(!error);
    assert_eq!(hdlr.handler_type, b"pict");
    assert_eq!(hdlr.reserved, [1, 2, 3]);
    assert_eq!(hdlr.name(), "libheif");
}

#[test]
fn infe_version_0_and_1_strings() {
    for version in [0, 1] {
        let bytes = b"\0\x07\0\x01name\0text/plain\0gzip\0";
        let (infe, error) = with_range(bytes, |r| read_infe(r, version).unwrap());
        assert!(!error);
        assert_eq!(infe.item_id, 7);
        assert_eq!(infe.item_protection_index, 1);
        assert_eq!(infe.item_name(), "name");
        assert_eq!(infe.content_type(), "text/plain");
        assert_eq!(infe.content_encoding(), "gzip");
        assert_eq!(infe.item_type, None);
        assert!(infe.item_uri_type.is_empty());
    }
}

#[test]
fn infe_version_2_without_type() {
    let (infe, error) = with_range(b"\0\x02\0\0\0\0\0\0img\0", |r| read_infe(r, 2).unwrap());
    assert!(!error);
    assert_eq!(infe.item_id, 2);
    assert_eq!(infe.item_type, None);
    assert_eq!(infe.item_name(), "img");
    assert!(infe.content_type.is_empty());
    assert!(infe.content_encoding.is_empty());
    assert!(infe.item_uri_type.is_empty());
}

#[test]
fn infe_version_2_hvc1() {
    let (infe, error) = with_range(b"\0\x01\0\0hvc1\0", |r| read_infe(r, 2).unwrap());
    assert!(!error);
    assert_eq!(infe.item_type, Some(FourCC::from(*b"hvc1")));
    assert!(infe.item_name.is_empty());
}

#[test]
fn infe_version_3_mime() {
    let bytes = b"\x00\x01\x00\x05\0\0mimeExif\0application/rdf+xml\0deflate\0";
    let (infe, error) = with_range(bytes, |r| read_infe(r, 3).unwrap());
    assert!(!error);
    assert_eq!(infe.item_id, 0x0001_0005);
    assert_eq!(infe.item_type, Some(FourCC::from(*b"mime")));
    assert_eq!(infe.item_name(), "Exif");
    assert_eq!(infe.content_type(), "application/rdf+xml");
    assert_eq!(infe.content_encoding(), "deflate");
    assert!(infe.item_uri_type.is_empty());
}

#[test]
fn infe_version_2_uri() {
    let bytes = b"\0\x09\0\0uri meta\0urn:mpeg:hevc\0";
    let (infe, error) = with_range(bytes, |r| read_infe(r, 2).unwrap());
    assert!(!error);
    assert_eq!(infe.item_type, Some(FourCC::from(*b"uri ")));
    assert_eq!(infe.item_name(), "meta");
    assert_eq!(infe.item_uri_type(), "urn:mpeg:hevc");
    assert!(infe.content_type.is_empty());
}

#[test]
fn pitm_ignores_version_width() {
    // A version 1 'pitm' carries a 32-bit ID. Only the high half is read.
    let (pitm, _) = with_range(b"\0\x01\0\x02", |r| read_pitm(r));
    assert_eq!(pitm.item_id, 1);
}

#[test]
fn iinf_count_width() {
    assert_eq!(with_range(b"\0\x03", |r| read_iinf(r, 0)).0.entry_count, 3);
    assert_eq!(with_range(b"\0\x01\0\x03", |r| read_iinf(r, 1)).0.entry_count, 0x0001_0003);
}

#[test]
fn iref_references() {
    let bytes = b"\0\0\0\x0edimg\0\x01\0\x01\0\x02\0\0\0\x10thmb\0\x03\0\x02\0\x01\0\x02";
    let (iref, error) = with_range(bytes, |r| read_iref(r, 0).unwrap());
    assert!(!error);
    let refs: std::vec::Vec<_> = iref.references.iter().map(|r| (r.reference_type, r.from_item_id, r.to_item_id, r.reference_index)).collect();
    assert_eq!(refs, [
        (FourCC::from(*b"dimg"), 1, 2, 0),
        (FourCC::from(*b"thmb"), 3, 1, 0),
        (FourCC::from(*b"thmb"), 3, 2, 1),
    ]);
}

#[test]
fn iref_list_running_to_end_of_box() {
    let bytes = b"\0\0\0\x0cdimg\0\x01\0\0\0\0\0\0auxl\0\x05\0\x01\0\x01";
    let (iref, error) = with_range(bytes, |r| {
        let iref = read_iref(r, 0).unwrap();
        assert_eq!(r.remaining(), 0);
        iref
    });
    assert!(!error);
    assert_eq!(iref.references.len(), 1);
    let r = &iref.references[0];
    assert_eq!((r.reference_type, r.from_item_id, r.to_item_id), (FourCC::from(*b"auxl"), 5, 1));
}

#[test]
fn ipma_small_and_large_indices() {
    let (ipma, error) = with_range(b"\0\0\0\x01\0\x01\x02\x81\x02", |r| read_ipma(r, 0, 0).unwrap());
    assert!(!error);
    let entry = &ipma.entries[0];
    assert_eq!(entry.item_id, 1);
    assert_eq!(&entry.associations[..], &[
        PropertyAssociation { essential: true, property_index: 1 },
        PropertyAssociation { essential: false, property_index: 2 },
    ]);

    let (ipma, _) = with_range(b"\0\0\0\x01\0\0\0\x09\x01\x81\x00", |r| read_ipma(r, 1, 1).unwrap());
    assert_eq!(ipma.entries[0].item_id, 9);
    assert_eq!(&ipma.entries[0].associations[..], &[PropertyAssociation { essential: true, property_index: 0x100 }]);
}

#[test]
fn pixi_channels() {
    let (pixi, error) = with_range(b"\x03\x08\x08\x08", |r| read_pixi(r));
    assert!(!error);
    assert_eq!(&pixi.bits_per_channel[..], &[8, 8, 8]);
}

#[test]
fn truncated_infe_strings_are_empty() {
    let (infe, error) = with_range(b"\0\x01\0\0\0\0\0\0unterminated", |r| read_infe(r, 2).unwrap());
    assert!(error);
    assert_eq!(infe.item_id, 1);
    assert!(infe.item_name.is_empty());
}
