// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::{debug, warn};
use std::io::{Read, Seek};

use crate::boxes::BoxType;
use crate::header::{BoxHeader, BoxSize};
use crate::hvcc::{read_hvcc, HevcConfigurationBox};
use crate::iloc::{read_iloc, ItemLocationBox};
use crate::items::*;
use crate::range::{BitstreamRange, ByteBudget};
use crate::{DecodeConfig, Error, Result, Stop, TryVec, Unstoppable};

/// Index of a box in its [`BoxTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxId(usize);

/// Decoded body of a box.
#[derive(Debug)]
pub enum BoxKind {
    FileType(FileTypeBox),
    Meta,
    Handler(HandlerBox),
    PrimaryItem(PrimaryItemBox),
    ItemLocation(ItemLocationBox),
    ItemInfo(ItemInfoBox),
    ItemInfoEntry(ItemInfoEntry),
    ItemReference(ItemReferenceBox),
    ItemData(ItemDataBox),
    ItemProperties,
    ItemPropertyContainer,
    ItemPropertyAssociation(ItemPropertyAssociationBox),
    ImageSpatialExtents(ImageSpatialExtents),
    PixelInformation(PixelInformationBox),
    HevcConfiguration(HevcConfigurationBox),
    /// Unknown types, boxes with nothing to decode, and boxes nested too
    /// deep. The body is skipped.
    Generic,
}

/// One box of a [`BoxTree`].
#[derive(Debug)]
pub struct BoxNode {
    header: BoxHeader,
    kind: BoxKind,
    children: TryVec<BoxId>,
    truncated: bool,
}

macro_rules! typed_accessors {
    ($($(#[$attr:meta])* $name:ident => $variant:ident($ty:ty)),*,) => {
        $(
            $(#[$attr])*
            pub fn $name(&self) -> Option<&$ty> {
                match &self.kind {
                    BoxKind::$variant(b) => Some(b),
                    _ => None,
                }
            }
        )*
    };
}

impl BoxNode {
    /// The header, including version and flags for full boxes.
    pub fn header(&self) -> &BoxHeader {
        &self.header
    }

    pub fn box_type(&self) -> BoxType {
        self.header.box_type()
    }

    pub fn kind(&self) -> &BoxKind {
        &self.kind
    }

    pub fn children(&self) -> &[BoxId] {
        &self.children
    }

    /// The body ended, or the source ran out, before all fields were read.
    /// Fields that could not be read are zero or empty.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    typed_accessors! {
        as_ftyp => FileType(FileTypeBox),
        as_hdlr => Handler(HandlerBox),
        as_pitm => PrimaryItem(PrimaryItemBox),
        as_iloc => ItemLocation(ItemLocationBox),
        as_iinf => ItemInfo(ItemInfoBox),
        as_infe => ItemInfoEntry(ItemInfoEntry),
        as_iref => ItemReference(ItemReferenceBox),
        as_idat => ItemData(ItemDataBox),
        as_ipma => ItemPropertyAssociation(ItemPropertyAssociationBox),
        as_ispe => ImageSpatialExtents(ImageSpatialExtents),
        as_pixi => PixelInformation(PixelInformationBox),
        as_hvcc => HevcConfiguration(HevcConfigurationBox),
    }
}

/// All boxes of a file, in an arena addressed by [`BoxId`].
///
/// Decoding is best effort: a truncated or malformed file still yields
/// every box that could be read, and [`BoxTree::status`] and
/// [`BoxTree::error`] tell whether anything went missing.
#[derive(Debug)]
pub struct BoxTree {
    nodes: TryVec<BoxNode>,
    top_level: TryVec<BoxId>,
    status: ByteBudget,
    first_error: Option<Error>,
}

impl BoxTree {
    /// Decode every box from the current position of `src` to its end.
    pub fn from_reader<R: Read + Seek>(src: &mut R) -> Result<Self> {
        Self::from_reader_with_config(src, &DecodeConfig::default(), &Unstoppable)
    }

    /// Like [`Self::from_reader`], with resource limits and cooperative
    /// cancellation. `stop` is checked before every box.
    pub fn from_reader_with_config<R: Read + Seek>(src: &mut R, config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        let mut range = BitstreamRange::from_source(src)?;
        Self::from_range(&mut range, config, stop)
    }

    /// Decode the boxes that fill the current budget of `range`.
    ///
    /// Returns `Err` only for allocation failure and cancellation. Running
    /// out of data is not an error here.
    pub fn from_range<R: Read + Seek>(range: &mut BitstreamRange<'_, R>, config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        let mut parser = BoxParser {
            nodes: TryVec::new(),
            config,
            stop,
            first_error: None,
        };
        let top_level = parser.read_children(range, 0)?;
        if let Some(e) = &parser.first_error {
            debug!("box tree decoded with errors, first: {e}");
        }
        Ok(Self {
            nodes: parser.nodes,
            top_level,
            status: *range.budget(),
            first_error: parser.first_error,
        })
    }

    pub fn get(&self, id: BoxId) -> Option<&BoxNode> {
        self.nodes.get(id.0)
    }

    /// Number of boxes at all levels.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Boxes at the top of the file, in stream order.
    pub fn top_level(&self) -> &[BoxId] {
        &self.top_level
    }

    /// Direct children of `id` in stream order. Empty for an unknown id.
    pub fn children(&self, id: BoxId) -> &[BoxId] {
        self.get(id).map_or(&[], |node| node.children())
    }

    /// First direct child of `parent` with the given type.
    pub fn get_child_box(&self, parent: BoxId, box_type: impl Into<BoxType>) -> Option<BoxId> {
        let box_type = box_type.into();
        self.first_of_type(self.children(parent), box_type)
    }

    /// First top-level box with the given type.
    pub fn find_top_level(&self, box_type: impl Into<BoxType>) -> Option<BoxId> {
        self.first_of_type(&self.top_level, box_type.into())
    }

    fn first_of_type(&self, ids: &[BoxId], box_type: BoxType) -> Option<BoxId> {
        ids.iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|node| node.box_type() == box_type))
    }

    /// Follow a chain of types from the top level, taking the first match at
    /// each step.
    pub fn find_path(&self, path: &[BoxType]) -> Option<BoxId> {
        let (&first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.find_top_level(first)?, |id, &box_type| self.get_child_box(id, box_type))
    }

    /// State of the outermost range after decoding. `error()` is set if the
    /// source ended before the last declared box did.
    pub fn status(&self) -> ByteBudget {
        self.status
    }

    /// The first problem met while decoding, if any.
    pub fn error(&self) -> Option<&Error> {
        self.first_error.as_ref()
    }

    /// The primary item ID from 'meta'/'pitm'.
    pub fn primary_item_id(&self) -> Option<u16> {
        let pitm = self.find_path(&[BoxType::MetadataBox, BoxType::PrimaryItemBox])?;
        self.get(pitm)?.as_pitm().map(|pitm| pitm.item_id)
    }

    /// The item location table from 'meta'/'iloc'.
    pub fn item_locations(&self) -> Option<&ItemLocationBox> {
        let iloc = self.find_path(&[BoxType::MetadataBox, BoxType::ItemLocationBox])?;
        self.get(iloc)?.as_iloc()
    }

    /// Properties associated with `item_id` through 'ipma', in association
    /// order, with their essential flag. Indices that do not name an 'ipco'
    /// child are left out.
    pub fn item_properties(&self, item_id: u32) -> impl Iterator<Item = (BoxId, bool)> + '_ {
        let iprp = self.find_path(&[BoxType::MetadataBox, BoxType::ItemPropertiesBox]);
        let ipco = iprp.and_then(|iprp| self.get_child_box(iprp, BoxType::ItemPropertyContainerBox));
        let properties = ipco.map_or(&[][..], |ipco| self.children(ipco));
        let ipma = iprp
            .into_iter()
            .flat_map(move |iprp| self.children(iprp).iter())
            .filter_map(move |&id| self.get(id)?.as_ipma());

        ipma.flat_map(|ipma| ipma.entries.iter())
            .filter(move |entry| entry.item_id == item_id)
            .flat_map(|entry| entry.associations.iter())
            .filter_map(move |association| {
                // 1-based; 0 means no property
                let index = usize::from(association.property_index).checked_sub(1)?;
                properties.get(index).map(|&id| (id, association.essential))
            })
    }
}

struct BoxParser<'a> {
    nodes: TryVec<BoxNode>,
    config: &'a DecodeConfig,
    stop: &'a dyn Stop,
    first_error: Option<Error>,
}

impl BoxParser<'_> {
    fn note(&mut self, e: Error) {
        if self.first_error.is_none() {
            self.first_error = Some(e);
        }
    }

    /// Read boxes until the current range is used up. Boxes that fail to
    /// decode are left out.
    fn read_children<R: Read + Seek>(&mut self, src: &mut BitstreamRange<'_, R>, depth: u32) -> Result<TryVec<BoxId>> {
        let mut children = TryVec::new();
        while !src.eof() {
            self.stop.check()?;
            if let Some(id) = self.read_box(src, depth + 1)? {
                children.push(id)?;
            }
        }
        Ok(children)
    }

    fn read_box<R: Read + Seek>(&mut self, src: &mut BitstreamRange<'_, R>, depth: u32) -> Result<Option<BoxId>> {
        let header = match BoxHeader::read(src) {
            Ok(header) => header,
            Err(e) => {
                if let Error::InvalidData(msg) = &e {
                    // Without a usable size nothing after this box can be located
                    warn!("{msg}, abandoning the rest of the enclosing range");
                    src.abandon();
                }
                self.note(e);
                return Ok(None);
            },
        };

        let body_length = header.body_length().unwrap_or_else(|| src.remaining());
        let clamped = body_length > src.remaining();
        src.push_child(body_length)?;
        let decoded = if depth > self.config.max_box_depth {
            warn!("'{}' box at nesting level {depth} is too deep, skipped", header.fourcc());
            self.note(Error::ResourceLimitExceeded("box nesting depth limit exceeded"));
            skip_body(src, &header);
            Ok((header, BoxKind::Generic, TryVec::new()))
        } else {
            self.decode_body(src, header, depth)
        };
        let body = src.pop_child();
        let (header, kind, children) = decoded?;

        let truncated = clamped || body.error();
        if truncated {
            debug!("'{}' box is truncated", header.fourcc());
            self.note(Error::UnexpectedEOF);
        }

        let id = BoxId(self.nodes.len());
        self.nodes.push(BoxNode {
            header,
            kind,
            children,
            truncated,
        })?;
        Ok(Some(id))
    }

    fn decode_body<R: Read + Seek>(
        &mut self,
        src: &mut BitstreamRange<'_, R>,
        header: BoxHeader,
        depth: u32,
    ) -> Result<(BoxHeader, BoxKind, TryVec<BoxId>)> {
        let mut children = TryVec::new();
        let (header, kind) = match header.box_type() {
            BoxType::FileTypeBox => (header, BoxKind::FileType(read_ftyp(src)?)),
            BoxType::MetadataBox => {
                let header = header.read_full_box_header(src);
                children = self.read_children(src, depth)?;
                (header, BoxKind::Meta)
            },
            BoxType::HandlerBox => {
                let header = header.read_full_box_header(src);
                (header, BoxKind::Handler(read_hdlr(src)?))
            },
            BoxType::PrimaryItemBox => {
                let header = header.read_full_box_header(src);
                (header, BoxKind::PrimaryItem(read_pitm(src)))
            },
            BoxType::ItemLocationBox => {
                let header = header.read_full_box_header(src);
                (header, BoxKind::ItemLocation(read_iloc(src)?))
            },
            BoxType::ItemInfoBox => {
                let header = header.read_full_box_header(src);
                let iinf = read_iinf(src, header.version());
                children = self.read_children(src, depth)?;
                (header, BoxKind::ItemInfo(iinf))
            },
            BoxType::ItemInfoEntry => {
                let header = header.read_full_box_header(src);
                (header, BoxKind::ItemInfoEntry(read_infe(src, header.version())?))
            },
            BoxType::ItemReferenceBox => {
                let header = header.read_full_box_header(src);
                (header, BoxKind::ItemReference(read_iref(src, header.version())?))
            },
            BoxType::ItemDataBox => (header, BoxKind::ItemData(read_idat(src)?)),
            BoxType::ItemPropertiesBox => {
                children = self.read_children(src, depth)?;
                (header, BoxKind::ItemProperties)
            },
            BoxType::ItemPropertyContainerBox => {
                children = self.read_children(src, depth)?;
                (header, BoxKind::ItemPropertyContainer)
            },
            BoxType::ItemPropertyAssociationBox => {
                let header = header.read_full_box_header(src);
                let ipma = read_ipma(src, header.version(), header.flags())?;
                (header, BoxKind::ItemPropertyAssociation(ipma))
            },
            BoxType::ImageSpatialExtentsBox => {
                let header = header.read_full_box_header(src);
                (header, BoxKind::ImageSpatialExtents(read_ispe(src)))
            },
            BoxType::PixelInformationBox => {
                let header = header.read_full_box_header(src);
                (header, BoxKind::PixelInformation(read_pixi(src)))
            },
            BoxType::HevcConfigurationBox => (header, BoxKind::HevcConfiguration(read_hvcc(src)?)),
            _ => {
                skip_body(src, &header);
                (header, BoxKind::Generic)
            },
        };
        Ok((header, kind, children))
    }
}

fn skip_body<R: Read + Seek>(src: &mut BitstreamRange<'_, R>, header: &BoxHeader) {
    match header.size() {
        BoxSize::UntilEndOfFile => src.skip_to_end_of_file(),
        BoxSize::Fixed(_) => src.skip_to_end_of_box(),
    }
}

#[cfg(test)]
fn boxed(name: &[u8; 4], body: &[u8]) -> std::vec::Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
fn full(version: u8, flags: u32, body: &[u8]) -> std::vec::Vec<u8> {
    let mut out = (u32::from(version) << 24 | flags).to_be_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
fn decode(bytes: &[u8], config: &DecodeConfig) -> BoxTree {
    BoxTree::from_reader_with_config(&mut std::io::Cursor::new(bytes), config, &Unstoppable).unwrap()
}

#[test]
fn siblings_and_containers() {
    let ispe = boxed(b"ispe", &full(0, 0, &[0, 0, 1, 0, 0, 0, 0, 0x80]));
    let ipco = boxed(b"ipco", &ispe);
    let iprp = boxed(b"iprp", &ipco);
    let pitm = boxed(b"pitm", &full(0, 0, &[0, 1]));
    let mut meta_body = full(0, 0, &pitm);
    meta_body.extend_from_slice(&iprp);
    let mut file = boxed(b"ftyp", b"heic\0\0\0\0mif1");
    file.extend_from_slice(&boxed(b"meta", &meta_body));

    let tree = decode(&file, &DecodeConfig::default());
    assert!(tree.error().is_none());
    assert!(tree.status().eof());
    assert!(!tree.status().error());
    assert_eq!(tree.top_level().len(), 2);
    assert_eq!(tree.len(), 6);

    let meta = tree.find_top_level(*b"meta").unwrap();
    assert_eq!(tree.get(meta).unwrap().header().header_size(), 12);
    assert_eq!(tree.children(meta).len(), 2);
    assert_eq!(tree.primary_item_id(), Some(1));

    let ispe = tree
        .find_path(&[BoxType::MetadataBox, BoxType::ItemPropertiesBox, BoxType::ItemPropertyContainerBox, BoxType::ImageSpatialExtentsBox])
        .unwrap();
    assert_eq!(tree.get(ispe).unwrap().as_ispe(), Some(&ImageSpatialExtents { width: 256, height: 128 }));
    assert!(tree.get_child_box(meta, *b"iloc").is_none());
}

#[test]
fn unread_body_is_skipped() {
    // 'pitm' with two trailing bytes that are not part of any field
    let mut file = boxed(b"pitm", &full(0, 0, &[0, 7, 0xAA, 0xBB]));
    file.extend_from_slice(&boxed(b"free", b""));
    let tree = decode(&file, &DecodeConfig::default());
    assert!(tree.error().is_none());
    let kinds: std::vec::Vec<BoxType> = tree.top_level().iter().map(|&id| tree.get(id).unwrap().box_type()).collect();
    assert_eq!(kinds, [BoxType::PrimaryItemBox, BoxType::FreeSpaceBox]);
}

#[test]
fn malformed_size_abandons_parent() {
    let mut meta_body = full(0, 0, &boxed(b"pitm", &full(0, 0, &[0, 1])));
    meta_body.extend_from_slice(&[0, 0, 0, 3, b'b', b'a', b'd', b'!']);
    meta_body.extend_from_slice(&boxed(b"free", b"lost"));
    let mut file = boxed(b"meta", &meta_body);
    file.extend_from_slice(&boxed(b"skip", b""));

    let tree = decode(&file, &DecodeConfig::default());
    assert!(matches!(tree.error(), Some(Error::InvalidData(_))));
    let meta = tree.find_top_level(*b"meta").unwrap();
    assert_eq!(tree.children(meta).len(), 1);
    assert!(tree.get(meta).unwrap().is_truncated());
    // The sibling after the damaged 'meta' is still found
    assert!(tree.find_top_level(*b"skip").is_some());
}

#[test]
fn depth_limit_turns_deep_boxes_generic() {
    let ispe = boxed(b"ispe", &full(0, 0, &[0, 0, 0, 1, 0, 0, 0, 1]));
    let file = boxed(b"iprp", &boxed(b"ipco", &ispe));

    let tree = decode(&file, &DecodeConfig::default().with_max_box_depth(2));
    assert!(matches!(tree.error(), Some(Error::ResourceLimitExceeded(_))));
    let ispe = tree.find_path(&[BoxType::ItemPropertiesBox, BoxType::ItemPropertyContainerBox, BoxType::ImageSpatialExtentsBox]).unwrap();
    assert!(matches!(tree.get(ispe).unwrap().kind(), BoxKind::Generic));

    let tree = decode(&file, &DecodeConfig::default().with_max_box_depth(3));
    assert!(tree.error().is_none());
}

#[test]
fn until_end_of_file_box() {
    let mut file = boxed(b"ftyp", b"heic\0\0\0\0");
    file.extend_from_slice(b"\0\0\0\0mdat");
    file.extend_from_slice(&[0x55; 100]);
    let tree = decode(&file, &DecodeConfig::default());
    assert!(tree.error().is_none());
    let mdat = tree.find_top_level(*b"mdat").unwrap();
    assert!(matches!(tree.get(mdat).unwrap().kind(), BoxKind::Generic));
    assert!(tree.status().eof());
}

#[test]
fn item_properties_follow_ipma() {
    let mut ipco_body = boxed(b"ispe", &full(0, 0, &[0, 0, 0, 8, 0, 0, 0, 8]));
    ipco_body.extend_from_slice(&boxed(b"pixi", &full(0, 0, &[3, 8, 8, 8])));
    let mut ipma_body = 2u32.to_be_bytes().to_vec();
    ipma_body.extend_from_slice(&[0, 1, 3, 0x82, 0x01, 0x05]); // item 1: 2 (essential), 1, 5 (dangling)
    ipma_body.extend_from_slice(&[0, 2, 1, 0x00]); // item 2: no property
    let mut iprp_body = boxed(b"ipco", &ipco_body);
    iprp_body.extend_from_slice(&boxed(b"ipma", &full(0, 0, &ipma_body)));
    let file = boxed(b"meta", &full(0, 0, &boxed(b"iprp", &iprp_body)));

    let tree = decode(&file, &DecodeConfig::default());
    assert!(tree.error().is_none());
    let props: std::vec::Vec<(BoxType, bool)> = tree
        .item_properties(1)
        .map(|(id, essential)| (tree.get(id).unwrap().box_type(), essential))
        .collect();
    assert_eq!(props, [(BoxType::PixelInformationBox, true), (BoxType::ImageSpatialExtentsBox, false)]);
    assert_eq!(tree.item_properties(2).count(), 0);
}
