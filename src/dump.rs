// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Human readable rendering of a [`BoxTree`], for inspection only.

use std::fmt;

use crate::header::BoxHeader;
use crate::hvcc::HevcConfigurationBox;
use crate::iloc::ItemLocationBox;
use crate::tree::{BoxId, BoxKind, BoxNode, BoxTree};

/// Writes lines at a fixed indentation.
struct Indented<'a, 'b> {
    f: &'a mut fmt::Formatter<'b>,
    depth: usize,
}

impl Indented<'_, '_> {
    fn line(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        writeln!(self.f, "{:width$}{args}", "", width = 2 * self.depth)
    }
}

impl fmt::Display for BoxTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &id in self.top_level() {
            write_box(f, self, id, 0)?;
        }
        Ok(())
    }
}

fn write_box(f: &mut fmt::Formatter<'_>, tree: &BoxTree, id: BoxId, depth: usize) -> fmt::Result {
    let Some(node) = tree.get(id) else {
        return Ok(());
    };
    let mut out = Indented { f: &mut *f, depth };
    write_header(&mut out, node.header())?;
    if node.is_truncated() {
        out.line(format_args!("(truncated)"))?;
    }
    write_fields(&mut out, node)?;
    for &child in node.children() {
        write_box(f, tree, child, depth + 1)?;
    }
    Ok(())
}

fn write_header(out: &mut Indented<'_, '_>, header: &BoxHeader) -> fmt::Result {
    out.line(format_args!("Box: {}", header.type_string()))?;
    out.line(format_args!("size: {}   (header size: {})", header.declared_size(), header.header_size()))?;
    if let Some(full_box) = header.full_box() {
        out.line(format_args!("version: {}", full_box.version))?;
        out.line(format_args!("flags: {:#x}", full_box.flags))?;
    }
    Ok(())
}

fn write_fields(out: &mut Indented<'_, '_>, node: &BoxNode) -> fmt::Result {
    match node.kind() {
        BoxKind::FileType(ftyp) => {
            out.line(format_args!("major brand: {}", ftyp.major_brand))?;
            out.line(format_args!("minor version: {}", ftyp.minor_version))?;
            let mut brands = std::string::String::new();
            for (i, brand) in ftyp.compatible_brands.iter().enumerate() {
                if i > 0 {
                    brands.push(',');
                }
                brands += &brand.to_string();
            }
            out.line(format_args!("compatible brands: {brands}"))
        },
        BoxKind::Handler(hdlr) => {
            out.line(format_args!("pre_defined: {}", hdlr.pre_defined))?;
            out.line(format_args!("handler_type: {}", hdlr.handler_type))?;
            out.line(format_args!("name: {}", hdlr.name()))
        },
        BoxKind::PrimaryItem(pitm) => out.line(format_args!("item_ID: {}", pitm.item_id)),
        BoxKind::ItemLocation(iloc) => write_iloc(out, iloc),
        BoxKind::ItemInfo(iinf) => out.line(format_args!("entry count: {}", iinf.entry_count)),
        BoxKind::ItemInfoEntry(infe) => {
            out.line(format_args!("item_ID: {}", infe.item_id))?;
            out.line(format_args!("item_protection_index: {}", infe.item_protection_index))?;
            if let Some(item_type) = infe.item_type {
                out.line(format_args!("item_type: {item_type}"))?;
            }
            out.line(format_args!("item_name: {}", infe.item_name()))?;
            if !infe.content_type.is_empty() {
                out.line(format_args!("content_type: {}", infe.content_type()))?;
                out.line(format_args!("content_encoding: {}", infe.content_encoding()))?;
            }
            if !infe.item_uri_type.is_empty() {
                out.line(format_args!("item uri type: {}", infe.item_uri_type()))?;
            }
            Ok(())
        },
        BoxKind::ItemReference(iref) => {
            for r in iref.references.iter() {
                out.line(format_args!(
                    "reference with type '{}' from ID: {} to ID: {} (index {})",
                    r.reference_type, r.from_item_id, r.to_item_id, r.reference_index
                ))?;
            }
            Ok(())
        },
        BoxKind::ItemData(idat) => out.line(format_args!("number of data bytes: {}", idat.data.len())),
        BoxKind::ItemPropertyAssociation(ipma) => {
            for entry in ipma.entries.iter() {
                out.line(format_args!("associations for item ID: {}", entry.item_id))?;
                for a in entry.associations.iter() {
                    let essential = if a.essential { "yes" } else { "no" };
                    out.line(format_args!("  property index: {} (essential: {essential})", a.property_index))?;
                }
            }
            Ok(())
        },
        BoxKind::ImageSpatialExtents(ispe) => {
            out.line(format_args!("image width: {}", ispe.width))?;
            out.line(format_args!("image height: {}", ispe.height))
        },
        BoxKind::PixelInformation(pixi) => {
            for (channel, bits) in pixi.bits_per_channel.iter().enumerate() {
                out.line(format_args!("bits @ channel {channel}: {bits}"))?;
            }
            Ok(())
        },
        BoxKind::HevcConfiguration(hvcc) => write_hvcc(out, hvcc),
        BoxKind::Meta | BoxKind::ItemProperties | BoxKind::ItemPropertyContainer | BoxKind::Generic => Ok(()),
    }
}

fn write_iloc(out: &mut Indented<'_, '_>, iloc: &ItemLocationBox) -> fmt::Result {
    for item in iloc.items() {
        out.line(format_args!("item ID: {}", item.item_id))?;
        out.line(format_args!("  data_reference_index: {}", item.data_reference_index))?;
        out.line(format_args!("  base_offset: {}", item.base_offset))?;
        let mut extents = std::string::String::new();
        for extent in item.extents.iter() {
            extents += &format!("{},{} ", extent.offset, extent.length);
        }
        out.line(format_args!("  extents: {}", extents.trim_end()))?;
    }
    Ok(())
}

fn write_hvcc(out: &mut Indented<'_, '_>, hvcc: &HevcConfigurationBox) -> fmt::Result {
    let constraint_flags: std::string::String = hvcc
        .general_constraint_indicator_flags
        .iter()
        .map(|&set| if set { '1' } else { '0' })
        .collect();

    out.line(format_args!("configuration_version: {}", hvcc.configuration_version))?;
    out.line(format_args!("general_profile_space: {}", hvcc.general_profile_space))?;
    out.line(format_args!("general_tier_flag: {}", u8::from(hvcc.general_tier_flag)))?;
    out.line(format_args!("general_profile_idc: {}", hvcc.general_profile_idc))?;
    out.line(format_args!("general_profile_compatibility_flags: {:032b}", hvcc.general_profile_compatibility_flags))?;
    out.line(format_args!("general_constraint_indicator_flags: {constraint_flags}"))?;
    out.line(format_args!("general_level_idc: {}", hvcc.general_level_idc))?;
    out.line(format_args!("min_spatial_segmentation_idc: {}", hvcc.min_spatial_segmentation_idc))?;
    out.line(format_args!("parallelism_type: {}", hvcc.parallelism_type))?;
    out.line(format_args!("chroma_format: {}", hvcc.chroma_format))?;
    out.line(format_args!("bit_depth_luma: {}", hvcc.bit_depth_luma))?;
    out.line(format_args!("bit_depth_chroma: {}", hvcc.bit_depth_chroma))?;
    out.line(format_args!("avg_frame_rate: {}", hvcc.avg_frame_rate))?;
    out.line(format_args!("constant_frame_rate: {}", hvcc.constant_frame_rate))?;
    out.line(format_args!("num_temporal_layers: {}", hvcc.num_temporal_layers))?;
    out.line(format_args!("temporal_id_nested: {}", u8::from(hvcc.temporal_id_nested)))?;
    out.line(format_args!("length_size: {}", hvcc.nal_length_size))?;

    for array in hvcc.nal_arrays.iter() {
        out.line(format_args!("<array>"))?;
        out.line(format_args!("  array_completeness: {}", u8::from(array.array_completeness)))?;
        out.line(format_args!("  NAL_unit_type: {}", array.nal_unit_type))?;
        for unit in array.units.iter() {
            let mut hex = std::string::String::with_capacity(unit.len() * 3);
            for byte in unit.iter() {
                hex += &format!("{byte:02x} ");
            }
            out.line(format_args!("  {}", hex.trim_end()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
fn boxed(name: &[u8; 4], body: &[u8]) -> std::vec::Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(body);
    out
}

#[test]
fn dump_indents_children() {
    let ipco = boxed(b"ipco", &boxed(b"ispe", &[0, 0, 0, 0, 0, 0, 0, 64, 0, 0, 0, 32]));
    let tree = BoxTree::from_reader(&mut std::io::Cursor::new(&ipco)).unwrap();
    let expected = "Box: ipco\n\
                    size: 28   (header size: 8)\n  \
                    Box: ispe\n  \
                    size: 20   (header size: 12)\n  \
                    version: 0\n  \
                    flags: 0x0\n  \
                    image width: 64\n  \
                    image height: 32\n";
    assert_eq!(tree.to_string(), expected);
}

#[test]
fn dump_marks_truncated_uuid_box() {
    let mut file = 40u32.to_be_bytes().to_vec();
    file.extend_from_slice(b"uuid");
    file.extend_from_slice(&[0xab; 16]);
    file.extend_from_slice(b"payload");
    let tree = BoxTree::from_reader(&mut std::io::Cursor::new(&file)).unwrap();
    assert_eq!(
        tree.to_string(),
        "Box: abababab-abab-abab-abab-abababababab\nsize: 40   (header size: 24)\n(truncated)\n"
    );
}
