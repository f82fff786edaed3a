// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::io::Cursor;

use heif_box_parse::{BoxKind, BoxTree, BoxType, DecodeConfig, Error, StopReason, Unstoppable};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::max()).try_init();
}

fn boxed(name: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(body);
    out
}

fn full_box(name: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut content = (u32::from(version) << 24 | flags).to_be_bytes().to_vec();
    content.extend_from_slice(body);
    boxed(name, &content)
}

fn cat(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

const VPS: &[u8] = &[0x40, 0x01, 0x0c, 0x01];
const SPS: &[u8] = &[0x42, 0x01, 0x01, 0x01, 0x60];
const PPS: &[u8] = &[0x44, 0x01, 0xc1, 0x72];
const SLICE_A: &[u8] = &[0x26, 0x01, 0xaf, 0x09, 0x40];
const SLICE_B: &[u8] = &[0x26, 0x01, 0x00, 0x80];

fn hvcc_box() -> Vec<u8> {
    let mut body = vec![1, 0x01, 0x60, 0, 0, 0, 0x90, 0, 0, 0, 0, 0, 90, 0xF0, 0, 0xFC, 0xFD, 0xF8, 0xF8, 0, 0, 0x0F];
    body.push(3);
    for (nal_type, unit) in [(32u8, VPS), (33, SPS), (34, PPS)] {
        body.push(0x80 | nal_type);
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&(unit.len() as u16).to_be_bytes());
        body.extend_from_slice(unit);
    }
    boxed(b"hvcC", &body)
}

fn length_prefixed(units: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in units {
        out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
        out.extend_from_slice(unit);
    }
    out
}

fn meta_box(mdat_body_offset: u32, mdat_body_len: u32) -> Vec<u8> {
    let hdlr = full_box(b"hdlr", 0, 0, &cat(&[&[0; 4], b"pict", &[0; 12], &cstr("HEIF image")]));
    let pitm = full_box(b"pitm", 0, 0, &[0, 1]);

    let mut iloc = vec![0x44, 0x40, 0, 1]; // 32-bit offset, length, base offset; one item
    iloc.extend_from_slice(&[0, 1, 0, 0]); // item 1, data reference 0
    iloc.extend_from_slice(&mdat_body_offset.to_be_bytes());
    iloc.extend_from_slice(&[0, 1]);
    iloc.extend_from_slice(&0u32.to_be_bytes());
    iloc.extend_from_slice(&mdat_body_len.to_be_bytes());
    let iloc = full_box(b"iloc", 0, 0, &iloc);

    let infe = full_box(b"infe", 2, 0, &cat(&[&[0, 1, 0, 0], b"hvc1", &cstr("primary")]));
    let iinf = full_box(b"iinf", 0, 0, &cat(&[&[0, 1], &infe]));

    let ispe = full_box(b"ispe", 0, 0, &[0, 0, 0x05, 0x00, 0, 0, 0x02, 0xD0]);
    let ipco = boxed(b"ipco", &[hvcc_box(), ispe].concat());
    let ipma = full_box(b"ipma", 0, 0, &[0, 0, 0, 1, 0, 1, 2, 0x81, 0x02]);
    let iprp = boxed(b"iprp", &[ipco, ipma].concat());

    full_box(b"meta", 0, 0, &[hdlr, pitm, iloc, iinf, iprp].concat())
}

/// ftyp, meta and an mdat holding one item of two length-prefixed slices.
fn heif_file() -> Vec<u8> {
    let ftyp = boxed(b"ftyp", b"heic\0\0\0\0mif1heic");
    let mdat_body = length_prefixed(&[SLICE_A, SLICE_B]);
    let meta_len = meta_box(0, 0).len();
    let mdat_body_offset = (ftyp.len() + meta_len + 8) as u32;
    [ftyp, meta_box(mdat_body_offset, mdat_body.len() as u32), boxed(b"mdat", &mdat_body)].concat()
}

fn annex_b(units: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in units {
        out.extend_from_slice(&[0, 0, 1]);
        out.extend_from_slice(unit);
    }
    out
}

#[test]
fn full_heif_tree() {
    init_logger();
    let file = heif_file();
    let tree = BoxTree::from_reader(&mut Cursor::new(&file)).expect("decode failed");
    assert!(tree.error().is_none(), "{:?}", tree.error());
    assert!(tree.status().eof());
    assert!(!tree.status().error());

    let types: Vec<BoxType> = tree.top_level().iter().map(|&id| tree.get(id).unwrap().box_type()).collect();
    assert_eq!(types, [BoxType::FileTypeBox, BoxType::MetadataBox, BoxType::MediaDataBox]);

    let ftyp = tree.get(tree.find_top_level(*b"ftyp").unwrap()).unwrap().as_ftyp().unwrap();
    assert_eq!(ftyp.major_brand, b"heic");
    assert_eq!(ftyp.compatible_brands.len(), 2);

    let meta = tree.find_top_level(*b"meta").unwrap();
    let hdlr = tree.get(tree.get_child_box(meta, *b"hdlr").unwrap()).unwrap().as_hdlr().unwrap();
    assert_eq!(hdlr.handler_type, b"pict");
    assert_eq!(hdlr.name(), "HEIF image");
    assert_eq!(tree.primary_item_id(), Some(1));

    let iinf = tree.get_child_box(meta, *b"iinf").unwrap();
    assert_eq!(tree.get(iinf).unwrap().as_iinf().unwrap().entry_count, 1);
    let infe = tree.get(tree.children(iinf)[0]).unwrap().as_infe().unwrap();
    assert_eq!(infe.item_id, 1);
    assert_eq!(infe.item_type.unwrap(), b"hvc1");
    assert_eq!(infe.item_name(), "primary");

    let props: Vec<(BoxType, bool)> = tree
        .item_properties(1)
        .map(|(id, essential)| (tree.get(id).unwrap().box_type(), essential))
        .collect();
    assert_eq!(props, [(BoxType::HevcConfigurationBox, true), (BoxType::ImageSpatialExtentsBox, false)]);

    let ispe = tree
        .find_path(&[BoxType::MetadataBox, BoxType::ItemPropertiesBox, BoxType::ItemPropertyContainerBox, BoxType::ImageSpatialExtentsBox])
        .and_then(|id| tree.get(id)?.as_ispe())
        .unwrap();
    assert_eq!((ispe.width, ispe.height), (1280, 720));
}

#[test]
fn primary_item_stream() {
    let file = heif_file();
    let mut src = Cursor::new(&file);
    let tree = BoxTree::from_reader(&mut src).unwrap();
    let config = DecodeConfig::default();

    let hvcc = tree
        .item_properties(1)
        .find_map(|(id, _)| tree.get(id)?.as_hvcc())
        .expect("hvcC");
    assert_eq!(hvcc.general_profile_idc, 1);
    assert_eq!(hvcc.nal_length_size, 4);
    let headers = hvcc.get_headers(&config).unwrap();
    assert_eq!(&headers[..], &annex_b(&[VPS, SPS, PPS])[..]);

    let iloc = tree.item_locations().unwrap();
    let stream = iloc.read_item_data(1, &mut src, &config).unwrap().unwrap();
    assert!(stream.failed_extents.is_empty());
    assert_eq!(&stream.data[..], &annex_b(&[SLICE_A, SLICE_B])[..]);

    let all = iloc.read_all_data(&mut src, &config).unwrap();
    assert_eq!(&all.data[..], &stream.data[..]);
}

#[test]
fn unknown_box_is_skipped_exactly() {
    let mut file = boxed(b"abcd", &[0x11; 13]);
    file.extend_from_slice(&full_box(b"pitm", 0, 0, &[0, 9]));
    let tree = BoxTree::from_reader(&mut Cursor::new(&file)).unwrap();
    assert!(tree.error().is_none());
    assert_eq!(tree.top_level().len(), 2);

    let unknown = tree.get(tree.top_level()[0]).unwrap();
    assert!(matches!(unknown.kind(), BoxKind::Generic));
    assert_eq!(unknown.header().fourcc(), b"abcd");
    assert_eq!(unknown.header().declared_size(), 21);

    let pitm = tree.get(tree.top_level()[1]).unwrap().as_pitm().unwrap();
    assert_eq!(pitm.item_id, 9);
}

#[test]
fn truncated_source_keeps_partial_tree() {
    init_logger();
    let file = heif_file();
    for cut in [7, 20, 60, 150, file.len() - 3] {
        let tree = BoxTree::from_reader(&mut Cursor::new(&file[..cut])).unwrap();
        assert!(tree.status().eof(), "cut at {cut}");
        assert!(matches!(tree.error(), Some(Error::UnexpectedEOF)), "cut at {cut}");
        let _ = tree.to_string();
    }
}

#[test]
fn truncated_body_half_present() {
    // 'infe' that declares 40 body bytes but only has 20 in the file
    let mut body = vec![0, 0, 0, 0, 0, 5, 0, 0];
    body.extend_from_slice(b"an-unterminated-name");
    body.extend_from_slice(&[b'x'; 12]);
    let mut file = boxed(b"infe", &body);
    file.truncate(8 + 20);

    let tree = BoxTree::from_reader(&mut Cursor::new(&file)).unwrap();
    let node = tree.get(tree.top_level()[0]).unwrap();
    assert!(node.is_truncated());
    let infe = node.as_infe().unwrap();
    assert_eq!(infe.item_id, 5);
    assert!(infe.item_name.is_empty());
    assert!(tree.status().eof());
}

#[test]
fn cancellation_during_parse() {
    struct ImmediatelyCancelled;
    impl heif_box_parse::Stop for ImmediatelyCancelled {
        fn check(&self) -> std::result::Result<(), StopReason> {
            Err(StopReason::Cancelled)
        }
    }

    let file = heif_file();
    let result = BoxTree::from_reader_with_config(&mut Cursor::new(&file), &DecodeConfig::default(), &ImmediatelyCancelled);
    match result {
        Err(Error::Stopped(reason)) => assert_eq!(reason, StopReason::Cancelled),
        Ok(_) => panic!("Expected cancellation"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

#[test]
fn unstoppable_completes() {
    let file = heif_file();
    let result = BoxTree::from_reader_with_config(&mut Cursor::new(&file), &DecodeConfig::unlimited(), &Unstoppable);
    assert!(result.is_ok());
}

#[test]
fn deep_nesting_is_bounded() {
    init_logger();
    let mut file = full_box(b"ispe", 0, 0, &[0, 0, 0, 1, 0, 0, 0, 1]);
    for _ in 0..200 {
        file = boxed(b"ipco", &file);
    }
    let tree = BoxTree::from_reader(&mut Cursor::new(&file)).unwrap();
    match tree.error() {
        Some(Error::ResourceLimitExceeded(msg)) => assert_eq!(*msg, "box nesting depth limit exceeded"),
        other => panic!("Unexpected result: {:?}", other),
    }
    assert_eq!(tree.len(), 33);
    assert!(tree.status().eof());
}

#[test]
fn memory_limit_applies_to_materialization() {
    let file = heif_file();
    let mut src = Cursor::new(&file);
    let tree = BoxTree::from_reader(&mut src).unwrap();
    let config = DecodeConfig::default().with_peak_memory_limit(8);
    let result = tree.item_locations().unwrap().read_all_data(&mut src, &config);
    assert!(matches!(result, Err(Error::ResourceLimitExceeded(_))));
}

#[test]
fn read_box_tree_from_offset() {
    let mut file = b"garbage!".to_vec();
    file.extend_from_slice(&heif_file());
    let mut src = Cursor::new(&file);
    src.set_position(8);
    let tree = heif_box_parse::read_box_tree(&mut src).unwrap();
    assert!(tree.error().is_none());
    assert_eq!(tree.top_level().len(), 3);
}

#[test]
fn dump_lists_every_box() {
    let file = heif_file();
    let tree = BoxTree::from_reader(&mut Cursor::new(&file)).unwrap();
    let dump = tree.to_string();
    for name in ["ftyp", "meta", "hdlr", "pitm", "iloc", "iinf", "infe", "iprp", "ipco", "hvcC", "ispe", "ipma", "mdat"] {
        assert!(dump.contains(&format!("Box: {name}\n")), "{name} missing from dump");
    }
    assert!(dump.contains("\n      Box: hvcC\n"));
    assert!(dump.contains("compatible brands: mif1,heic\n"));
}
