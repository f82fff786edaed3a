// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitreader::BitReader;
use log::debug;
use std::io::{Read, Seek};

use crate::range::BitstreamRange;
use crate::{DecodeConfig, Result, ToU64, TryVec, START_CODE};

/// Bytes before the NAL unit arrays.
const FIXED_PREFIX_SIZE: usize = 22;

/// Parameter-set NAL units of one type.
#[derive(Debug)]
pub struct NalArray {
    pub array_completeness: bool,
    /// 6 bits.
    pub nal_unit_type: u8,
    pub units: TryVec<TryVec<u8>>,
}

/// HEVC decoder configuration record 'hvcC'.
/// See ISO/IEC 14496-15:2017 § 8.3.3
#[derive(Debug)]
pub struct HevcConfigurationBox {
    pub configuration_version: u8,
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    /// MSB of the first byte first.
    pub general_constraint_indicator_flags: [bool; 48],
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    /// Size in bytes of the length prefix in front of each NAL unit in
    /// the samples, 1 to 4.
    pub nal_length_size: u8,
    pub nal_arrays: TryVec<NalArray>,
}

pub(crate) fn read_hvcc<R: Read + Seek>(src: &mut BitstreamRange<'_, R>) -> Result<HevcConfigurationBox> {
    // Byte by byte, so that a truncated record keeps the fields it has.
    let mut prefix = [0; FIXED_PREFIX_SIZE];
    for byte in &mut prefix {
        *byte = src.read_u8();
    }
    let mut hvcc = parse_fixed_prefix(&prefix)?;

    let num_arrays = src.read_u8();
    for _ in 0..num_arrays {
        if src.error() {
            break;
        }
        let byte = src.read_u8();
        let mut array = NalArray {
            array_completeness: byte & 0x80 != 0,
            nal_unit_type: byte & 0x3F,
            units: TryVec::new(),
        };
        let num_nalus = src.read16();
        for _ in 0..num_nalus {
            let length = src.read16();
            let unit = src.read_vec(length.into())?;
            if src.error() {
                debug!("hvcC: NAL array of type {} truncated", array.nal_unit_type);
                break;
            }
            array.units.push(unit)?;
        }
        hvcc.nal_arrays.push(array)?;
    }

    src.skip_to_end_of_box();
    Ok(hvcc)
}

fn parse_fixed_prefix(prefix: &[u8; FIXED_PREFIX_SIZE]) -> Result<HevcConfigurationBox> {
    let mut bits = BitReader::new(prefix);

    let configuration_version = bits.read_u8(8)?;
    let general_profile_space = bits.read_u8(2)?;
    let general_tier_flag = bits.read_bool()?;
    let general_profile_idc = bits.read_u8(5)?;
    let general_profile_compatibility_flags = bits.read_u32(32)?;
    let mut general_constraint_indicator_flags = [false; 48];
    for flag in &mut general_constraint_indicator_flags {
        *flag = bits.read_bool()?;
    }
    let general_level_idc = bits.read_u8(8)?;
    bits.skip(4)?;
    let min_spatial_segmentation_idc = bits.read_u16(12)?;
    bits.skip(6)?;
    let parallelism_type = bits.read_u8(2)?;
    bits.skip(6)?;
    let chroma_format = bits.read_u8(2)?;
    bits.skip(5)?;
    let bit_depth_luma = bits.read_u8(3)? + 8;
    bits.skip(5)?;
    let bit_depth_chroma = bits.read_u8(3)? + 8;
    let avg_frame_rate = bits.read_u16(16)?;
    let constant_frame_rate = bits.read_u8(2)?;
    let num_temporal_layers = bits.read_u8(3)?;
    let temporal_id_nested = bits.read_bool()?;
    let nal_length_size = bits.read_u8(2)? + 1;
    debug_assert_eq!(bits.remaining(), 0);

    Ok(HevcConfigurationBox {
        configuration_version,
        general_profile_space,
        general_tier_flag,
        general_profile_idc,
        general_profile_compatibility_flags,
        general_constraint_indicator_flags,
        general_level_idc,
        min_spatial_segmentation_idc,
        parallelism_type,
        chroma_format,
        bit_depth_luma,
        bit_depth_chroma,
        avg_frame_rate,
        constant_frame_rate,
        num_temporal_layers,
        temporal_id_nested,
        nal_length_size,
        nal_arrays: TryVec::new(),
    })
}

impl HevcConfigurationBox {
    /// All NAL units of all arrays, in order, each preceded by a start code.
    ///
    /// This is what a decoder needs before the first picture's slice data.
    pub fn get_headers(&self, config: &DecodeConfig) -> Result<TryVec<u8>> {
        let mut out = TryVec::new();
        for unit in self.nal_arrays.iter().flat_map(|array| array.units.iter()) {
            config.reserve(out.len(), (START_CODE.len() + unit.len()).to_u64())?;
            out.extend_from_slice(&START_CODE)?;
            out.extend_from_slice(unit)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
fn record(profile_byte: u8, constraints: [u8; 6], arrays: &[(u8, &[&[u8]])]) -> std::vec::Vec<u8> {
    let mut body = vec![1, profile_byte];
    body.extend_from_slice(&0x6000_0000u32.to_be_bytes());
    body.extend_from_slice(&constraints);
    body.extend_from_slice(&[
        93,   // general_level_idc
        0xF0, 0x00, // min_spatial_segmentation_idc
        0xFC, // parallelism_type
        0xFD, // chroma_format 4:2:0
        0xFA, // bit_depth_luma 10
        0xF8, // bit_depth_chroma 8
        0, 0, // avg_frame_rate
        0x0F, // 1 temporal layer, nested, 4-byte lengths
    ]);
    body.push(arrays.len() as u8);
    for (header, units) in arrays {
        body.push(*header);
        body.extend_from_slice(&(units.len() as u16).to_be_bytes());
        for unit in *units {
            body.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            body.extend_from_slice(unit);
        }
    }
    body
}

#[cfg(test)]
fn parse(body: &[u8]) -> (HevcConfigurationBox, bool, u64) {
    let mut src = std::io::Cursor::new(body);
    let mut range = BitstreamRange::new(&mut src, body.len() as u64);
    let hvcc = read_hvcc(&mut range).unwrap();
    let error = range.error();
    drop(range);
    (hvcc, error, src.position())
}

#[test]
fn profile_byte_bit_fields() {
    let (hvcc, error, _) = parse(&record(0xA5, [0; 6], &[]));
    assert!(!error);
    assert_eq!(hvcc.general_profile_space, 2);
    assert!(hvcc.general_tier_flag);
    assert_eq!(hvcc.general_profile_idc, 5);
    assert_eq!(hvcc.general_profile_compatibility_flags, 0x6000_0000);
    assert_eq!(hvcc.general_level_idc, 93);
    assert_eq!(hvcc.min_spatial_segmentation_idc, 0);
    assert_eq!(hvcc.chroma_format, 1);
    assert_eq!(hvcc.bit_depth_luma, 10);
    assert_eq!(hvcc.bit_depth_chroma, 8);
    assert_eq!(hvcc.num_temporal_layers, 1);
    assert!(hvcc.temporal_id_nested);
    assert_eq!(hvcc.nal_length_size, 4);
}

#[test]
fn constraint_flags_msb_first() {
    let (hvcc, _, _) = parse(&record(1, [0xFF; 6], &[]));
    assert!(hvcc.general_constraint_indicator_flags.iter().all(|&f| f));

    let (hvcc, _, _) = parse(&record(1, [0x80, 0, 0, 0, 0, 0x01], &[]));
    let set: std::vec::Vec<usize> = (0..48).filter(|&i| hvcc.general_constraint_indicator_flags[i]).collect();
    assert_eq!(set, [0, 47]);
}

#[test]
fn nal_arrays_and_headers() {
    let vps: &[u8] = &[0x40, 0x01, 0x0c];
    let sps: &[u8] = &[0x42, 0x01, 0x01, 0x01];
    let pps: &[u8] = &[0x44, 0x01, 0xc1];
    let mut body = record(1, [0; 6], &[(0xA0, &[vps]), (0x21, &[sps]), (0x22, &[pps])]);
    body.extend_from_slice(b"future");
    let (hvcc, error, position) = parse(&body);
    assert!(!error);
    assert_eq!(position, body.len() as u64);

    assert_eq!(hvcc.nal_arrays.len(), 3);
    assert!(hvcc.nal_arrays[0].array_completeness);
    assert_eq!(hvcc.nal_arrays[0].nal_unit_type, 32);
    assert!(!hvcc.nal_arrays[1].array_completeness);
    assert_eq!(hvcc.nal_arrays[2].nal_unit_type, 34);

    let headers = hvcc.get_headers(&DecodeConfig::default()).unwrap();
    assert_eq!(&*headers, b"\0\0\x01\x40\x01\x0c\0\0\x01\x42\x01\x01\x01\0\0\x01\x44\x01\xc1");

    let tight = DecodeConfig::default().with_peak_memory_limit(10);
    assert!(hvcc.get_headers(&tight).is_err());
}

#[test]
fn truncated_nal_array_keeps_prefix() {
    let body = record(0xA5, [0; 6], &[(0x20, &[&[1, 2, 3, 4]])]);
    let (hvcc, error, _) = parse(&body[..body.len() - 2]);
    assert!(error);
    assert_eq!(hvcc.general_profile_idc, 5);
    assert_eq!(hvcc.nal_arrays.len(), 1);
    assert!(hvcc.nal_arrays[0].units.is_empty());
}
