// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:literal),*,) => {
        /// Box types known to the decoder. Anything else is kept as `UnknownBox`.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                use self::BoxType::*;
                match t {
                    $($(#[$attr])* $boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> Self {
                use self::BoxType::*;
                match b {
                    $($(#[$attr])* $boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }
    }
}

box_database!(
    FileTypeBox                 0x6674_7970, // "ftyp"
    MetadataBox                 0x6d65_7461, // "meta"
    HandlerBox                  0x6864_6c72, // "hdlr"
    PrimaryItemBox              0x7069_746d, // "pitm"
    ItemLocationBox             0x696c_6f63, // "iloc"
    ItemInfoBox                 0x6969_6e66, // "iinf"
    ItemInfoEntry               0x696e_6665, // "infe"
    ItemReferenceBox            0x6972_6566, // "iref"
    ItemDataBox                 0x6964_6174, // "idat"
    ItemPropertiesBox           0x6970_7270, // "iprp"
    ItemPropertyContainerBox    0x6970_636f, // "ipco"
    ItemPropertyAssociationBox  0x6970_6d61, // "ipma"
    ImageSpatialExtentsBox      0x6973_7065, // "ispe"
    PixelInformationBox         0x7069_7869, // "pixi"
    HevcConfigurationBox        0x6876_6343, // "hvcC"
    MediaDataBox                0x6d64_6174, // "mdat"
    FreeSpaceBox                0x6672_6565, // "free"
    SkipBox                     0x736b_6970, // "skip"
    UuidBox                     0x7575_6964, // "uuid"
);

impl From<[u8; 4]> for BoxType {
    fn from(t: [u8; 4]) -> Self {
        Self::from(u32::from_be_bytes(t))
    }
}

impl From<FourCC> for BoxType {
    fn from(t: FourCC) -> Self {
        Self::from(t.value)
    }
}

impl fmt::Debug for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fourcc: FourCC = From::from(*self);
        fourcc.fmt(f)
    }
}

/// A four-character code: four bytes, usually printable ASCII.
#[derive(Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self { value: number.to_be_bytes() }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        Self::from_be_bytes(fourcc.value)
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => self.value.fmt(f),
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Lossy so that control bytes never end up raw in a dump
        for &b in &self.value {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", char::from(b))?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value.eq(*other)
    }
}

#[test]
fn box_type_round_trips_known_and_unknown_codes() {
    assert_eq!(BoxType::from(*b"iloc"), BoxType::ItemLocationBox);
    assert_eq!(BoxType::from(*b"hvcC"), BoxType::HevcConfigurationBox);
    assert_eq!(u32::from(BoxType::UuidBox), u32::from_be_bytes(*b"uuid"));

    let unknown = BoxType::from(*b"zzzz");
    assert_eq!(unknown, BoxType::UnknownBox(u32::from_be_bytes(*b"zzzz")));
    assert_eq!(FourCC::from(unknown), b"zzzz");
}

#[test]
fn fourcc_display_escapes_unprintable_bytes() {
    assert_eq!(FourCC::from(*b"uri ").to_string(), "uri ");
    assert_eq!(FourCC::from([b'a', 0, b'b', 0xff]).to_string(), "a\\x00b\\xff");
}
