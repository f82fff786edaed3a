// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte budgets for nested box bodies.
//!
//! A [`BitstreamRange`] owns a stack of [`ByteBudget`] records, one per open
//! box, with the root record covering the whole source. Reads always go
//! through the innermost record and are debited from every record below it,
//! so an ancestor can never believe it has more data left than a descendant
//! actually consumed.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use std::io::{Read, Seek, SeekFrom};

use crate::{Error, Result, ToU64, TryString, TryVec};

/// Remaining-length state of one level of the range stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteBudget {
    remaining: u64,
    end_reached: bool,
    error: bool,
}

impl ByteBudget {
    fn new(length: u64) -> Self {
        Self {
            remaining: length,
            end_reached: length == 0,
            error: false,
        }
    }

    /// Bytes that may still be read.
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    /// No more bytes can be read, either because all were consumed or
    /// because of an error.
    pub const fn eof(&self) -> bool {
        self.end_reached
    }

    /// A read was attempted past the budget, or the source ran dry.
    /// Sticky.
    pub const fn error(&self) -> bool {
        self.error
    }

    fn debit(&mut self, n: u64) {
        debug_assert!(n <= self.remaining);
        self.remaining -= n;
        if self.remaining == 0 {
            self.end_reached = true;
        }
    }

    fn exhaust(&mut self) {
        self.remaining = 0;
        self.end_reached = true;
    }
}

/// A byte source together with the budgets of all currently open boxes.
///
/// Every child budget is clamped to its parent's remaining bytes when it is
/// opened, and every debit is applied to all levels at once. Together that
/// keeps `remaining` non-increasing from the root towards the innermost box.
pub struct BitstreamRange<'a, R> {
    src: &'a mut R,
    root: ByteBudget,
    children: std::vec::Vec<ByteBudget>,
}

impl<'a, R: Read + Seek> BitstreamRange<'a, R> {
    /// Range over the next `length` bytes of `src`.
    ///
    /// `length` is trusted; if the source is shorter, the first read past its
    /// end puts the whole range into the end-of-data state.
    pub fn new(src: &'a mut R, length: u64) -> Self {
        Self {
            src,
            root: ByteBudget::new(length),
            children: std::vec::Vec::new(),
        }
    }

    /// Range over everything between the current position of `src` and its end.
    pub fn from_source(src: &'a mut R) -> Result<Self> {
        let start = src.stream_position()?;
        let end = src.seek(SeekFrom::End(0))?;
        src.seek(SeekFrom::Start(start))?;
        Ok(Self::new(src, end.saturating_sub(start)))
    }

    /// The budget reads are currently charged against.
    pub fn budget(&self) -> &ByteBudget {
        self.children.last().unwrap_or(&self.root)
    }

    fn budget_mut(&mut self) -> &mut ByteBudget {
        self.children.last_mut().unwrap_or(&mut self.root)
    }

    /// Budget at nesting level `depth`, where 0 is the root.
    pub fn budget_at(&self, depth: usize) -> Option<&ByteBudget> {
        match depth {
            0 => Some(&self.root),
            d => self.children.get(d - 1),
        }
    }

    /// Number of child ranges currently open.
    pub fn depth(&self) -> usize {
        self.children.len()
    }

    pub fn remaining(&self) -> u64 {
        self.budget().remaining()
    }

    pub fn eof(&self) -> bool {
        self.budget().eof()
    }

    pub fn error(&self) -> bool {
        self.budget().error()
    }

    fn for_each_level(&mut self, mut f: impl FnMut(&mut ByteBudget)) {
        f(&mut self.root);
        self.children.iter_mut().for_each(f);
    }

    /// Open a child range of `length` bytes inside the current one.
    ///
    /// A length larger than what the current range has left is clamped.
    pub(crate) fn push_child(&mut self, length: u64) -> Result<()> {
        let available = self.remaining();
        let length = if length > available {
            warn!("child range of {length} bytes clamped to the {available} bytes left in its parent");
            available
        } else {
            length
        };
        self.children.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        self.children.push(ByteBudget::new(length));
        Ok(())
    }

    /// Close the innermost child range, skipping whatever it did not read so
    /// that the source is left at the end of the declared box body.
    ///
    /// Returns the final state of the closed range.
    pub(crate) fn pop_child(&mut self) -> ByteBudget {
        let left = self.remaining();
        if left > 0 {
            debug!("Dropping {left} unread bytes at nesting level {}", self.depth());
            self.skip_to_end_of_box();
        }
        let closed = self.children.pop();
        debug_assert!(closed.is_some(), "pop_child on the root range");
        closed.unwrap_or(self.root)
    }

    /// Charge `n` bytes to the current range and all of its ancestors.
    ///
    /// This only does the bookkeeping; callers read the bytes from the source
    /// themselves. If `n` exceeds the budget, the rest of the range is
    /// skipped in the source, the range becomes empty and is flagged as an
    /// error, and `false` is returned.
    pub fn read(&mut self, n: u64) -> bool {
        let remaining = self.remaining();
        if remaining == 0 {
            let budget = self.budget_mut();
            budget.end_reached = true;
            budget.error = true;
            return false;
        }

        if n <= remaining {
            self.for_each_level(|b| b.debit(n));
            return true;
        }

        debug!("read of {n} bytes overruns the {remaining} bytes left in range");
        self.advance_source(remaining);
        if !self.eof() {
            self.for_each_level(|b| b.debit(remaining));
        }
        let budget = self.budget_mut();
        budget.exhaust();
        budget.error = true;
        false
    }

    /// The source ran out of data. The current range and all ancestors are
    /// emptied and flagged.
    pub fn set_eof_reached(&mut self) {
        self.for_each_level(|b| {
            b.exhaust();
            b.error = true;
        });
    }

    /// Discard the unread rest of the current range.
    pub fn skip_to_end_of_box(&mut self) {
        let remaining = self.remaining();
        if remaining > 0 {
            self.advance_source(remaining);
            if !self.eof() {
                self.for_each_level(|b| b.debit(remaining));
            }
        }
    }

    /// Move the source to its end, as needed for a box whose size runs to the
    /// end of the file. Since nothing can be read afterwards, every open
    /// range is emptied.
    pub fn skip_to_end_of_file(&mut self) {
        if let Err(e) = self.src.seek(SeekFrom::End(0)) {
            warn!("seek to end of source failed: {e}");
            self.set_eof_reached();
            return;
        }
        self.for_each_level(ByteBudget::exhaust);
    }

    /// Abandon the current range after a structural error.
    pub(crate) fn abandon(&mut self) {
        self.skip_to_end_of_box();
        let budget = self.budget_mut();
        budget.exhaust();
        budget.error = true;
    }

    fn advance_source(&mut self, n: u64) {
        let moved = i64::try_from(n)
            .map_err(|_| Error::InvalidData("skip distance too large"))
            .and_then(|n| self.src.seek(SeekFrom::Current(n)).map_err(Error::from));
        if let Err(e) = moved {
            warn!("cannot skip {n} bytes: {e}");
            self.set_eof_reached();
        }
    }

    /// Fill `buf` from the source, charged to the current range.
    ///
    /// On failure `buf` is zeroed and `false` is returned.
    pub fn read_exact_into(&mut self, buf: &mut [u8]) -> bool {
        if buf.is_empty() {
            return true;
        }
        if !self.read(buf.len().to_u64()) {
            buf.fill(0);
            return false;
        }
        if let Err(e) = self.src.read_exact(buf) {
            debug!("source exhausted: {e}");
            buf.fill(0);
            self.set_eof_reached();
            return false;
        }
        true
    }

    pub fn read_u8(&mut self) -> u8 {
        let mut buf = [0; 1];
        self.read_exact_into(&mut buf);
        buf[0]
    }

    pub fn read16(&mut self) -> u16 {
        let mut buf = [0; 2];
        self.read_exact_into(&mut buf);
        BigEndian::read_u16(&buf)
    }

    pub fn read32(&mut self) -> u32 {
        let mut buf = [0; 4];
        self.read_exact_into(&mut buf);
        BigEndian::read_u32(&buf)
    }

    /// Two 32-bit words, high word first.
    pub fn read64(&mut self) -> u64 {
        let high = u64::from(self.read32());
        let low = u64::from(self.read32());
        high << 32 | low
    }

    /// `len` raw bytes. Empty if the range or the source cannot supply them.
    pub fn read_vec(&mut self, len: u64) -> Result<TryVec<u8>> {
        if len > self.remaining() {
            self.read(len);
            return Ok(TryVec::new());
        }
        let len = usize::try_from(len)?;
        let mut data = std::vec::Vec::new();
        data.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
        data.resize(len, 0);
        if !self.read_exact_into(&mut data) {
            return Ok(TryVec::new());
        }
        Ok(data.into())
    }

    /// A NUL-terminated string, without the terminator.
    ///
    /// A string that is not terminated before the range or the source ends
    /// decodes as empty.
    pub fn read_string(&mut self) -> Result<TryString> {
        let mut s = TryVec::new();
        loop {
            let mut c = [0; 1];
            if !self.read_exact_into(&mut c) {
                return Ok(TryVec::new());
            }
            if c[0] == 0 {
                return Ok(s);
            }
            s.push(c[0])?;
        }
    }
}

#[cfg(test)]
fn cursor(len: usize) -> std::io::Cursor<std::vec::Vec<u8>> {
    std::io::Cursor::new((0..len).map(|i| i as u8).collect())
}

#[test]
fn read_within_budget() {
    for n in 1..=10 {
        let mut src = cursor(16);
        let mut range = BitstreamRange::new(&mut src, 10);
        assert!(range.read(n));
        assert_eq!(range.remaining(), 10 - n);
        assert_eq!(range.eof(), n == 10);
        assert!(!range.error());
    }
}

#[test]
fn read_past_budget_skips_rest() {
    let mut src = cursor(16);
    let mut range = BitstreamRange::new(&mut src, 10);
    assert!(range.read(3));
    assert!(!range.read(8));
    assert_eq!(range.remaining(), 0);
    assert!(range.eof());
    assert!(range.error());
    drop(range);
    // The three "read" bytes were only charged, not consumed, so the cursor
    // moved by the seven-byte remainder alone.
    assert_eq!(src.position(), 7);
}

#[test]
fn read_on_empty_range_fails_without_touching_source() {
    let mut src = cursor(16);
    let mut range = BitstreamRange::new(&mut src, 0);
    assert!(range.eof());
    assert!(!range.read(1));
    assert!(range.error());
    assert_eq!(range.remaining(), 0);
    drop(range);
    assert_eq!(src.position(), 0);
}

#[test]
fn debits_propagate_through_three_levels() {
    let mut src = cursor(128);
    let mut range = BitstreamRange::new(&mut src, 100);
    range.push_child(50).unwrap();
    range.push_child(20).unwrap();
    assert_eq!(range.depth(), 2);

    assert_eq!(range.read32(), 0x0001_0203);
    assert_eq!(range.read16(), 0x0405);
    assert_eq!(range.read_u8(), 6);

    let levels: std::vec::Vec<u64> = (0..3).map(|d| range.budget_at(d).unwrap().remaining()).collect();
    assert_eq!(levels, [93, 43, 13]);

    let leaf = range.pop_child();
    assert!(leaf.eof());
    assert!(!leaf.error());
    assert_eq!(range.budget_at(0).unwrap().remaining(), 80);
    assert_eq!(range.remaining(), 30);
}

#[test]
fn child_budget_is_clamped_to_parent() {
    let mut src = cursor(64);
    let mut range = BitstreamRange::new(&mut src, 12);
    range.push_child(1000).unwrap();
    assert_eq!(range.remaining(), 12);
    assert!(!range.read(13));
    assert!(range.error());
    let child = range.pop_child();
    assert!(child.error());
    assert!(range.eof());
    assert!(!range.error());
}

#[test]
fn source_exhaustion_propagates_to_ancestors() {
    let mut src = cursor(6);
    let mut range = BitstreamRange::new(&mut src, 100);
    range.push_child(40).unwrap();
    assert_eq!(range.read32(), 0x0001_0203);
    assert_eq!(range.read32(), 0);
    assert!(range.eof());
    assert!(range.error());
    range.pop_child();
    assert!(range.eof());
    assert!(range.error());
    assert_eq!(range.remaining(), 0);
}

#[test]
fn unterminated_string_is_empty() {
    let mut src = std::io::Cursor::new(b"abc\0def".to_vec());
    let mut range = BitstreamRange::new(&mut src, 7);
    assert_eq!(&*range.read_string().unwrap(), b"abc");
    assert!(range.read_string().unwrap().is_empty());
    assert!(range.error());
}

#[test]
fn skip_to_end_of_file_empties_every_level() {
    let mut src = cursor(32);
    let mut range = BitstreamRange::new(&mut src, 32);
    range.push_child(10).unwrap();
    range.skip_to_end_of_file();
    assert!(range.eof());
    assert!(!range.error());
    range.pop_child();
    assert!(range.eof());
    drop(range);
    assert_eq!(src.position(), 32);
}

#[test]
fn from_source_starts_at_cursor() {
    let mut src = cursor(20);
    src.set_position(5);
    let range = BitstreamRange::from_source(&mut src).unwrap();
    assert_eq!(range.remaining(), 15);
}
