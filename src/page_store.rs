// BSD 2-Clause License
//
// Copyright (c) 2020 Brian Campbell
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::error::{CkptError, Result};
use crate::free_list::{FreeList, FreeRange};

pub const PAGE_OFFS: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_OFFS;
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Nothing below this page number is ever handed out by the allocator.
pub const FIRST_PN: u64 = 0x10;

pub const BITMAP_SIZE: usize = PAGE_SIZE / 8;
/// One execution counter per 2-byte instruction slot.
pub const EXEC_SLOTS: usize = PAGE_SIZE / 2;

const BITMAP_WORDS: usize = PAGE_SIZE / 64;

pub fn page_align(addr: u64) -> u64 {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Bytes to store, resolved once at the call site.
#[derive(Clone, Copy, Debug)]
pub enum Payload<'a> {
    Zero(usize),
    /// A hex number literal, stored little-endian with a width of half its
    /// digit count.
    Hex(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> Payload<'a> {
    pub fn to_bytes(&self) -> Result<Cow<'a, [u8]>> {
        match *self {
            Payload::Zero(len) => Ok(Cow::Owned(vec![0; len])),
            Payload::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
            Payload::Hex(digits) => {
                let digits = digits.trim_start_matches("0x");
                if digits.is_empty() || digits.len() % 2 != 0 || !digits.is_ascii() {
                    return Err(CkptError::malformed(format!("Bad hex payload: {}", digits)));
                }
                let mut bytes = (0..digits.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
                    .collect::<std::result::Result<Vec<u8>, _>>()
                    .map_err(|_| CkptError::malformed(format!("Bad hex payload: {}", digits)))?;
                bytes.reverse();
                Ok(Cow::Owned(bytes))
            }
        }
    }
}

#[derive(Clone)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
    written: [u64; BITMAP_WORDS],
    exec: Option<Box<[u32; EXEC_SLOTS]>>,
}

impl Default for Page {
    fn default() -> Self {
        Page::new()
    }
}

impl Page {
    pub fn new() -> Self {
        Page { data: Box::new([0; PAGE_SIZE]), written: [0; BITMAP_WORDS], exec: None }
    }

    /// Build a page from a trace dump block: a little-endian bitmap of
    /// written bytes followed by the page contents. Unwritten bytes are
    /// cleared so they dump as zero.
    pub fn from_parts(bitmap: &[u8], data: &[u8]) -> Result<Self> {
        if bitmap.len() != BITMAP_SIZE || data.len() != PAGE_SIZE {
            return Err(CkptError::malformed("Truncated page block"));
        }
        let mut page = Page::new();
        for (i, word) in bitmap.chunks(8).enumerate() {
            let mut le = [0u8; 8];
            le.copy_from_slice(word);
            page.written[i] = u64::from_le_bytes(le);
        }
        for (off, byte) in data.iter().enumerate() {
            if page.is_written(off) {
                page.data[off] = *byte
            }
        }
        Ok(page)
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn is_written(&self, off: usize) -> bool {
        self.written[off / 64] & (1 << (off % 64)) != 0
    }

    fn mark(&mut self, off: usize) {
        self.written[off / 64] |= 1 << (off % 64)
    }

    fn write(&mut self, off: usize, bytes: &[u8]) {
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
        for i in off..off + bytes.len() {
            self.mark(i)
        }
    }

    pub fn set_exec_counts(&mut self, counts: &[u8]) -> Result<()> {
        if counts.len() != EXEC_SLOTS * 4 {
            return Err(CkptError::malformed("Truncated execution count block"));
        }
        let mut exec = Box::new([0u32; EXEC_SLOTS]);
        for (slot, bytes) in counts.chunks(4).enumerate() {
            exec[slot] = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        self.exec = Some(exec);
        Ok(())
    }

    pub fn exec_count(&self, off: usize) -> Option<u32> {
        self.exec.as_ref().map(|exec| exec[off / 2])
    }

    pub fn has_exec_counts(&self) -> bool {
        self.exec.is_some()
    }
}

/// A maximal run of consecutive pages in a dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Run {
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    /// Bytes actually stored; equal to `size` for uncompressed runs.
    pub length: u64,
}

pub struct Dump {
    pub runs: Vec<Run>,
    pub data: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct PageStore {
    pages: BTreeMap<u64, Page>,
}

impl PageStore {
    pub fn new() -> Self {
        PageStore::default()
    }

    pub fn insert_page(&mut self, pn: u64, page: Page) {
        self.pages.insert(pn, page);
    }

    pub fn page_mut(&mut self, pn: u64) -> &mut Page {
        self.pages.entry(pn).or_insert_with(Page::new)
    }

    /// Attach execution counts to a page that is already present.
    pub fn set_exec_counts(&mut self, pn: u64, counts: &[u8]) -> Result<()> {
        match self.pages.get_mut(&pn) {
            Some(page) => page.set_exec_counts(counts),
            None => Err(CkptError::malformed(format!("Execution counts for missing page {:#x}", pn))),
        }
    }

    pub fn page_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.keys().copied()
    }

    pub fn has_exec_counts(&self) -> bool {
        self.pages.values().any(Page::has_exec_counts)
    }

    /// Write `payload` at `addr`, marking every byte written. Later writes
    /// always replace earlier ones.
    pub fn put(&mut self, addr: u64, payload: Payload) -> Result<()> {
        let bytes = payload.to_bytes()?;
        let mut addr = addr;
        let mut rest: &[u8] = &bytes;
        while !rest.is_empty() {
            let off = (addr & PAGE_MASK) as usize;
            let n = rest.len().min(PAGE_SIZE - off);
            self.page_mut(addr >> PAGE_OFFS).write(off, &rest[..n]);
            addr += n as u64;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Mark `len` bytes at `addr` as written without changing their contents.
    pub fn protect(&mut self, addr: u64, len: u64) {
        for a in addr..addr + len {
            self.page_mut(a >> PAGE_OFFS).mark((a & PAGE_MASK) as usize)
        }
    }

    pub fn is_written(&self, addr: u64) -> bool {
        self.pages.get(&(addr >> PAGE_OFFS)).map_or(false, |page| page.is_written((addr & PAGE_MASK) as usize))
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        (addr..addr + len as u64)
            .map(|a| self.pages.get(&(a >> PAGE_OFFS)).map_or(0, |page| page.data[(a & PAGE_MASK) as usize]))
            .collect()
    }

    pub fn exec_count(&self, addr: u64) -> Option<u32> {
        self.pages.get(&(addr >> PAGE_OFFS)).and_then(|page| page.exec_count((addr & PAGE_MASK) as usize))
    }

    /// Every maximal run of unwritten bytes between the reservation boundary
    /// and the end of the highest known page, with both bounds rounded
    /// inwards to even addresses. Unknown pages in between count as free.
    pub fn free_list(&self) -> FreeList {
        let mut ranges = Vec::new();
        let mut start: Option<u64> = None;
        let mut next_pn = FIRST_PN;

        for (&pn, page) in self.pages.range(FIRST_PN..) {
            if pn > next_pn && start.is_none() {
                start = Some(next_pn << PAGE_OFFS)
            }
            let base = pn << PAGE_OFFS;
            for (w, &bits) in page.written.iter().enumerate() {
                let word_base = base + (w * 64) as u64;
                if bits == 0 {
                    start.get_or_insert(word_base);
                } else if bits == !0 {
                    if let Some(s) = start.take() {
                        push_aligned(&mut ranges, s, word_base)
                    }
                } else {
                    for bit in 0..64 {
                        let written = bits & (1 << bit) != 0;
                        match (start, written) {
                            (None, false) => start = Some(word_base + bit),
                            (Some(s), true) => {
                                push_aligned(&mut ranges, s, word_base + bit);
                                start = None
                            }
                            _ => (),
                        }
                    }
                }
            }
            next_pn = pn + 1
        }
        if let Some(s) = start {
            push_aligned(&mut ranges, s, next_pn << PAGE_OFFS)
        }
        FreeList::from_ranges(ranges)
    }

    /// Lowest page-aligned address at or above the reservation boundary
    /// where `size` bytes fit without touching any known page.
    pub fn reserve_page_aligned(&self, size: u64) -> u64 {
        let n = (page_align(size) >> PAGE_OFFS).max(1);
        let mut p = FIRST_PN;
        for &pn in self.pages.range(FIRST_PN..).map(|(pn, _)| pn) {
            if pn >= p + n {
                break;
            }
            if pn >= p {
                p = pn + 1
            }
        }
        p << PAGE_OFFS
    }

    /// Raw page contents grouped into runs of physically adjacent pages.
    pub fn dump(&self) -> Dump {
        let mut runs: Vec<Run> = Vec::new();
        let mut data = Vec::with_capacity(self.pages.len() * PAGE_SIZE);
        for (&pn, page) in &self.pages {
            let addr = pn << PAGE_OFFS;
            match runs.last_mut() {
                Some(run) if run.addr + run.size == addr => {
                    run.size += PAGE_SIZE as u64;
                    run.length += PAGE_SIZE as u64
                }
                _ => runs.push(Run {
                    addr,
                    offset: data.len() as u64,
                    size: PAGE_SIZE as u64,
                    length: PAGE_SIZE as u64,
                }),
            }
            data.extend_from_slice(page.data());
        }
        Dump { runs, data }
    }

    /// Rebuild a store from the runs and data of a dump. Every loaded byte
    /// is considered written.
    pub fn load(runs: &[Run], data: &[u8]) -> Result<Self> {
        let mut store = PageStore::new();
        for run in runs {
            if run.size != run.length {
                return Err(CkptError::malformed(format!("Compressed run at {:#x}", run.addr)));
            }
            if run.addr & PAGE_MASK != 0 || run.size & PAGE_MASK != 0 {
                return Err(CkptError::malformed(format!("Unaligned run at {:#x}", run.addr)));
            }
            let end = run.offset.checked_add(run.length).filter(|&end| end <= data.len() as u64);
            let end = end.ok_or_else(|| CkptError::malformed(format!("Run at {:#x} past end of dump", run.addr)))?;
            store.put(run.addr, Payload::Bytes(&data[run.offset as usize..end as usize]))?;
        }
        Ok(store)
    }

    /// Value copy used to roll back to the untouched memory image.
    pub fn snapshot(&self) -> PageStore {
        self.clone()
    }
}

fn push_aligned(ranges: &mut Vec<FreeRange>, begin: u64, end: u64) {
    let begin = (begin + 1) & !1;
    let end = end & !1;
    if begin < end {
        ranges.push(FreeRange { begin, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = FIRST_PN << PAGE_OFFS;

    #[test]
    fn put_spans_pages() {
        let mut store = PageStore::new();
        store.put(BASE + 0xffe, Payload::Bytes(&[1, 2, 3, 4])).unwrap();
        assert_eq!(store.page_numbers().collect::<Vec<_>>(), vec![0x10, 0x11]);
        assert_eq!(store.read(BASE + 0xffe, 4), vec![1, 2, 3, 4]);
        assert!(store.is_written(BASE + 0x1001));
        assert!(!store.is_written(BASE + 0x1002));
    }

    #[test]
    fn later_put_wins() {
        let mut store = PageStore::new();
        store.put(BASE, Payload::Bytes(&[1, 2])).unwrap();
        store.put(BASE, Payload::Zero(1)).unwrap();
        assert_eq!(store.read(BASE, 2), vec![0, 2]);
    }

    #[test]
    fn hex_payload_is_little_endian() {
        let mut store = PageStore::new();
        store.put(BASE, Payload::Hex("00000073")).unwrap();
        assert_eq!(store.read(BASE, 4), vec![0x73, 0, 0, 0]);
        assert!(Payload::Hex("123").to_bytes().is_err());
        assert!(Payload::Hex("zz").to_bytes().is_err());
    }

    #[test]
    fn protect_keeps_contents() {
        let mut store = PageStore::new();
        store.put(BASE, Payload::Bytes(&[0x73])).unwrap();
        store.protect(BASE, 4);
        assert_eq!(store.read(BASE, 4), vec![0x73, 0, 0, 0]);
        assert!((BASE..BASE + 4).all(|a| store.is_written(a)));
    }

    #[test]
    fn free_list_covers_gaps_and_unknown_pages() {
        let mut store = PageStore::new();
        store.put(BASE + 0x11, Payload::Zero(3)).unwrap();
        store.put((0x13 << PAGE_OFFS) + 0x800, Payload::Zero(1)).unwrap();
        let ranges: Vec<(u64, u64)> = store.free_list().ranges().iter().map(|r| (r.begin, r.end)).collect();
        assert_eq!(
            ranges,
            vec![
                (BASE, BASE + 0x10),
                (BASE + 0x14, (0x13 << PAGE_OFFS) + 0x800),
                ((0x13 << PAGE_OFFS) + 0x802, 0x14 << PAGE_OFFS),
            ]
        );
    }

    #[test]
    fn free_list_ignores_low_memory() {
        let mut store = PageStore::new();
        store.put(0x1000, Payload::Zero(1)).unwrap();
        assert!(store.free_list().ranges().is_empty());
    }

    #[test]
    fn page_aligned_reservation_skips_known_pages() {
        let mut store = PageStore::new();
        store.put(BASE, Payload::Zero(1)).unwrap();
        store.put(0x12 << PAGE_OFFS, Payload::Zero(1)).unwrap();
        assert_eq!(store.reserve_page_aligned(PAGE_SIZE as u64), 0x11 << PAGE_OFFS);
        assert_eq!(store.reserve_page_aligned(2 * PAGE_SIZE as u64), 0x13 << PAGE_OFFS);
        assert_eq!(PageStore::new().reserve_page_aligned(1), BASE);
    }

    #[test]
    fn dump_merges_adjacent_pages() {
        let mut store = PageStore::new();
        store.put(BASE, Payload::Bytes(&[1])).unwrap();
        store.put(BASE + PAGE_SIZE as u64, Payload::Bytes(&[2])).unwrap();
        store.put(0x20 << PAGE_OFFS, Payload::Bytes(&[3])).unwrap();
        let dump = store.dump();
        assert_eq!(
            dump.runs,
            vec![
                Run { addr: BASE, offset: 0, size: 0x2000, length: 0x2000 },
                Run { addr: 0x20000, offset: 0x2000, size: 0x1000, length: 0x1000 },
            ]
        );
        assert_eq!(dump.data.len(), 3 * PAGE_SIZE);

        let reloaded = PageStore::load(&dump.runs, &dump.data).unwrap();
        for pn in store.page_numbers() {
            assert_eq!(reloaded.pages[&pn].data(), store.pages[&pn].data());
        }
    }

    #[test]
    fn page_block_masks_unwritten_bytes() {
        let mut bitmap = vec![0u8; BITMAP_SIZE];
        bitmap[0] = 0b0000_0101;
        let data = vec![0xffu8; PAGE_SIZE];
        let page = Page::from_parts(&bitmap, &data).unwrap();
        assert_eq!(&page.data()[..3], &[0xff, 0, 0xff]);
        assert!(page.is_written(2) && !page.is_written(1));
        assert!(Page::from_parts(&bitmap[1..], &data).is_err());
    }

    #[test]
    fn exec_counts_need_a_page() {
        let mut store = PageStore::new();
        let counts = vec![0u8; EXEC_SLOTS * 4];
        assert!(store.set_exec_counts(0x10, &counts).is_err());
        assert_eq!(store.page_numbers().count(), 0);
        store.put(BASE, Payload::Zero(1)).unwrap();
        store.set_exec_counts(0x10, &counts).unwrap();
        assert_eq!(store.exec_count(BASE), Some(0));
    }

    #[test]
    fn snapshot_keeps_untouched_image() {
        let mut store = PageStore::new();
        store.put(BASE, Payload::Bytes(&[7])).unwrap();
        let snapshot = store.snapshot();
        store.put(BASE, Payload::Bytes(&[8])).unwrap();
        store.put(0x30000, Payload::Zero(4)).unwrap();
        assert_eq!(snapshot.read(BASE, 1), vec![7]);
        assert_eq!(snapshot.page_numbers().count(), 1);
        assert_eq!(store.page_numbers().count(), 2);
    }
}
