// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use zerocopy::{AsBytes, FromBytes, Unaligned};
use num_traits::FromPrimitive;

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

pub fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in buffer");
    (lv.into_ref(), rest)
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.
//
// A file is a small ring of pages. Byte 0 of each page is the page counter;
// the rest of the page is a dense stream of chunks, each two header bytes
// followed by payload. Unprogrammed bytes read 0xFF. Every state transition
// a chunk undergoes clears bits in exactly one byte, which is the only write
// granularity the power-failure model guarantees.

/// Value of an unprogrammed flash byte.
pub const ERASED: u8 = 0xFF;

/// Bytes reserved at the start of each page for the page counter.
pub const COUNTER_BYTES: u32 = 1;

/// Bytes of chunk metadata preceding the payload.
pub const HEADER_BYTES: u32 = 2;

/// Largest payload a single chunk can carry. 0xFF is reserved to mean "no
/// chunk here", so sizes run 1..=254.
pub const MAX_PAYLOAD: usize = 254;

/// Two-byte header preceding every chunk's payload.
///
/// The writer programs `size` first, then the payload, then clears `state`
/// to `Valid`. The consumer later clears `state` to `Consumed`. Each step
/// touches a single byte, so an interruption leaves a recognisable
/// intermediate rather than torn metadata.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct ChunkHeader {
    /// Payload length in bytes, 1..=254. 0xFF means the slot is erased.
    pub size: u8,
    /// Lifecycle byte; see `ChunkState`.
    pub state: u8,
}

impl ChunkHeader {
    /// Header for a freshly staged chunk: the size is programmed, the state
    /// byte is left erased. Programming this over erased flash touches only
    /// the size byte.
    pub fn staged(size: u8) -> Self {
        Self { size, state: ChunkState::Invalid as u8 }
    }

    /// Classify this header per the on-flash state machine.
    pub fn classify(&self) -> ChunkClass {
        classify(self.size, self.state)
    }

    /// Whole-chunk length on flash: header plus payload.
    pub fn span(&self) -> u32 {
        u32::from(self.size) + HEADER_BYTES
    }
}

/// Defined values of the chunk state byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum ChunkState {
    /// Erased, or staged but never committed. Readers skip these.
    Invalid = 0xFF,
    /// Committed; the payload is durable and visible.
    Valid = 0xFE,
    /// Surrendered for page reclamation.
    Consumed = 0xFC,
}

/// What a `(size, state)` pair means.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkClass {
    /// Both bytes erased: no chunk here, and none after it on this page.
    Erased,
    /// Size programmed but never committed -- a write lost to a power cut.
    /// Occupies space, carries nothing.
    Invalid,
    /// A committed record.
    Valid,
    /// A record the destructive reader has surrendered.
    Consumed,
    /// A pair no legal write sequence can produce.
    Corrupt,
}

/// The full classification table. Anything outside the five legal rows is
/// `Corrupt` and can only be left behind by an interrupted erase.
pub fn classify(size: u8, state: u8) -> ChunkClass {
    match size {
        ERASED => {
            if state == ERASED {
                ChunkClass::Erased
            } else {
                ChunkClass::Corrupt
            }
        }
        1..=254 => match ChunkState::from_u8(state) {
            Some(ChunkState::Invalid) => ChunkClass::Invalid,
            Some(ChunkState::Valid) => ChunkClass::Valid,
            Some(ChunkState::Consumed) => ChunkClass::Consumed,
            None => ChunkClass::Corrupt,
        },
        _ => ChunkClass::Corrupt,
    }
}

//////////////////////////////////////////////////////////////////////////////
// Page counters.
//
// Byte 0 of a page orders page writes without ever needing an erase: rank r
// is recorded as 0xFF << r, so advancing the rank only clears bits. Fewer
// one bits means written later. 0xFF is an erased (free) page, and any value
// off the mask sequence is the footprint of an interrupted erase.

/// Is `c` a value the counter byte can legally hold?
pub fn counter_is_legal(c: u8) -> bool {
    matches!(c, 0xFF | 0xFE | 0xFC | 0xF8 | 0xF0 | 0xE0 | 0xC0 | 0x80 | 0x00)
}

/// Counter value recording write rank `rank` (1..=8).
pub fn counter_for_rank(rank: u8) -> u8 {
    debug_assert!((1..=8).contains(&rank));
    ((0xFFu16 << rank) & 0xFF) as u8
}

/// The rank that follows `rank`, cycling 8 -> 1.
pub fn rank_after(rank: u8) -> u8 {
    rank % 8 + 1
}

/// Rank of the *next* page to claim, recovered from the newest counter on
/// flash: 9 - popcount, cycling 9 -> 1.
pub fn rank_from_counter(c: u8) -> u8 {
    let rank = 9 - c.count_ones() as u8;
    if rank == 9 { 1 } else { rank }
}

//////////////////////////////////////////////////////////////////////////////
// Flash device interface.

/// Trait describing NOR flash for the purposes of the queue engine.
///
/// The engine assumes the semantics actual NOR parts provide: `read` is
/// unrestricted, `program` can only clear bits (it ANDs into the existing
/// contents, and a power cut may leave any prefix of the bytes landed), and
/// `erase_page` restores a whole page to 0xFF (a power cut mid-erase may
/// leave the page holding arbitrary garbage). Single-byte programs are
/// atomic across power failure; nothing larger is.
///
/// Addresses are device-linear; the engine adds each file's base itself.
/// All three operations block until complete.
pub trait Flash {
    /// Error type that can be produced during flash accesses. Device-level
    /// adapters are typically infallible apart from power loss; host-side
    /// image backends use this to surface I/O errors.
    type Error;

    /// Size in bytes of the erase unit. Must be constant for the life of
    /// the device.
    fn page_size(&self) -> u32;

    /// Copies `out.len()` bytes starting at `addr` into `out`.
    fn read(&self, addr: u32, out: &mut [u8]) -> Result<(), Self::Error>;

    /// ANDs `data` into the flash contents starting at `addr`.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Restores the page beginning at `addr` (which must be page-aligned)
    /// to all-0xFF.
    fn erase_page(&mut self, addr: u32) -> Result<(), Self::Error>;
}

/// Reads one byte. The engine's scans are almost entirely byte-granular.
pub(crate) fn read_byte<F: Flash>(flash: &F, addr: u32) -> Result<u8, F::Error> {
    let mut b = [0u8; 1];
    flash.read(addr, &mut b)?;
    Ok(b[0])
}

/// Reads the chunk header at file-relative offset `off`.
pub fn read_header<F: Flash>(
    flash: &F,
    region: Region,
    off: u32,
) -> Result<ChunkHeader, F::Error> {
    let mut b = [0u8; HEADER_BYTES as usize];
    flash.read(region.addr(off), &mut b)?;
    Ok(*cast_prefix::<ChunkHeader>(&b).0)
}

/// Publishes the staged chunk at `off`: clears its state byte to `Valid`.
/// This single-byte program is the linearisation point of a write.
pub(crate) fn commit_chunk<F: Flash>(
    flash: &mut F,
    region: Region,
    off: u32,
) -> Result<(), F::Error> {
    flash.program(region.addr(off + 1), &[ChunkState::Valid as u8])
}

/// Stamps the chunk at `off` consumed.
pub(crate) fn consume_chunk<F: Flash>(
    flash: &mut F,
    region: Region,
    off: u32,
) -> Result<(), F::Error> {
    flash.program(region.addr(off + 1), &[ChunkState::Consumed as u8])
}

/// Writes the page counter claiming the erased page at `page_start` with
/// write rank `rank`.
pub(crate) fn claim_page<F: Flash>(
    flash: &mut F,
    region: Region,
    page_start: u32,
    rank: u8,
) -> Result<(), F::Error> {
    flash.program(region.addr(page_start), &[counter_for_rank(rank)])
}

//////////////////////////////////////////////////////////////////////////////
// Regions and ring arithmetic.

/// The contiguous, page-aligned range of flash one file owns. Heads move
/// through it as a ring; all offsets handed to the functions below are
/// relative to `base`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    /// Device-linear address of the first page.
    pub base: u32,
    /// Erase-unit size, from the device.
    pub page_size: u32,
    /// Pages in the region. At least three, so one page can be erasing
    /// while another is written and a third read; at most eight, the
    /// ordering capacity of the one-byte counter.
    pub pages: u32,
}

impl Region {
    pub fn new(base: u32, page_size: u32, pages: u32) -> Self {
        assert!(pages >= 3, "a file needs at least three pages");
        assert!(pages <= 8, "one-byte counters order at most eight pages");
        assert!(page_size > COUNTER_BYTES + HEADER_BYTES);
        assert!(base % page_size == 0, "regions are page-aligned");
        Self { base, page_size, pages }
    }

    /// Total bytes in the region.
    pub fn len(&self) -> u32 {
        self.page_size * self.pages
    }

    pub(crate) fn addr(&self, off: u32) -> u32 {
        debug_assert!(off < self.len());
        self.base + off
    }

    pub(crate) fn page_index(&self, off: u32) -> u32 {
        off / self.page_size
    }

    pub(crate) fn page_start(&self, off: u32) -> u32 {
        off - off % self.page_size
    }

    /// First chunk slot of the page after the one containing `off`,
    /// wrapping at the end of the region.
    pub(crate) fn next_page_slot(&self, off: u32) -> u32 {
        let mut p = self.page_start(off) + self.page_size;
        if p >= self.len() {
            p = 0;
        }
        p + COUNTER_BYTES
    }

    /// First chunk slot of the page before the one containing `off`.
    pub(crate) fn prev_page_slot(&self, off: u32) -> u32 {
        let ps = self.page_start(off);
        if ps == 0 {
            self.len() - self.page_size + COUNTER_BYTES
        } else {
            ps - self.page_size + COUNTER_BYTES
        }
    }

}

//////////////////////////////////////////////////////////////////////////////
// The cursor engine.
//
// The non-destructive read head and the destructive read head move through
// the ring with identical logic; the only differences are where they stop
// (the write head, or the read head) and whether the bytes they pass over
// are credited back to free space. One resolver serves both.

/// Resolves `pos` to a landing position: the next committed chunk at or
/// after `pos`, or the stop position, whichever comes first. Invalid and
/// consumed chunks are skipped; an erased slot means the rest of the page
/// is dead and the cursor hops to the next page. Page counter bytes are
/// skipped but never credited to `reclaimed` -- they stay unavailable until
/// the page is erased.
///
/// The stop position may be a stalled writer's page boundary; the cursor
/// then parks exactly on the boundary, never on the slot past it. That
/// keeps head comparisons exact, and keeps "caught up behind a stalled
/// writer" distinguishable from "a full lap of records starts just past
/// the stalled writer".
pub(crate) fn resolve_landing<F: Flash>(
    flash: &F,
    region: Region,
    mut pos: u32,
    stop: u32,
    mut reclaimed: Option<&mut u32>,
) -> Result<u32, F::Error> {
    loop {
        if pos >= region.len() {
            pos = 0;
        }
        if pos == stop {
            return Ok(pos);
        }
        if pos % region.page_size == 0 {
            pos += COUNTER_BYTES;
            continue;
        }
        let remaining = region.page_size - pos % region.page_size;
        if remaining < HEADER_BYTES {
            // Too little room before the boundary to hold a header; the
            // leftover byte is dead.
            if let Some(r) = reclaimed.as_deref_mut() {
                *r += remaining;
            }
            pos += remaining;
            continue;
        }
        let hdr = read_header(flash, region, pos)?;
        if hdr.classify() == ChunkClass::Valid {
            return Ok(pos);
        }
        let step = if hdr.size == ERASED {
            // Dead tail: nothing further on this page.
            remaining
        } else {
            hdr.span()
        };
        if let Some(r) = reclaimed.as_deref_mut() {
            *r += step;
        }
        pos += step;
    }
}

/// Advances a head off the chunk it rests on and lands it per
/// `resolve_landing`. The departed chunk's own bytes are credited to
/// `reclaimed` when present.
pub(crate) fn advance_cursor<F: Flash>(
    flash: &F,
    region: Region,
    pos: u32,
    stop: u32,
    mut reclaimed: Option<&mut u32>,
) -> Result<u32, F::Error> {
    let hdr = read_header(flash, region, pos)?;
    let step = hdr.span();
    if let Some(r) = reclaimed.as_deref_mut() {
        *r += step;
    }
    resolve_landing(flash, region, pos + step, stop, reclaimed)
}

//////////////////////////////////////////////////////////////////////////////
// Page reclamation.

/// Erases the page at `page_start` if the destructive head has finished
/// with it: its first chunk must be stamped consumed, and neither the write
/// head nor the raw read head may still be inside it. A write head hovering
/// on the page's first byte counts as outside -- it is parked there waiting
/// for precisely this erase. A raw read head that has caught the write head
/// (it parks on the writer's own position, boundary included) protects
/// nothing and also counts as outside.
///
/// Returns whether the page was erased.
pub(crate) fn erase_if_vacated<F: Flash>(
    flash: &mut F,
    region: Region,
    page_start: u32,
    write_offset: u32,
    raw_start: u32,
) -> Result<bool, F::Error> {
    let first = read_header(flash, region, page_start + COUNTER_BYTES)?;
    if first.classify() != ChunkClass::Consumed {
        return Ok(false);
    }
    let page_end = page_start + region.page_size;
    if write_offset > page_start && write_offset < page_end {
        return Ok(false);
    }
    let raw_caught = raw_start == write_offset;
    if !raw_caught && raw_start >= page_start && raw_start < page_end {
        return Ok(false);
    }
    flash.erase_page(region.addr(page_start))?;
    Ok(true)
}

//////////////////////////////////////////////////////////////////////////////
// Recovery: rebuilding every head from flash contents alone.

/// Pass one of recovery: find and erase a page wrecked by an interrupted
/// erase. Such a page betrays itself either by a counter byte off the mask
/// sequence or by a chunk pair no write sequence can produce (including a
/// size that would run past the page's end). Erases are serialised, so at
/// most one page can be affected; the sweep stops at the first repair.
pub(crate) fn repair_corrupt_pages<F: Flash>(
    flash: &mut F,
    region: Region,
) -> Result<(), F::Error> {
    for page in 0..region.pages {
        let page_start = page * region.page_size;
        let counter = read_byte(flash, region.addr(page_start))?;
        if !counter_is_legal(counter) {
            flash.erase_page(region.addr(page_start))?;
            return Ok(());
        }
        let page_end = page_start + region.page_size;
        let mut pos = page_start + COUNTER_BYTES;
        while pos + HEADER_BYTES <= page_end {
            let hdr = read_header(flash, region, pos)?;
            match hdr.classify() {
                ChunkClass::Corrupt => {
                    flash.erase_page(region.addr(page_start))?;
                    return Ok(());
                }
                ChunkClass::Erased => {
                    // Walk the tail two bytes at a time looking for stray
                    // programmed bytes.
                    pos += HEADER_BYTES;
                }
                _ => {
                    let next = pos + hdr.span();
                    if next > page_end {
                        // Chunks never straddle a page.
                        flash.erase_page(region.addr(page_start))?;
                        return Ok(());
                    }
                    pos = next;
                }
            }
        }
    }
    Ok(())
}

/// Write head position and the rank of the next page claim, as rebuilt by
/// `locate_write_head`.
pub(crate) struct WriteHead {
    pub offset: u32,
    pub write_count: u8,
}

/// Pass two of recovery: the write head lives on the page with the
/// smallest non-erased counter (fewest one bits, hence written last), at
/// the first erased chunk slot. Walking there may run off the end of a
/// completely full page, in which case the head claims the next page if it
/// is erased, or parks on the boundary to stall if it is not.
///
/// A wholly erased file claims its first page immediately.
pub(crate) fn locate_write_head<F: Flash>(
    flash: &mut F,
    region: Region,
) -> Result<WriteHead, F::Error> {
    let mut newest: Option<(u32, u8)> = None;
    for page in 0..region.pages {
        let ps = page * region.page_size;
        let counter = read_byte(flash, region.addr(ps))?;
        if counter == ERASED {
            continue;
        }
        match newest {
            Some((_, best)) if counter >= best => (),
            _ => newest = Some((ps, counter)),
        }
    }

    let (mut pos, mut write_count) = match newest {
        None => {
            claim_page(flash, region, 0, 1)?;
            return Ok(WriteHead {
                offset: COUNTER_BYTES,
                write_count: rank_after(1),
            });
        }
        Some((ps, counter)) => (ps + COUNTER_BYTES, rank_from_counter(counter)),
    };

    loop {
        if pos % region.page_size == 0 {
            if pos >= region.len() {
                pos = 0;
            }
            let counter = read_byte(flash, region.addr(pos))?;
            if counter != ERASED {
                // The next page has not been reclaimed yet; stall here.
                break;
            }
            claim_page(flash, region, pos, write_count)?;
            write_count = rank_after(write_count);
            pos += COUNTER_BYTES;
        }
        if region.page_size - pos % region.page_size < HEADER_BYTES + 1 {
            // No chunk fits in what is left of this page; park here. The
            // next write charges the tail and moves on.
            break;
        }
        let size = read_byte(flash, region.addr(pos))?;
        if size == ERASED {
            break;
        }
        pos += u32::from(size) + HEADER_BYTES;
    }

    Ok(WriteHead { offset: pos, write_count })
}

/// Pass three of recovery: place the destructive read head on the oldest
/// surviving record.
///
/// Step backwards from the write head's page until hitting a page that
/// starts with a consumed chunk (the oldest survivor is inside or just past
/// it), an erased page (the previously examined page was the earliest live
/// one), or the write-head page again (full circle: the oldest data begins
/// just past it). The candidate is then swept forward to the first
/// committed chunk, erasing any page that turns out to hold nothing but
/// consumed and aborted chunks -- a crash can separate the final consume on
/// a page from its erase.
pub(crate) fn locate_oldest<F: Flash>(
    flash: &mut F,
    region: Region,
    write_offset: u32,
) -> Result<u32, F::Error> {
    let write_page = region.page_start(write_offset);

    if write_offset % region.page_size == 0 {
        // The writer is stalled hovering over `write_page`, so the oldest
        // records start right there; no backward walk is needed. The
        // forward sweep finds the first survivor, erasing spent pages as
        // it goes -- a crash can separate the final consume on a page from
        // the erase the writer is waiting for. If nothing at all survives,
        // the sweep comes back around and parks on the writer's boundary.
        return sweep_to_oldest(flash, region, write_page + COUNTER_BYTES, write_offset);
    }

    let mut pos = write_page + COUNTER_BYTES;
    let mut pages_examined = 0;
    loop {
        if pages_examined > 0 && region.page_start(pos) == write_page {
            pos = region.next_page_slot(pos);
            break;
        }
        let counter = read_byte(flash, region.addr(region.page_start(pos)))?;
        if counter == ERASED {
            pos = region.next_page_slot(pos);
            break;
        }
        if read_header(flash, region, pos)?.classify() == ChunkClass::Consumed {
            break;
        }
        pos = region.prev_page_slot(pos);
        pages_examined += 1;
    }

    sweep_to_oldest(flash, region, pos, write_offset)
}

/// Forward sweep from a candidate position to the first committed chunk or
/// the write head. A page crossed in full held only consumed or aborted
/// chunks; it is spent, and is erased on the way past. Like the cursor
/// engine, a sweep that catches a stalled writer parks exactly on its
/// boundary.
fn sweep_to_oldest<F: Flash>(
    flash: &mut F,
    region: Region,
    mut pos: u32,
    write_offset: u32,
) -> Result<u32, F::Error> {
    let stop = write_offset;
    loop {
        if pos >= region.len() || pos % region.page_size == 0 {
            if pos >= region.len() {
                pos = 0;
            }
            // Crossing a boundary means the page behind held nothing live;
            // reclaim it before moving on (or before parking, if the
            // writer is stalled on this very boundary). Pages never
            // claimed are already erased and cost no cycle.
            let spent = if pos == 0 {
                region.len() - region.page_size
            } else {
                pos - region.page_size
            };
            if read_byte(flash, region.addr(spent))? != ERASED {
                flash.erase_page(region.addr(spent))?;
            }
            if pos == stop {
                return Ok(pos);
            }
            pos += COUNTER_BYTES;
        }
        if pos == stop {
            return Ok(pos);
        }
        let remaining = region.page_size - pos % region.page_size;
        if remaining < HEADER_BYTES {
            pos += remaining;
            continue;
        }
        let hdr = read_header(flash, region, pos)?;
        match hdr.classify() {
            ChunkClass::Valid => return Ok(pos),
            _ if hdr.size == ERASED => {
                // Dead tail after nothing but skippable chunks: the rest of
                // the page is spent too. Land on the boundary so the next
                // turn of the loop reclaims the page.
                pos = region.page_start(pos) + region.page_size;
            }
            _ => pos += hdr.span(),
        }
    }
}

/// Final pass of recovery: rebuild `free_space` with one scan instead of
/// trusting any pre-crash arithmetic. Everything from the oldest surviving
/// record to the write head is charged -- chunk spans and dead page tails
/// -- plus one counter byte for every page not currently erased.
///
/// `oldest` equal to the write head means an empty ring and charges
/// nothing. A completely full ring cannot be mistaken for it: there the
/// writer is stalled on a page boundary and the oldest record sits just
/// past that boundary's counter byte, so the walk covers the whole lap and
/// the recount comes out at zero.
pub(crate) fn recount_free_space<F: Flash>(
    flash: &F,
    region: Region,
    oldest: u32,
    write_offset: u32,
) -> Result<u32, F::Error> {
    let mut free = region.len();
    for page in 0..region.pages {
        let ps = page * region.page_size;
        if read_byte(flash, region.addr(ps))? != ERASED {
            free -= COUNTER_BYTES;
        }
    }

    let stop = write_offset;
    let mut pos = oldest;
    while pos != stop {
        if pos % region.page_size == 0 {
            pos += COUNTER_BYTES;
            continue;
        }
        let remaining = region.page_size - pos % region.page_size;
        let step = if remaining < HEADER_BYTES {
            remaining
        } else {
            let hdr = read_header(flash, region, pos)?;
            if hdr.size == ERASED { remaining } else { hdr.span() }
        };
        free -= step;
        pos += step;
        if pos >= region.len() {
            pos = 0;
        }
    }
    Ok(free)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// NOR flash emulated in RAM, with the power-failure knobs the engine's
    /// crash tests need: programs silently stop landing once the write
    /// budget runs out, and a page can be scrambled to the image an
    /// interrupted erase leaves behind.
    pub(crate) struct RamFlash {
        mem: Vec<u8>,
        page_size: u32,
        budget: Option<u32>,
    }

    impl RamFlash {
        pub fn new(page_size: u32, pages: u32) -> Self {
            Self {
                mem: vec![ERASED; (page_size * pages) as usize],
                page_size,
                budget: None,
            }
        }

        /// Let `bytes` more byte-programs land, then cut the power: later
        /// programs are dropped without error, as a dying device drops
        /// them.
        pub fn fail_after(&mut self, bytes: u32) {
            self.budget = Some(bytes);
        }

        pub fn restore_power(&mut self) {
            self.budget = None;
        }

        /// Leave the page at `addr` the way an interrupted erase does:
        /// arbitrary garbage, counter byte off the legal sequence.
        pub fn scramble_page(&mut self, addr: u32) {
            let addr = addr as usize;
            for (i, b) in self.mem[addr..addr + self.page_size as usize]
                .iter_mut()
                .enumerate()
            {
                *b = 0x5A ^ (i as u8);
            }
        }

        pub fn bytes(&self) -> &[u8] {
            &self.mem
        }
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub(crate) enum NoError {}

    impl Flash for RamFlash {
        type Error = NoError;

        fn page_size(&self) -> u32 {
            self.page_size
        }

        fn read(&self, addr: u32, out: &mut [u8]) -> Result<(), Self::Error> {
            let addr = addr as usize;
            out.copy_from_slice(&self.mem[addr..addr + out.len()]);
            Ok(())
        }

        fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
            for (i, &b) in data.iter().enumerate() {
                match self.budget {
                    Some(0) => return Ok(()),
                    Some(ref mut n) => *n -= 1,
                    None => (),
                }
                self.mem[addr as usize + i] &= b;
            }
            Ok(())
        }

        fn erase_page(&mut self, addr: u32) -> Result<(), Self::Error> {
            assert_eq!(addr % self.page_size, 0);
            if let Some(0) = self.budget {
                return Ok(());
            }
            let addr = addr as usize;
            self.mem[addr..addr + self.page_size as usize].fill(ERASED);
            Ok(())
        }
    }

    pub(crate) const PAGE: u32 = 128;

    pub(crate) fn region() -> Region {
        Region::new(0, PAGE, 3)
    }

    /// Lays a chunk down at `off` the way the writer does, returning the
    /// offset just past it.
    pub(crate) fn put_chunk(
        flash: &mut RamFlash,
        region: Region,
        off: u32,
        payload: &[u8],
        state: ChunkState,
    ) -> u32 {
        let hdr = ChunkHeader::staged(payload.len() as u8);
        flash.program(region.addr(off), hdr.as_bytes()).unwrap();
        flash
            .program(region.addr(off + HEADER_BYTES), payload)
            .unwrap();
        if state != ChunkState::Invalid {
            flash
                .program(region.addr(off + 1), &[state as u8])
                .unwrap();
        }
        off + hdr.span()
    }

    #[test]
    fn classify_table() {
        assert_eq!(classify(0xFF, 0xFF), ChunkClass::Erased);
        assert_eq!(classify(0xFF, 0xFE), ChunkClass::Corrupt);
        assert_eq!(classify(0xFF, 0x00), ChunkClass::Corrupt);
        assert_eq!(classify(4, 0xFF), ChunkClass::Invalid);
        assert_eq!(classify(4, 0xFE), ChunkClass::Valid);
        assert_eq!(classify(4, 0xFC), ChunkClass::Consumed);
        assert_eq!(classify(254, 0xFE), ChunkClass::Valid);
        assert_eq!(classify(4, 0xF0), ChunkClass::Corrupt);
        assert_eq!(classify(4, 0x00), ChunkClass::Corrupt);
        assert_eq!(classify(0, 0xFE), ChunkClass::Corrupt);
        assert_eq!(classify(0, 0xFF), ChunkClass::Corrupt);
    }

    #[test]
    fn staged_header_is_size_then_erased() {
        assert_eq!(ChunkHeader::staged(17).as_bytes(), &[17, 0xFF]);
    }

    #[test]
    fn counter_sequence() {
        let expected = [0xFE, 0xFC, 0xF8, 0xF0, 0xE0, 0xC0, 0x80, 0x00];
        let mut rank = 1;
        for &c in &expected {
            assert_eq!(counter_for_rank(rank), c);
            assert!(counter_is_legal(c));
            rank = rank_after(rank);
        }
        assert_eq!(rank, 1); // cycled all the way around
        assert!(counter_is_legal(0xFF));
        assert!(!counter_is_legal(0x81));
        assert!(!counter_is_legal(0x7F));
        assert!(!counter_is_legal(0x01));
    }

    #[test]
    fn rank_recovery_from_counter() {
        // The recovered rank is the rank of the *next* claim.
        assert_eq!(rank_from_counter(0xFE), 2);
        assert_eq!(rank_from_counter(0xFC), 3);
        assert_eq!(rank_from_counter(0x80), 8);
        assert_eq!(rank_from_counter(0x00), 1);
    }

    #[test]
    fn region_ring_arithmetic() {
        let r = region();
        assert_eq!(r.len(), 384);
        assert_eq!(r.page_start(129), 128);
        assert_eq!(r.next_page_slot(130), 257);
        assert_eq!(r.next_page_slot(300), 1);
        assert_eq!(r.prev_page_slot(130), 1);
        assert_eq!(r.prev_page_slot(5), 257);
    }

    #[test]
    fn landing_skips_invalid_and_consumed() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        let a = put_chunk(&mut f, r, 1, &[1, 2], ChunkState::Consumed);
        let b = put_chunk(&mut f, r, a, &[3, 4, 5], ChunkState::Invalid);
        let c = put_chunk(&mut f, r, b, &[6], ChunkState::Valid);
        let write = put_chunk(&mut f, r, c, &[7], ChunkState::Valid);

        let mut reclaimed = 0;
        let pos = resolve_landing(&f, r, 1, write, Some(&mut reclaimed)).unwrap();
        assert_eq!(pos, b); // first committed chunk
        assert_eq!(reclaimed, (2 + 2) + (3 + 2));
    }

    #[test]
    fn landing_hops_dead_tail() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        f.program(128, &[counter_for_rank(2)]).unwrap();
        // One consumed chunk on page 0, rest of the page dead; a committed
        // record at the top of page 1.
        let a = put_chunk(&mut f, r, 1, &[9; 10], ChunkState::Consumed);
        put_chunk(&mut f, r, 129, &[1], ChunkState::Valid);

        let mut reclaimed = 0;
        let pos = resolve_landing(&f, r, 1, 132, Some(&mut reclaimed)).unwrap();
        assert_eq!(pos, 129);
        // The consumed chunk and the dead tail come back; the counter byte
        // of page 1 does not.
        assert_eq!(reclaimed, 12 + (128 - a));
    }

    #[test]
    fn landing_stops_at_stalled_write_head() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        put_chunk(&mut f, r, 1, &[1; 125], ChunkState::Valid);
        // Write head stalled on the boundary of page 1, which holds
        // not-yet-erased consumed data.
        f.program(128, &[counter_for_rank(2)]).unwrap();
        put_chunk(&mut f, r, 129, &[2; 4], ChunkState::Consumed);

        // Advancing off the page-0 record must park on the writer's own
        // boundary, not lap into page 1's stale chunks.
        let pos = advance_cursor(&f, r, 1, 128, None).unwrap();
        assert_eq!(pos, 128);
    }

    #[test]
    fn repair_erases_scrambled_counter() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        put_chunk(&mut f, r, 1, &[1, 2, 3], ChunkState::Valid);
        f.scramble_page(128);

        repair_corrupt_pages(&mut f, r).unwrap();
        assert!(f.bytes()[128..256].iter().all(|&b| b == 0xFF));
        // The healthy page is untouched.
        assert_eq!(f.bytes()[1], 3);
    }

    #[test]
    fn repair_erases_impossible_chunk_pair() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        // Legal counter, but a chunk with an erased size and a programmed
        // state -- no write sequence produces that.
        f.program(0, &[counter_for_rank(1)]).unwrap();
        f.program(2, &[0xFC]).unwrap();

        repair_corrupt_pages(&mut f, r).unwrap();
        assert!(f.bytes()[..128].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn repair_erases_straddling_size() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        // A plausible record followed by a "chunk" whose claimed payload
        // would run past the page's end.
        let a = put_chunk(&mut f, r, 1, &[1; 110], ChunkState::Valid);
        f.program(a, &[200]).unwrap();
        f.program(a + 1, &[0xFE]).unwrap();

        repair_corrupt_pages(&mut f, r).unwrap();
        assert!(f.bytes()[..128].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn repair_leaves_intact_file_alone() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        let a = put_chunk(&mut f, r, 1, &[1, 2], ChunkState::Valid);
        put_chunk(&mut f, r, a, &[3], ChunkState::Invalid);

        let before = f.bytes().to_vec();
        repair_corrupt_pages(&mut f, r).unwrap();
        assert_eq!(f.bytes(), &before[..]);
    }

    #[test]
    fn write_head_on_fresh_file_claims_first_page() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        let wh = locate_write_head(&mut f, r).unwrap();
        assert_eq!(wh.offset, 1);
        assert_eq!(wh.write_count, 2);
        assert_eq!(f.bytes()[0], 0xFE);
    }

    #[test]
    fn write_head_lands_after_last_chunk() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        let a = put_chunk(&mut f, r, 1, &[1, 2, 3, 4], ChunkState::Valid);
        let b = put_chunk(&mut f, r, a, &[5, 6], ChunkState::Invalid);

        let wh = locate_write_head(&mut f, r).unwrap();
        assert_eq!(wh.offset, b);
        assert_eq!(wh.write_count, 2);
    }

    #[test]
    fn write_head_prefers_smaller_counter() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        // Page 0 written first (0xFE), page 1 second (0xFC).
        f.program(0, &[counter_for_rank(1)]).unwrap();
        put_chunk(&mut f, r, 1, &[1; 125], ChunkState::Valid);
        f.program(128, &[counter_for_rank(2)]).unwrap();
        let b = put_chunk(&mut f, r, 129, &[2; 10], ChunkState::Valid);

        let wh = locate_write_head(&mut f, r).unwrap();
        assert_eq!(wh.offset, b);
        assert_eq!(wh.write_count, 3);
    }

    #[test]
    fn write_head_stalls_on_full_ring() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        for page in 0..3u32 {
            f.program(page * PAGE, &[counter_for_rank(page as u8 + 1)])
                .unwrap();
            put_chunk(&mut f, r, page * PAGE + 1, &[7; 125], ChunkState::Valid);
        }
        let wh = locate_write_head(&mut f, r).unwrap();
        // Walked off the end of page 2 and wrapped onto page 0's boundary,
        // which is still occupied.
        assert_eq!(wh.offset, 0);
        assert_eq!(wh.write_count, 4);
    }

    #[test]
    fn oldest_on_fresh_file_is_first_slot() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        let wh = locate_write_head(&mut f, r).unwrap();
        let oldest = locate_oldest(&mut f, r, wh.offset).unwrap();
        assert_eq!(oldest, 1);
    }

    #[test]
    fn oldest_skips_consumed_prefix() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        let a = put_chunk(&mut f, r, 1, &[1, 2], ChunkState::Consumed);
        let b = put_chunk(&mut f, r, a, &[3, 4], ChunkState::Valid);
        let write = put_chunk(&mut f, r, b, &[5, 6], ChunkState::Valid);

        let oldest = locate_oldest(&mut f, r, write).unwrap();
        assert_eq!(oldest, a);
    }

    #[test]
    fn oldest_found_across_pages() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        // Page 0: oldest, partially consumed. Page 1: newer data, where the
        // write head lives.
        f.program(0, &[counter_for_rank(1)]).unwrap();
        let a = put_chunk(&mut f, r, 1, &[1; 60], ChunkState::Consumed);
        put_chunk(&mut f, r, a, &[2; 61], ChunkState::Valid);
        f.program(128, &[counter_for_rank(2)]).unwrap();
        let write = put_chunk(&mut f, r, 129, &[3; 5], ChunkState::Valid);

        let oldest = locate_oldest(&mut f, r, write).unwrap();
        assert_eq!(oldest, a);
    }

    #[test]
    fn recovery_finishes_interrupted_page_reclaim() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        // Page 0 wholly consumed -- the crash hit between the last consume
        // and the page erase. Page 1 holds the live data.
        f.program(0, &[counter_for_rank(1)]).unwrap();
        let mut pos = 1;
        for _ in 0..10 {
            pos = put_chunk(&mut f, r, pos, &[0xAB; 10], ChunkState::Consumed);
        }
        f.program(128, &[counter_for_rank(2)]).unwrap();
        let write = put_chunk(&mut f, r, 129, &[1, 2, 3], ChunkState::Valid);

        let oldest = locate_oldest(&mut f, r, write).unwrap();
        assert_eq!(oldest, 129);
        assert!(f.bytes()[..128].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn recovery_reclaims_spent_page_under_stalled_writer() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        // Ring full, writer stalled on page 0's boundary, and page 0 is
        // wholly consumed but was never erased.
        f.program(0, &[counter_for_rank(1)]).unwrap();
        put_chunk(&mut f, r, 1, &[1; 125], ChunkState::Consumed);
        f.program(128, &[counter_for_rank(2)]).unwrap();
        put_chunk(&mut f, r, 129, &[2; 125], ChunkState::Valid);
        f.program(256, &[counter_for_rank(3)]).unwrap();
        put_chunk(&mut f, r, 257, &[3; 125], ChunkState::Valid);

        let wh = locate_write_head(&mut f, r).unwrap();
        assert_eq!(wh.offset, 0);
        let oldest = locate_oldest(&mut f, r, wh.offset).unwrap();
        assert!(f.bytes()[..128].iter().all(|&b| b == 0xFF));
        // With the spent page gone, the oldest survivor is page 1's
        // record.
        assert_eq!(oldest, 129);
    }

    #[test]
    fn free_space_recount_charges_live_region() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        let a = put_chunk(&mut f, r, 1, &[1, 2, 3, 4], ChunkState::Valid);
        let write = put_chunk(&mut f, r, a, &[5], ChunkState::Invalid);

        let free = recount_free_space(&f, r, 1, write).unwrap();
        // One counter byte, one committed chunk, one aborted chunk.
        assert_eq!(free, 384 - 1 - 6 - 3);
    }

    #[test]
    fn free_space_recount_charges_dead_tail() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        put_chunk(&mut f, r, 1, &[1; 100], ChunkState::Valid);
        f.program(128, &[counter_for_rank(2)]).unwrap();
        let write = put_chunk(&mut f, r, 129, &[2; 8], ChunkState::Valid);

        let free = recount_free_space(&f, r, 1, write).unwrap();
        // Two counters, the 102-byte record, the 25-byte dead tail of page
        // 0, and the 10-byte record on page 1.
        assert_eq!(free, 384 - 2 - 102 - 25 - 10);
    }

    #[test]
    fn vacated_page_erase_respects_heads() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        put_chunk(&mut f, r, 1, &[1; 20], ChunkState::Consumed);

        // Raw head still inside the page: no erase.
        assert!(!erase_if_vacated(&mut f, r, 0, 200, 30).unwrap());
        // Write head inside the page: no erase.
        assert!(!erase_if_vacated(&mut f, r, 0, 50, 200).unwrap());
        // Write head hovering on the boundary counts as outside.
        assert!(erase_if_vacated(&mut f, r, 0, 0, 200).unwrap());
    }

    #[test]
    fn unconsumed_first_chunk_blocks_erase() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        put_chunk(&mut f, r, 1, &[1; 20], ChunkState::Valid);
        assert!(!erase_if_vacated(&mut f, r, 0, 200, 200).unwrap());
    }

    #[test]
    fn caught_up_raw_head_does_not_block_erase() {
        let r = region();
        let mut f = RamFlash::new(PAGE, 3);
        f.program(0, &[counter_for_rank(1)]).unwrap();
        put_chunk(&mut f, r, 1, &[1; 20], ChunkState::Consumed);
        // Writer stalled on this page's boundary, raw head parked on the
        // writer's own position: both count as outside, the erase may
        // proceed.
        assert!(erase_if_vacated(&mut f, r, 0, 0, 0).unwrap());
    }
}
