//! Power-fail-safe FIFO record queues in NOR flash.
//!
//! Each file is a ring of pages holding self-describing chunks; records are
//! appended at the write head, exposed in order at the read head, and
//! surrendered for page reclamation at the destructive read head. All RAM
//! state is rebuilt from flash at open time, so a power cut at any instant
//! costs at most the record that was mid-write.

#![cfg_attr(not(test), no_std)]

pub mod low_level;

use crate::low_level::{
    ChunkHeader, Flash, Region, COUNTER_BYTES, ERASED, HEADER_BYTES, MAX_PAYLOAD,
};
use zerocopy::AsBytes;

/// Pages in each file's ring. Three allows one page to be erased while
/// another is written and a third is read.
pub const PAGES_PER_FILE: u32 = 3;

/// The fixed streams the device keeps. Each maps to its own ring of
/// [`PAGES_PER_FILE`] pages, laid out consecutively from the base of the
/// device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileId {
    RootBlock = 0,
    Firmware,
    DriveLog,
    DebugLog,
    Prefs,
    Alive,
    Scratch,
    CrashLog,
}

impl FileId {
    /// Convenient array of all file ids.
    pub const ALL: [Self; 8] = [
        Self::RootBlock,
        Self::Firmware,
        Self::DriveLog,
        Self::DebugLog,
        Self::Prefs,
        Self::Alive,
        Self::Scratch,
        Self::CrashLog,
    ];
}

/// Things that can go wrong while opening a file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenError<E> {
    /// A handle to this file is already out.
    Busy,
    /// An underlying flash access error occurred.
    Flash(E),
}

impl<E> From<E> for OpenError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

/// The set of FIFO files on one flash device.
///
/// Owns the device and the open-handle registry, so independent devices can
/// coexist; nothing here is process-global. One handle per file may be out
/// at a time, and the engine is strictly single-threaded: every operation
/// is a bounded sequence of blocking flash accesses and at most one erase.
pub struct FileSet<F: Flash> {
    flash: F,
    open: u8,
}

/// An open file: integer head positions into the file's region, rebuilt
/// from flash at open and kept current by every operation. Dropping a
/// handle without [`FileSet::close`] leaves the file marked busy.
#[derive(Debug)]
pub struct FileHandle {
    id: FileId,
    region: Region,
    /// Where the next chunk's size byte goes. On a page boundary, the head
    /// is stalled waiting for that page's erase.
    write_offset: u32,
    /// Chunk under the non-destructive read head.
    raw_read_chunk_start: u32,
    /// Bytes of that chunk already handed out.
    raw_read_chunk_offset: u32,
    /// Oldest record not yet consumed.
    destructive_read_offset: u32,
    /// Rank of the next page claim, 1..=8.
    write_count: u8,
    /// Bytes available for new chunks.
    free_space: u32,
}

impl FileHandle {
    pub fn id(&self) -> FileId {
        self.id
    }
}

impl<F: Flash> FileSet<F> {
    pub fn new(flash: F) -> Self {
        Self { flash, open: 0 }
    }

    /// Gives the flash device back, abandoning any open handles.
    pub fn into_inner(self) -> F {
        self.flash
    }

    fn region_for(&self, id: FileId) -> Region {
        let page_size = self.flash.page_size();
        let file_len = page_size * PAGES_PER_FILE;
        Region::new(id as u32 * file_len, page_size, PAGES_PER_FILE)
    }

    /// Opens `id`, running recovery: repair any erase-interrupted page,
    /// then rebuild every head and the free-space figure by scanning the
    /// file's flash. Fails with `Busy` if a handle is already out.
    pub fn open(&mut self, id: FileId) -> Result<FileHandle, OpenError<F::Error>> {
        let bit = 1u8 << id as u8;
        if self.open & bit != 0 {
            return Err(OpenError::Busy);
        }
        let region = self.region_for(id);

        low_level::repair_corrupt_pages(&mut self.flash, region)?;
        let head = low_level::locate_write_head(&mut self.flash, region)?;
        let oldest = low_level::locate_oldest(&mut self.flash, region, head.offset)?;
        let free_space =
            low_level::recount_free_space(&self.flash, region, oldest, head.offset)?;

        self.open |= bit;
        Ok(FileHandle {
            id,
            region,
            write_offset: head.offset,
            raw_read_chunk_start: oldest,
            raw_read_chunk_offset: 0,
            destructive_read_offset: oldest,
            write_count: head.write_count,
            free_space,
        })
    }

    /// Closes a handle. The engine never buffers, so there is nothing to
    /// flush; the on-flash state already reflects every returned call.
    pub fn close(&mut self, handle: FileHandle) {
        self.open &= !(1u8 << handle.id as u8);
    }

    /// Appends one record. Returns the number of payload bytes written:
    /// all of them, or 0 when the call is rejected -- record empty or over
    /// [`MAX_PAYLOAD`], record too large for a page, not enough free space,
    /// or the write head stalled against a page awaiting erase.
    ///
    /// The staged size byte, the payload, and the commit byte are programmed
    /// in that order; the single-byte commit is the linearisation point. A
    /// power cut before it leaves an aborted chunk that readers skip.
    pub fn write(
        &mut self,
        handle: &mut FileHandle,
        record: &[u8],
    ) -> Result<usize, F::Error> {
        let region = handle.region;

        if handle.write_offset % region.page_size == 0 {
            // Parked on a boundary waiting for an erase; see if it happened.
            let counter =
                low_level::read_byte(&self.flash, region.addr(handle.write_offset))?;
            if counter != ERASED {
                return Ok(0);
            }
            self.claim(handle)?;
        }

        if record.is_empty() || record.len() > MAX_PAYLOAD {
            return Ok(0);
        }
        let need = record.len() as u32 + HEADER_BYTES;
        if need + COUNTER_BYTES > region.page_size {
            return Ok(0);
        }
        if need > handle.free_space {
            return Ok(0);
        }

        let page_end = region.page_start(handle.write_offset) + region.page_size;
        if handle.write_offset + need > page_end {
            // Chunks never straddle a page: the tail dies and the head
            // moves up to the boundary.
            handle.free_space -= page_end - handle.write_offset;
            handle.write_offset = if page_end == region.len() { 0 } else { page_end };
            let counter =
                low_level::read_byte(&self.flash, region.addr(handle.write_offset))?;
            if counter != ERASED {
                return Ok(0); // stalled on the next page
            }
            self.claim(handle)?;
            if need > handle.free_space {
                return Ok(0);
            }
        }

        let staged = ChunkHeader::staged(record.len() as u8);
        self.flash
            .program(region.addr(handle.write_offset), staged.as_bytes())?;
        self.flash
            .program(region.addr(handle.write_offset + HEADER_BYTES), record)?;
        low_level::commit_chunk(&mut self.flash, region, handle.write_offset)?;

        handle.free_space -= need;
        handle.write_offset += need;
        if handle.write_offset >= region.len() {
            handle.write_offset = 0;
        }
        if handle.write_offset % region.page_size == 0 {
            let counter =
                low_level::read_byte(&self.flash, region.addr(handle.write_offset))?;
            if counter == ERASED {
                self.claim(handle)?;
            }
            // Otherwise linger on the boundary until the page is reclaimed.
        }
        Ok(record.len())
    }

    /// Claims the erased page under the write head: programs its counter
    /// and steps past it. The counter byte stops being free space until the
    /// page's eventual erase.
    fn claim(&mut self, handle: &mut FileHandle) -> Result<(), F::Error> {
        low_level::claim_page(
            &mut self.flash,
            handle.region,
            handle.write_offset,
            handle.write_count,
        )?;
        handle.write_count = low_level::rank_after(handle.write_count);
        handle.free_space -= COUNTER_BYTES;
        handle.write_offset += COUNTER_BYTES;
        Ok(())
    }

    /// Copies up to `out.len()` payload bytes from the read head, in record
    /// order, concatenating across chunks and pages. Stops at the write
    /// head. Aborted chunks are never exposed. Partial chunks are fine for
    /// the caller; the head simply remembers its offset into the current
    /// chunk.
    pub fn read(&self, handle: &mut FileHandle, out: &mut [u8]) -> Result<usize, F::Error> {
        let region = handle.region;
        // A failed write can stage an aborted chunk on the very slot the
        // head is parked on; land on a committed record before exposing
        // anything.
        handle.raw_read_chunk_start = low_level::resolve_landing(
            &self.flash,
            region,
            handle.raw_read_chunk_start,
            handle.write_offset,
            None,
        )?;
        let mut filled = 0;
        while filled < out.len() {
            // The cursor parks exactly on the write head when it catches
            // it, a stalled writer's boundary included, so plain equality
            // is the caught-up test.
            if handle.raw_read_chunk_start == handle.write_offset {
                break;
            }
            let hdr =
                low_level::read_header(&self.flash, region, handle.raw_read_chunk_start)?;
            let chunk = usize::from(hdr.size);
            let taken = usize::min(
                chunk - handle.raw_read_chunk_offset as usize,
                out.len() - filled,
            );
            let src = handle.raw_read_chunk_start + HEADER_BYTES + handle.raw_read_chunk_offset;
            self.flash
                .read(region.addr(src), &mut out[filled..filled + taken])?;
            filled += taken;
            if handle.raw_read_chunk_offset as usize + taken == chunk {
                handle.raw_read_chunk_start = low_level::advance_cursor(
                    &self.flash,
                    region,
                    handle.raw_read_chunk_start,
                    handle.write_offset,
                    None,
                )?;
                handle.raw_read_chunk_offset = 0;
            } else {
                handle.raw_read_chunk_offset += taken as u32;
            }
        }
        Ok(filled)
    }

    /// Destroys the oldest whole records whose payloads total at most `n`
    /// bytes, returning the bytes actually consumed. Records die whole or
    /// not at all: a record larger than the remainder of `n` stops the
    /// walk, as does catching the raw read head -- only records the reader
    /// has wholly passed may be surrendered. Pages the destructive head
    /// vacates are erased once nothing else needs them.
    pub fn consume(&mut self, handle: &mut FileHandle, n: usize) -> Result<usize, F::Error> {
        let region = handle.region;
        // As with `read`, the head may be parked on a chunk a failed write
        // staged after it got there; only committed records may be stamped.
        let from_page = region.page_index(handle.destructive_read_offset);
        let mut reclaimed = 0;
        handle.destructive_read_offset = low_level::resolve_landing(
            &self.flash,
            region,
            handle.destructive_read_offset,
            handle.raw_read_chunk_start,
            Some(&mut reclaimed),
        )?;
        handle.free_space += reclaimed;
        self.reclaim_vacated(handle, from_page)?;

        let mut consumed = 0;
        while consumed < n {
            if handle.destructive_read_offset == handle.raw_read_chunk_start {
                break;
            }
            let hdr = low_level::read_header(
                &self.flash,
                region,
                handle.destructive_read_offset,
            )?;
            let chunk = usize::from(hdr.size);
            if chunk > n - consumed {
                break;
            }
            low_level::consume_chunk(&mut self.flash, region, handle.destructive_read_offset)?;
            consumed += chunk;

            let from_page = region.page_index(handle.destructive_read_offset);
            let mut reclaimed = 0;
            handle.destructive_read_offset = low_level::advance_cursor(
                &self.flash,
                region,
                handle.destructive_read_offset,
                handle.raw_read_chunk_start,
                Some(&mut reclaimed),
            )?;
            handle.free_space += reclaimed;
            self.reclaim_vacated(handle, from_page)?;
        }
        Ok(consumed)
    }

    /// Erases every page between `from_page` (inclusive) and the
    /// destructive head's current page that the head has vacated and
    /// nothing else still needs.
    fn reclaim_vacated(
        &mut self,
        handle: &mut FileHandle,
        from_page: u32,
    ) -> Result<(), F::Error> {
        let region = handle.region;
        let mut page = from_page;
        while page != region.page_index(handle.destructive_read_offset) {
            let page_start = page * region.page_size;
            if low_level::erase_if_vacated(
                &mut self.flash,
                region,
                page_start,
                handle.write_offset,
                handle.raw_read_chunk_start,
            )? {
                handle.free_space += COUNTER_BYTES;
            }
            page = (page + 1) % region.pages;
        }
        Ok(())
    }

    /// Bytes currently occupied: metadata, live payload, and dead
    /// end-of-page tails.
    pub fn size(&self, handle: &FileHandle) -> usize {
        (handle.region.len() - handle.free_space) as usize
    }
}
