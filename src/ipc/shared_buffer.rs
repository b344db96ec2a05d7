//! Fixed-slot shared image arena.
//!
//! Layout of the mapping:
//!
//! ```text
//! [ header: 64 B ][ slot headers: 64 B each ][ pad to page ][ slot 0 ][ slot 1 ] ...
//! ```
//!
//! Slot sizes are rounded up to the page size. Each slot header carries an
//! atomic reference count; a writer claims a slot by moving it from 0 to 1
//! and the reader gives it back with `release`. The mapping is either
//! anonymous (threads of one process) or backed by a file under `/dev/shm`
//! (worker processes open it by path).

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::capture::frame::{pixel_checksum, SlotRef};
use crate::error::BufferError;

const MAGIC: u32 = u32::from_le_bytes(*b"PCSB");
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;
const SLOT_HEADER_SIZE: usize = 64;

#[repr(C)]
#[derive(Clone, Copy)]
struct BufferHeader {
    magic: u32,
    version: u32,
    slot_count: u32,
    _reserved: u32,
    slot_size: u64,
    data_offset: u64,
}

#[repr(C, align(64))]
struct SlotHeader {
    refcount: AtomicU32,
    len: AtomicU64,
    checksum: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<BufferHeader>() <= HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<SlotHeader>() == SLOT_HEADER_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    slot_count: u32,
    slot_size: usize,
    data_offset: usize,
    total: usize,
}

impl Layout {
    fn new(slot_count: u32, min_slot_size: usize) -> Result<Self, BufferError> {
        if slot_count == 0 || min_slot_size == 0 {
            return Err(BufferError::InvalidLayout(format!(
                "{slot_count} slots of {min_slot_size} bytes"
            )));
        }
        let page = page_size::get();
        let slot_size = min_slot_size.div_ceil(page) * page;
        let headers = HEADER_SIZE + slot_count as usize * SLOT_HEADER_SIZE;
        let data_offset = headers.div_ceil(page) * page;
        let total = slot_size
            .checked_mul(slot_count as usize)
            .and_then(|data| data.checked_add(data_offset))
            .ok_or_else(|| BufferError::InvalidLayout("arena size overflows".into()))?;
        Ok(Self {
            slot_count,
            slot_size,
            data_offset,
            total,
        })
    }
}

pub struct SharedImageBuffer {
    map: MmapMut,
    base: *mut u8,
    layout: Layout,
    next_slot: AtomicUsize,
    /// Set when this handle created the backing file
    owned_path: Option<PathBuf>,
    path: Option<PathBuf>,
}

// SAFETY: the mapping is only touched through atomics in the slot headers and
// through slot data whose exclusive ownership is handed over by the refcount.
unsafe impl Send for SharedImageBuffer {}
unsafe impl Sync for SharedImageBuffer {}

impl SharedImageBuffer {
    /// Anonymous mapping, visible to threads of this process only
    pub fn create_anonymous(slot_count: u32, min_slot_size: usize) -> Result<Self, BufferError> {
        let layout = Layout::new(slot_count, min_slot_size)?;
        let map = MmapOptions::new().len(layout.total).map_anon()?;
        let buffer = Self::from_map(map, layout, None, None);
        buffer.write_header();
        Ok(buffer)
    }

    /// File-backed mapping at `path`. The file is removed when this handle drops.
    pub fn create(
        path: impl AsRef<Path>,
        slot_count: u32,
        min_slot_size: usize,
    ) -> Result<Self, BufferError> {
        let path = path.as_ref().to_path_buf();
        let layout = Layout::new(slot_count, min_slot_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(layout.total as u64)?;
        // SAFETY: the file was just created by us and is sized to the layout
        let map = unsafe { MmapMut::map_mut(&file)? };
        let buffer = Self::from_map(map, layout, Some(path.clone()), Some(path.clone()));
        buffer.write_header();
        debug!(
            "Created shared buffer {} ({} slots x {} bytes)",
            path.display(),
            layout.slot_count,
            layout.slot_size
        );
        Ok(buffer)
    }

    /// File-backed mapping under the shared memory dir with a unique name
    pub fn create_in_shm(slot_count: u32, min_slot_size: usize) -> Result<Self, BufferError> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = Path::new("/dev/shm");
        let dir = if dir.is_dir() {
            dir.to_path_buf()
        } else {
            std::env::temp_dir()
        };
        let name = format!(
            "polycam-{}-{}.shm",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self::create(dir.join(name), slot_count, min_slot_size)
    }

    /// Attach to a buffer created by another process
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BufferError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < HEADER_SIZE {
            return Err(BufferError::InvalidLayout(format!(
                "{} is only {file_len} bytes",
                path.display()
            )));
        }
        // SAFETY: the creator keeps the file alive and sized for as long as workers run
        let map = unsafe { MmapMut::map_mut(&file)? };
        let header = read_header(&map);
        if header.magic != MAGIC || header.version != VERSION {
            return Err(BufferError::InvalidLayout(format!(
                "bad header in {}",
                path.display()
            )));
        }
        let layout = Layout::new(header.slot_count, header.slot_size as usize)?;
        if layout.data_offset != header.data_offset as usize || layout.total > file_len {
            return Err(BufferError::InvalidLayout(format!(
                "{} does not match its header",
                path.display()
            )));
        }
        Ok(Self::from_map(map, layout, None, Some(path)))
    }

    fn from_map(
        mut map: MmapMut,
        layout: Layout,
        owned_path: Option<PathBuf>,
        path: Option<PathBuf>,
    ) -> Self {
        let base = map.as_mut_ptr();
        Self {
            map,
            base,
            layout,
            next_slot: AtomicUsize::new(0),
            owned_path,
            path,
        }
    }

    fn write_header(&self) {
        let header = BufferHeader {
            magic: MAGIC,
            version: VERSION,
            slot_count: self.layout.slot_count,
            _reserved: 0,
            slot_size: self.layout.slot_size as u64,
            data_offset: self.layout.data_offset as u64,
        };
        // SAFETY: header region is within the mapping and nobody else has it yet
        unsafe { ptr::write_unaligned(self.base as *mut BufferHeader, header) };
    }

    fn slot_header(&self, index: usize) -> &SlotHeader {
        debug_assert!(index < self.layout.slot_count as usize);
        // SAFETY: in range, 64-byte aligned, zero-initialized atomics
        unsafe { &*(self.base.add(HEADER_SIZE + index * SLOT_HEADER_SIZE) as *const SlotHeader) }
    }

    fn slot_data(&self, index: usize) -> *mut u8 {
        // SAFETY: in range by layout
        unsafe {
            self.base
                .add(self.layout.data_offset + index * self.layout.slot_size)
        }
    }

    fn check_index(&self, index: u32) -> Result<usize, BufferError> {
        if index >= self.layout.slot_count {
            return Err(BufferError::SlotOutOfRange {
                slot: index,
                slots: self.layout.slot_count,
            });
        }
        Ok(index as usize)
    }

    /// Copy `data` into a free slot. Never blocks.
    pub fn put_image(&self, data: &[u8]) -> Result<SlotRef, BufferError> {
        if data.len() > self.layout.slot_size {
            return Err(BufferError::ImageTooLarge {
                len: data.len(),
                slot_size: self.layout.slot_size,
            });
        }
        let count = self.layout.slot_count as usize;
        let start = self.next_slot.load(Ordering::Relaxed);
        for offset in 0..count {
            let index = (start + offset) % count;
            let header = self.slot_header(index);
            if header
                .refcount
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // SAFETY: refcount 1 gives this writer exclusive use of the slot
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.slot_data(index), data.len()) };
            let checksum = pixel_checksum(data);
            header.len.store(data.len() as u64, Ordering::Release);
            header.checksum.store(checksum, Ordering::Release);
            self.next_slot.store(index + 1, Ordering::Relaxed);

            return Ok(SlotRef {
                index: index as u32,
                len: data.len() as u64,
                checksum,
            });
        }
        Err(BufferError::BufferExhausted {
            slots: self.layout.slot_count,
        })
    }

    /// Copy a slot's bytes out and verify them against the writer's checksum.
    /// The slot stays claimed; call `release` afterwards.
    pub fn get_image(&self, slot: &SlotRef) -> Result<Bytes, BufferError> {
        let index = self.check_index(slot.index)?;
        let len = slot.len as usize;
        if len > self.layout.slot_size {
            return Err(BufferError::ImageTooLarge {
                len,
                slot_size: self.layout.slot_size,
            });
        }
        let header = self.slot_header(index);
        if header.refcount.load(Ordering::Acquire) == 0 {
            warn!("Reading released shared slot {index}");
        }

        // SAFETY: len is within the slot; the writer published it before the ref was sent
        let bytes = unsafe { std::slice::from_raw_parts(self.slot_data(index), len) };
        let bytes = Bytes::copy_from_slice(bytes);

        let actual = pixel_checksum(&bytes);
        if actual != slot.checksum {
            return Err(BufferError::CorruptedSharedImage {
                slot: slot.index,
                expected: slot.checksum,
                actual,
            });
        }
        Ok(bytes)
    }

    /// Give a slot back to writers
    pub fn release(&self, index: u32) -> Result<(), BufferError> {
        let index = self.check_index(index)?;
        let released = self.slot_header(index).refcount.fetch_update(
            Ordering::AcqRel,
            Ordering::Relaxed,
            |count| count.checked_sub(1),
        );
        if released.is_err() {
            warn!("Double release of shared slot {index}");
        }
        Ok(())
    }

    /// Number of claimed slots
    pub fn in_use(&self) -> usize {
        (0..self.layout.slot_count as usize)
            .filter(|i| self.slot_header(*i).refcount.load(Ordering::Acquire) > 0)
            .count()
    }

    pub fn slot_count(&self) -> u32 {
        self.layout.slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.layout.slot_size
    }

    /// Backing file, if this buffer can be opened from another process
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self, index: u32) {
        // SAFETY: test only, slot is in range
        unsafe { *self.slot_data(index as usize) ^= 0x5a };
    }
}

fn read_header(map: &MmapMut) -> BufferHeader {
    // SAFETY: caller checked the mapping is at least HEADER_SIZE bytes
    unsafe { ptr::read_unaligned(map.as_ptr() as *const BufferHeader) }
}

impl Drop for SharedImageBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.map.flush_async() {
            debug!("Shared buffer flush failed: {e}");
        }
        if let Some(path) = self.owned_path.take() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove shared buffer {}: {e}", path.display());
            }
        }
    }
}

impl std::fmt::Debug for SharedImageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedImageBuffer")
            .field("slot_count", &self.layout.slot_count)
            .field("slot_size", &self.layout.slot_size)
            .field("path", &self.path)
            .finish()
    }
}
