//! Shared snapshot region.
//!
//! The user-visible mirror of the attribution table: a page-aligned
//! `memfd`-backed mapping holding an active-slot count, an active-mask
//! bitmap, and one 16-byte-aligned snapshot slot per table slot. A single
//! writer per slot publishes under a seqlock (odd sequence while writing,
//! even when stable, barriers straddling the data); readers retry and never
//! take a lock. Any process that maps the fd read-only can iterate live
//! slots.
//!
//! All payload fields are atomics accessed with relaxed ordering inside the
//! sequence window; the sequence transitions carry the ordering.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering, fence};

use super::MAX_SLOTS;

/// Words in the active-mask bitmap.
pub const MASK_WORDS: usize = MAX_SLOTS / 64;

/// Retries before a seqlock read reports an unstable slot. Only reachable
/// if the writer dies mid-publish.
const SEQLOCK_MAX_RETRIES: usize = 1024;

/// One user-visible snapshot slot.
#[repr(C, align(16))]
pub struct SnapshotSlot {
    seq: AtomicU32,
    pgid: AtomicI32,
    job_id: AtomicI32,
    worker_num: AtomicI32,
    cycles: AtomicU64,
    instructions: AtomicU64,
}

/// A consistent snapshot of one live slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub slot: usize,
    pub pgid: i32,
    pub job_id: i32,
    pub worker_num: i32,
    pub cycles: u64,
    pub instructions: u64,
}

impl SnapshotRecord {
    /// Observed instructions per cycle, if any cycles were attributed.
    pub fn ipc(&self) -> Option<f64> {
        if self.cycles == 0 {
            return None;
        }
        Some(self.instructions as f64 / self.cycles as f64)
    }
}

impl SnapshotSlot {
    /// Publish new contents. Caller is the slot's single writer (holds the
    /// kernel-side slot mutex).
    fn publish(&self, pgid: i32, job_id: i32, worker_num: i32, cycles: u64, instructions: u64) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.pgid.store(pgid, Ordering::Relaxed);
        self.job_id.store(job_id, Ordering::Relaxed);
        self.worker_num.store(worker_num, Ordering::Relaxed);
        self.cycles.store(cycles, Ordering::Relaxed);
        self.instructions.store(instructions, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Seqlock read. Returns `None` only if the slot never stabilizes.
    fn read(&self, slot: usize) -> Option<SnapshotRecord> {
        for _ in 0..SEQLOCK_MAX_RETRIES {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let record = SnapshotRecord {
                slot,
                pgid: self.pgid.load(Ordering::Relaxed),
                job_id: self.job_id.load(Ordering::Relaxed),
                worker_num: self.worker_num.load(Ordering::Relaxed),
                cycles: self.cycles.load(Ordering::Relaxed),
                instructions: self.instructions.load(Ordering::Relaxed),
            };
            fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Relaxed);
            if before == after {
                return Some(record);
            }
        }
        None
    }
}

/// In-memory layout of the shared region.
#[repr(C)]
pub struct RegionLayout {
    count: AtomicU32,
    _pad: u32,
    active_mask: [AtomicU64; MASK_WORDS],
    slots: [SnapshotSlot; MAX_SLOTS],
}

impl RegionLayout {
    /// Number of slots currently reporting a live process group.
    pub fn active_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Flip slot `idx` in the active mask, keeping the count in step.
    pub(super) fn set_active(&self, idx: usize, active: bool) {
        let word = &self.active_mask[idx / 64];
        let bit = 1u64 << (idx % 64);
        if active {
            let prev = word.fetch_or(bit, Ordering::AcqRel);
            if prev & bit == 0 {
                self.count.fetch_add(1, Ordering::AcqRel);
            }
        } else {
            let prev = word.fetch_and(!bit, Ordering::AcqRel);
            if prev & bit != 0 {
                self.count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    pub fn is_active(&self, idx: usize) -> bool {
        let word = self.active_mask[idx / 64].load(Ordering::Acquire);
        word & (1u64 << (idx % 64)) != 0
    }

    pub(super) fn publish(
        &self,
        idx: usize,
        pgid: i32,
        job_id: i32,
        worker_num: i32,
        cycles: u64,
        instructions: u64,
    ) {
        self.slots[idx].publish(pgid, job_id, worker_num, cycles, instructions);
    }

    /// Seqlock-read one slot regardless of the active mask.
    pub fn read_slot(&self, idx: usize) -> Option<SnapshotRecord> {
        self.slots[idx].read(idx)
    }

    /// Iterate consistent snapshots of all slots marked live in the mask.
    ///
    /// A slot removed mid-iteration may still yield a final in-flight
    /// snapshot; subsequent iterations see the mask bit cleared.
    pub fn iter_active(&self) -> impl Iterator<Item = SnapshotRecord> + '_ {
        (0..MASK_WORDS).flat_map(move |w| {
            let mut word = self.active_mask[w].load(Ordering::Acquire);
            std::iter::from_fn(move || {
                while word != 0 {
                    let bit = word.trailing_zeros() as usize;
                    word &= word - 1;
                    if let Some(rec) = self.read_slot(w * 64 + bit) {
                        return Some(rec);
                    }
                }
                None
            })
        })
    }
}

/// Owner of the memfd-backed shared mapping.
pub struct SharedRegion {
    ptr: *mut RegionLayout,
    len: usize,
    fd: OwnedFd,
}

// SAFETY: the mapping is shared memory designed for cross-thread access;
// all interior access goes through atomics in RegionLayout.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create and map a zeroed region. Zero is the valid initial state:
    /// every sequence even, the mask empty, the count zero.
    pub fn create() -> io::Result<Self> {
        let len = page_align(std::mem::size_of::<RegionLayout>());
        // SAFETY: memfd_create with a static name; the fd is owned below.
        let fd = unsafe { libc::memfd_create(c"symbio-iat".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fresh fd from memfd_create.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: sizing a fresh memfd we own.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: mapping `len` bytes of the fd we just sized; MAP_SHARED so
        // external read-only mappings observe our writes.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
            fd,
        })
    }

    pub fn layout(&self) -> &RegionLayout {
        // SAFETY: ptr is a live MAP_SHARED mapping of at least
        // size_of::<RegionLayout>() zero-initialized bytes, valid for the
        // lifetime of self; RegionLayout is all-atomic so shared access is
        // sound.
        unsafe { &*self.ptr }
    }

    /// The backing fd, for handing to external snapshot readers.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Mapped size in bytes.
    pub fn byte_len(&self) -> usize {
        self.len
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact mapping created in `create`.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// Read-only mapping of an exported region fd, for external tools.
pub struct SnapshotReader {
    ptr: *const RegionLayout,
    len: usize,
}

// SAFETY: read-only view of the all-atomic region.
unsafe impl Send for SnapshotReader {}
unsafe impl Sync for SnapshotReader {}

impl SnapshotReader {
    /// Map a region fd (from [`SharedRegion::fd`], possibly of another
    /// process) read-only.
    pub fn map(fd: BorrowedFd<'_>) -> io::Result<Self> {
        let len = page_align(std::mem::size_of::<RegionLayout>());
        // SAFETY: read-only shared mapping of a region the exporter sized
        // to at least `len`.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    pub fn layout(&self) -> &RegionLayout {
        // SAFETY: live read-only mapping of a valid region; all access is
        // through atomics.
        unsafe { &*self.ptr }
    }
}

impl Drop for SnapshotReader {
    fn drop(&mut self) {
        // SAFETY: unmapping the mapping created in `map`.
        unsafe {
            libc::munmap(self.ptr.cast_mut().cast(), self.len);
        }
    }
}

fn page_align(len: usize) -> usize {
    // SAFETY: sysconf is always safe to call.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    len.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn snapshot_slot_layout() {
        assert_eq!(std::mem::size_of::<SnapshotSlot>(), 32);
        assert_eq!(std::mem::align_of::<SnapshotSlot>(), 16);
    }

    #[test]
    fn region_create_and_zero_state() {
        let region = SharedRegion::create().unwrap();
        let layout = region.layout();
        assert_eq!(layout.active_count(), 0);
        assert_eq!(layout.iter_active().count(), 0);
        assert_eq!(region.byte_len() % 4096, 0);
    }

    #[test]
    fn publish_then_read() {
        let region = SharedRegion::create().unwrap();
        let layout = region.layout();
        layout.publish(7, 1001, 3, 4, 100, 250);
        layout.set_active(7, true);
        let rec = layout.read_slot(7).unwrap();
        assert_eq!(rec.pgid, 1001);
        assert_eq!(rec.cycles, 100);
        assert_eq!(rec.instructions, 250);
        assert_eq!(layout.active_count(), 1);
        assert_eq!(layout.iter_active().count(), 1);
    }

    #[test]
    fn mask_set_is_idempotent() {
        let region = SharedRegion::create().unwrap();
        let layout = region.layout();
        layout.set_active(3, true);
        layout.set_active(3, true);
        assert_eq!(layout.active_count(), 1);
        layout.set_active(3, false);
        layout.set_active(3, false);
        assert_eq!(layout.active_count(), 0);
    }

    #[test]
    fn ipc_of_zero_cycles_is_none() {
        let rec = SnapshotRecord {
            slot: 0,
            pgid: 1,
            job_id: 1,
            worker_num: 1,
            cycles: 0,
            instructions: 5,
        };
        assert!(rec.ipc().is_none());
    }

    #[test]
    fn external_reader_sees_published_slots() {
        let region = SharedRegion::create().unwrap();
        region.layout().publish(12, 1001, 7, 4, 42, 84);
        region.layout().set_active(12, true);

        let reader = SnapshotReader::map(region.fd()).unwrap();
        let recs: Vec<SnapshotRecord> = reader.layout().iter_active().collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].pgid, 1001);
        assert_eq!(recs[0].cycles, 42);

        // Writes made after mapping are visible through the shared pages.
        region.layout().publish(12, 1001, 7, 4, 43, 86);
        assert_eq!(reader.layout().read_slot(12).unwrap().cycles, 43);
    }

    /// Concurrent readers never observe a torn snapshot. The writer
    /// always publishes (pgid, cycles, instructions) = (n, n, 2n); a reader
    /// seeing any other combination caught a tear.
    #[test]
    fn seqlock_readers_never_tear() {
        let region = Arc::new(SharedRegion::create().unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..3 {
            let region = region.clone();
            let stop = stop.clone();
            readers.push(std::thread::spawn(move || {
                let mut observed = 0u64;
                // Keep reading until the writer is done and at least one
                // stable observation was made (the slot is quiescent then).
                while !stop.load(Ordering::Relaxed) || observed == 0 {
                    if let Some(rec) = region.layout().read_slot(0) {
                        assert_eq!(rec.cycles, rec.pgid as u64, "torn pgid/cycles");
                        assert_eq!(rec.instructions, rec.cycles * 2, "torn accumulators");
                        observed += 1;
                    }
                }
                observed
            }));
        }

        for n in 1..50_000i32 {
            region.layout().publish(0, n, 1, 1, n as u64, 2 * n as u64);
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            assert!(r.join().unwrap() > 0, "reader made no stable observations");
        }
    }
}
