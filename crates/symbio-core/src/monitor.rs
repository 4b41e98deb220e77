//! Context-switch event feed.
//!
//! One monitor thread per logical CPU consumes `sched:sched_switch`
//! tracepoint samples from a `perf_event_open` ring buffer and drives the
//! attribution table's switch path. Ring overflow loses switch events; the
//! next observed switch simply closes a wider attribution interval, so the
//! error is bounded and the path never propagates failures.

use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::iat::AttributionTable;
use crate::perf::{self, PerfEventAttr, PerfEventHeader, PerfEventMmapPage};

/// Tracepoint sysfs roots, tried in order.
const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("sched_switch tracepoint unavailable: {0}")]
    Tracepoint(std::io::Error),
    #[error("tracepoint format missing field \"{0}\"")]
    Format(&'static str),
    #[error("perf_event_open failed on cpu {cpu}: {err}")]
    Open { cpu: usize, err: std::io::Error },
    #[error("ring buffer mmap failed on cpu {cpu}: {err}")]
    Mmap { cpu: usize, err: std::io::Error },
}

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Ring buffer data pages per CPU (power of two).
    ///
    /// **Default:** `8`.
    pub ring_pages: usize,
    /// Poll timeout; bounds shutdown latency.
    ///
    /// **Default:** 200 ms.
    pub poll_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ring_pages: 8,
            poll_timeout: Duration::from_millis(200),
        }
    }
}

/// Byte offset of `next_pid` inside the tracepoint's raw record.
#[derive(Debug, Clone, Copy)]
struct SwitchFormat {
    next_pid_offset: usize,
}

/// Resolve the sched_switch tracepoint id and raw-record layout.
fn resolve_tracepoint() -> Result<(u64, SwitchFormat), MonitorError> {
    let mut last_err = std::io::Error::from(std::io::ErrorKind::NotFound);
    for root in TRACEFS_ROOTS {
        let id_path = format!("{root}/events/sched/sched_switch/id");
        let format_path = format!("{root}/events/sched/sched_switch/format");
        match (
            fs::read_to_string(&id_path),
            fs::read_to_string(&format_path),
        ) {
            (Ok(id), Ok(format)) => {
                let id: u64 = id
                    .trim()
                    .parse()
                    .map_err(|_| MonitorError::Format("id"))?;
                let next_pid_offset =
                    field_offset(&format, "next_pid").ok_or(MonitorError::Format("next_pid"))?;
                return Ok((id, SwitchFormat { next_pid_offset }));
            }
            (Err(err), _) | (_, Err(err)) => last_err = err,
        }
    }
    Err(MonitorError::Tracepoint(last_err))
}

/// Pull `offset:` out of a tracefs format description for one field.
fn field_offset(format: &str, field: &str) -> Option<usize> {
    for line in format.lines() {
        if !line.contains("field:") || !line.contains(&format!(" {field};")) {
            continue;
        }
        let offset = line.split("offset:").nth(1)?;
        let offset = offset.split(';').next()?.trim();
        return offset.parse().ok();
    }
    None
}

/// pid → pgid resolution with a periodically flushed cache.
struct PgidCache {
    map: HashMap<i32, i32>,
    last_flush: Instant,
}

/// Cache flush interval; bounds staleness after setpgid and pid reuse.
const PGID_CACHE_FLUSH: Duration = Duration::from_secs(10);
const PGID_CACHE_CAP: usize = 8192;

impl PgidCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            last_flush: Instant::now(),
        }
    }

    fn resolve(&mut self, pid: i32) -> i32 {
        if pid <= 0 {
            return 0; // idle task
        }
        if self.last_flush.elapsed() > PGID_CACHE_FLUSH || self.map.len() > PGID_CACHE_CAP {
            self.map.clear();
            self.last_flush = Instant::now();
        }
        *self.map.entry(pid).or_insert_with(|| {
            // SAFETY: getpgid performs no memory access.
            let pgid = unsafe { libc::getpgid(pid) };
            if pgid < 0 { 0 } else { pgid }
        })
    }
}

/// One CPU's mapped ring buffer.
struct Ring {
    base: *mut u8,
    len: usize,
    page_size: usize,
    data_size: usize,
    tail: u64,
    scratch: Vec<u8>,
}

// SAFETY: the mapping is private to the owning monitor thread; the shared
// head/tail words are only touched through atomics.
unsafe impl Send for Ring {}

impl Ring {
    fn new(fd: &OwnedFd, pages: usize, cpu: usize) -> Result<Self, MonitorError> {
        // SAFETY: sysconf is always safe.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = (1 + pages) * page_size;
        // SAFETY: mapping the perf fd; the kernel validates the length.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MonitorError::Mmap {
                cpu,
                err: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            base: base.cast(),
            len,
            page_size,
            data_size: pages * page_size,
            tail: 0,
            scratch: vec![0u8; 64 * 1024],
        })
    }

    /// Copy `len` ring bytes starting at absolute position `pos` into
    /// `scratch[..len]`, handling wrap-around.
    fn copy_out(&mut self, pos: u64, len: usize) {
        let data_size = self.data_size;
        let start = (pos % data_size as u64) as usize;
        // SAFETY: data area spans [page_size, page_size + data_size); both
        // segment copies below stay inside it and scratch is large enough
        // (record sizes are u16).
        unsafe {
            let data = self.base.add(self.page_size);
            let first = len.min(data_size - start);
            std::ptr::copy_nonoverlapping(data.add(start), self.scratch.as_mut_ptr(), first);
            if first < len {
                std::ptr::copy_nonoverlapping(
                    data,
                    self.scratch.as_mut_ptr().add(first),
                    len - first,
                );
            }
        }
    }

    /// Drain available records, feeding `(record_type, body)` to `consume`.
    fn drain(&mut self, mut consume: impl FnMut(u32, &[u8])) {
        // SAFETY: data_head/data_tail are the kernel's shared ring words;
        // atomic views of mapped memory that outlives the call.
        let (head_word, tail_word) = unsafe {
            let meta = self.base as *mut PerfEventMmapPage;
            (
                AtomicU64::from_ptr(&raw mut (*meta).data_head),
                AtomicU64::from_ptr(&raw mut (*meta).data_tail),
            )
        };
        let head = head_word.load(Ordering::Acquire);
        while self.tail < head {
            self.copy_out(self.tail, std::mem::size_of::<PerfEventHeader>());
            // SAFETY: scratch holds a full header just copied from the ring.
            let header: PerfEventHeader =
                unsafe { std::ptr::read_unaligned(self.scratch.as_ptr().cast()) };
            let size = header.size as usize;
            if size < std::mem::size_of::<PerfEventHeader>() {
                // Corrupt ring; resync to the head.
                warn!("monitor: corrupt record header, resyncing ring");
                self.tail = head;
                break;
            }
            self.copy_out(self.tail, size);
            let body = &self.scratch[std::mem::size_of::<PerfEventHeader>()..size];
            consume(header.type_, body);
            self.tail += size as u64;
        }
        tail_word.store(self.tail, Ordering::Release);
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        // SAFETY: unmapping the mapping created in `new`.
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

/// `next_pid` from a PERF_RECORD_SAMPLE body carrying only PERF_SAMPLE_RAW:
/// `{ u32 raw_size; u8 raw[raw_size] }`.
fn next_pid_of_sample(body: &[u8], format: SwitchFormat) -> Option<i32> {
    let raw_size = u32::from_le_bytes(body.get(..4)?.try_into().ok()?) as usize;
    let raw = body.get(4..4 + raw_size)?;
    let bytes = raw.get(format.next_pid_offset..format.next_pid_offset + 4)?;
    Some(i32::from_le_bytes(bytes.try_into().ok()?))
}

/// Per-CPU switch monitors driving an attribution table.
pub struct SwitchMonitor {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl SwitchMonitor {
    /// Open the tracepoint on every CPU of `table` and start the monitor
    /// threads.
    pub fn spawn(table: Arc<AttributionTable>, config: MonitorConfig) -> Result<Self, MonitorError> {
        let (tracepoint_id, format) = resolve_tracepoint()?;
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        for cpu in 0..table.cpu_count() {
            let mut attr = PerfEventAttr::zeroed();
            attr.type_ = perf::PERF_TYPE_TRACEPOINT;
            attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
            attr.config = tracepoint_id;
            attr.sample_period = 1;
            attr.sample_type = perf::PERF_SAMPLE_RAW;
            attr.wakeup_events = 1;

            let fd = perf::perf_event_open(&attr, -1, cpu as i32, -1)
                .map_err(|err| MonitorError::Open { cpu, err })?;
            // SAFETY: fresh fd from perf_event_open.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            let ring = Ring::new(&fd, config.ring_pages, cpu)?;

            let table = table.clone();
            let stop = stop.clone();
            let poll_timeout = config.poll_timeout;
            threads.push(std::thread::spawn(move || {
                run_cpu_monitor(cpu, fd, ring, format, table, stop, poll_timeout);
            }));
        }

        info!(
            "monitor: sched_switch feed running on {} cpus",
            threads.len()
        );
        Ok(Self { stop, threads })
    }

    /// Stop all monitor threads and join them.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for t in self.threads {
            let _ = t.join();
        }
    }
}

fn run_cpu_monitor(
    cpu: usize,
    fd: OwnedFd,
    mut ring: Ring,
    format: SwitchFormat,
    table: Arc<AttributionTable>,
    stop: Arc<AtomicBool>,
    poll_timeout: Duration,
) {
    let mut pgids = PgidCache::new();
    while !stop.load(Ordering::Relaxed) {
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, poll_timeout.as_millis() as i32) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                debug!("monitor: poll failed on cpu {cpu}: {err}");
            }
            continue;
        }
        ring.drain(|record_type, body| {
            if record_type != perf::PERF_RECORD_SAMPLE {
                return; // throttle/lost records are expected noise
            }
            if let Some(next_pid) = next_pid_of_sample(body, format) {
                let next_pgid = pgids.resolve(next_pid);
                table.on_switch(cpu, next_pgid);
            }
        });
    }
}
