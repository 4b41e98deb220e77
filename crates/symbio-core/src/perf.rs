//! Minimal raw `perf_event_open` ABI.
//!
//! Only the slice of the ABI this crate uses: the event attribute struct,
//! the handful of type/config/format constants, the syscall wrapper, and
//! the mmap ring-buffer metadata page. Layouts follow
//! `include/uapi/linux/perf_event.h`.

use std::io;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;

pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

pub const PERF_SAMPLE_RAW: u64 = 1 << 10;

pub const PERF_RECORD_SAMPLE: u32 = 9;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

/// `struct perf_event_attr`. Field unions are flattened to the member this
/// crate uses; everything else stays zero.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// union: sample_period / sample_freq
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    /// Bitfield word (disabled, inherit, pinned, ...). Zero means an
    /// enabled, unfiltered counting event, which is what we want.
    pub flags: u64,
    /// union: wakeup_events / wakeup_watermark
    pub wakeup_events: u32,
    pub bp_type: u32,
    /// union: bp_addr / config1
    pub config1: u64,
    /// union: bp_len / config2
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
    pub sig_data: u64,
    pub config3: u64,
}

impl PerfEventAttr {
    pub fn zeroed() -> Self {
        // SAFETY: PerfEventAttr is repr(C) plain-old-data; all-zero is the
        // documented "defaults" encoding for the ABI.
        unsafe { std::mem::zeroed() }
    }
}

/// Thin wrapper over the raw syscall. Returns the event fd.
pub fn perf_event_open(
    attr: &PerfEventAttr,
    pid: libc::pid_t,
    cpu: i32,
    group_fd: i32,
) -> io::Result<i32> {
    // SAFETY: attr points to a fully initialized attr struct with a correct
    // size field; the kernel copies it and does not retain the pointer.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd as i32)
}

/// Leading fields of `struct perf_event_mmap_page`, followed by the ring
/// head/tail words at their fixed offsets.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 928],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
}

/// Header preceding every ring-buffer record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}
