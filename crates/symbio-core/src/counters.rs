//! Per-CPU hardware counter pairs.
//!
//! Attribution needs one (cycles, retired instructions) counter pair per
//! logical CPU, counting every task that runs there. [`PerfCounterPair`]
//! realizes that with two grouped `perf_event_open` events pinned to one
//! CPU and read in a single group read, so both values come from the same
//! instant. The [`CounterPair`] trait is the seam the attribution table
//! sees; tests substitute scripted counters.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::perf::{self, PerfEventAttr};

/// One reading of both counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSample {
    pub cycles: u64,
    pub instructions: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("perf_event_open failed: {0}")]
    Open(std::io::Error),
    #[error("counter read failed: {0}")]
    Read(std::io::Error),
    #[error("short counter read ({0} bytes)")]
    ShortRead(usize),
}

/// A (cycles, instructions) counter pair for one logical CPU.
pub trait CounterPair: Send + Sync {
    /// Read both counters. Failure disarms the caller's per-CPU state; it
    /// must never corrupt slot accumulators.
    fn read(&self) -> Result<CounterSample, CounterError>;
}

/// Hardware counter pair over `perf_event_open`.
///
/// The cycles event leads a group containing the instructions event; both
/// count all tasks on the CPU (pid = -1), which requires `CAP_PERF_MON` or
/// a permissive `perf_event_paranoid`.
pub struct PerfCounterPair {
    group: OwnedFd,
    _instructions: OwnedFd,
}

impl PerfCounterPair {
    /// Open the counter pair on `cpu`.
    pub fn open(cpu: usize) -> Result<Self, CounterError> {
        let mut attr = PerfEventAttr::zeroed();
        attr.type_ = perf::PERF_TYPE_HARDWARE;
        attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
        attr.config = perf::PERF_COUNT_HW_CPU_CYCLES;
        attr.read_format = perf::PERF_FORMAT_GROUP;

        let group = perf::perf_event_open(&attr, -1, cpu as i32, -1).map_err(CounterError::Open)?;
        // SAFETY: perf_event_open returned a fresh fd we now own.
        let group = unsafe { OwnedFd::from_raw_fd(group) };

        attr.config = perf::PERF_COUNT_HW_INSTRUCTIONS;
        let instructions = perf::perf_event_open(&attr, -1, cpu as i32, group.as_raw_fd())
            .map_err(CounterError::Open)?;
        // SAFETY: as above.
        let instructions = unsafe { OwnedFd::from_raw_fd(instructions) };

        Ok(Self {
            group,
            _instructions: instructions,
        })
    }
}

impl CounterPair for PerfCounterPair {
    fn read(&self) -> Result<CounterSample, CounterError> {
        // Group read layout with PERF_FORMAT_GROUP: { u64 nr; u64 values[nr] }.
        let mut buf = [0u64; 3];
        // SAFETY: buf is a valid writable buffer of 24 bytes; read(2) on a
        // perf group fd fills at most nr + values.
        let n = unsafe {
            libc::read(
                self.group.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                std::mem::size_of_val(&buf),
            )
        };
        if n < 0 {
            return Err(CounterError::Read(std::io::Error::last_os_error()));
        }
        let n = n as usize;
        if n < std::mem::size_of_val(&buf) || buf[0] != 2 {
            return Err(CounterError::ShortRead(n));
        }
        Ok(CounterSample {
            cycles: buf[1],
            instructions: buf[2],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Hardware-dependent: requires perf access (CAP_PERF_MON)
    fn perf_pair_opens_and_reads() {
        let pair = PerfCounterPair::open(0).expect("perf_event_open");
        let a = pair.read().unwrap();
        // Burn some cycles so the counters move.
        let mut x = 1u64;
        for i in 1..100_000u64 {
            x = x.wrapping_mul(i) ^ i;
        }
        std::hint::black_box(x);
        let b = pair.read().unwrap();
        assert!(b.cycles >= a.cycles);
        assert!(b.instructions >= a.instructions);
    }
}
