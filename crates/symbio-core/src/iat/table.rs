//! The attribution table proper.
//!
//! A fixed array of [`MAX_SLOTS`] slots, a pgid lookup shared with the
//! switch path, a LIFO free list, and per-CPU switch-in state. Writers
//! (switch path, add/remove) serialize per slot through the slot mutex;
//! generation counters reject deltas that land on a reused slot. Every
//! mutation of a slot republishes its user-visible snapshot through the
//! seqlock in [`super::shm`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use log::debug;

use super::MAX_SLOTS;
use super::shm::{RegionLayout, SharedRegion, SnapshotRecord};
use crate::counters::CounterPair;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IatError {
    #[error("process group {0} is already attributed")]
    Duplicate(i32),
    #[error("attribution table is full")]
    NoCapacity,
    #[error("process group {0} is not attributed")]
    NotFound(i32),
    #[error("process group id must be positive, got {0}")]
    InvalidPgid(i32),
}

#[derive(Default)]
struct SlotInner {
    pgid: i32,
    job_id: i32,
    worker_num: i32,
    cycles: u64,
    instructions: u64,
    reset_requested: bool,
}

impl SlotInner {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

struct Slot {
    /// Strictly increasing across every (re)use. Bumped under the mutex.
    generation: AtomicU64,
    active: AtomicBool,
    inner: Mutex<SlotInner>,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            active: AtomicBool::new(false),
            inner: Mutex::new(SlotInner::default()),
        }
    }
}

/// Lookup entry: slot index plus the generation it was registered under.
#[derive(Debug, Clone, Copy)]
struct SlotRef {
    idx: usize,
    generation: u64,
}

/// Per-CPU switch-in state.
#[derive(Debug, Clone, Copy)]
struct Running {
    slot: usize,
    generation: u64,
    start_cycles: u64,
    start_instructions: u64,
}

struct CpuLane {
    /// Owned by the lane's monitor thread; the mutex is uncontended and
    /// only provides interior mutability.
    state: Mutex<Option<Running>>,
    counters: Box<dyn CounterPair>,
}

/// Per-process-group cycle and instruction attribution.
pub struct AttributionTable {
    slots: Vec<Slot>,
    lookup: RwLock<HashMap<i32, SlotRef>>,
    /// LIFO free list of slot indices.
    free: Mutex<Vec<usize>>,
    lanes: Vec<CpuLane>,
    region: SharedRegion,
}

impl AttributionTable {
    /// Build a table with one counter pair per logical CPU.
    pub fn new(counters: Vec<Box<dyn CounterPair>>) -> io::Result<Self> {
        let region = SharedRegion::create()?;
        let slots = (0..MAX_SLOTS).map(|_| Slot::new()).collect();
        // Reverse order so allocation starts from slot 0.
        let free = (0..MAX_SLOTS).rev().collect();
        let lanes = counters
            .into_iter()
            .map(|c| CpuLane {
                state: Mutex::new(None),
                counters: c,
            })
            .collect();
        Ok(Self {
            slots,
            lookup: RwLock::new(HashMap::new()),
            free: Mutex::new(free),
            lanes,
            region,
        })
    }

    /// Logical CPUs this table attributes for.
    pub fn cpu_count(&self) -> usize {
        self.lanes.len()
    }

    /// The user-visible snapshot region.
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    fn layout(&self) -> &RegionLayout {
        self.region.layout()
    }

    /// Register a process group for attribution.
    pub fn add(&self, pgid: i32, job_id: i32, worker_num: i32) -> Result<(), IatError> {
        if pgid <= 0 {
            return Err(IatError::InvalidPgid(pgid));
        }
        let idx = self.free.lock().unwrap().pop().ok_or(IatError::NoCapacity)?;
        let slot = &self.slots[idx];

        let generation = {
            let mut inner = slot.inner.lock().unwrap();
            let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
            inner.pgid = pgid;
            inner.job_id = job_id;
            inner.worker_num = worker_num;
            inner.cycles = 0;
            inner.instructions = 0;
            inner.reset_requested = false;
            self.layout().publish(idx, pgid, job_id, worker_num, 0, 0);
            generation
        };

        // Insert under a re-check: a racing add of the same pgid wins and we
        // release the slot we provisioned.
        {
            let mut lookup = self.lookup.write().unwrap();
            if lookup.contains_key(&pgid) {
                drop(lookup);
                let mut inner = slot.inner.lock().unwrap();
                slot.generation.fetch_add(1, Ordering::AcqRel);
                inner.clear();
                self.layout().publish(idx, 0, 0, 0, 0, 0);
                drop(inner);
                self.free.lock().unwrap().push(idx);
                return Err(IatError::Duplicate(pgid));
            }
            lookup.insert(pgid, SlotRef { idx, generation });
        }

        slot.active.store(true, Ordering::Release);
        self.layout().set_active(idx, true);
        debug!("iat: attributing pgid {pgid} (job {job_id}) in slot {idx} generation {generation}");
        Ok(())
    }

    /// Deregister a process group.
    pub fn remove(&self, pgid: i32) -> Result<(), IatError> {
        let slot_ref = {
            let lookup = self.lookup.read().unwrap();
            lookup.get(&pgid).copied()
        }
        .ok_or(IatError::NotFound(pgid))?;

        // Hide from user iterators before anything else.
        self.layout().set_active(slot_ref.idx, false);

        // Re-check under the write lock; a racing remove may have won.
        if self.lookup.write().unwrap().remove(&pgid).is_none() {
            return Err(IatError::NotFound(pgid));
        }

        let slot = &self.slots[slot_ref.idx];
        {
            let mut inner = slot.inner.lock().unwrap();
            slot.generation.fetch_add(1, Ordering::AcqRel);
            slot.active.store(false, Ordering::Release);
            inner.clear();
            self.layout().publish(slot_ref.idx, 0, 0, 0, 0, 0);
        }
        self.free.lock().unwrap().push(slot_ref.idx);
        debug!("iat: released pgid {pgid} from slot {}", slot_ref.idx);
        Ok(())
    }

    /// Request a counter reset on every active slot. The next switch-out on
    /// each slot replaces the accumulator with the measured delta, so
    /// subsequent snapshots cover the interval since this call.
    pub fn reset_all(&self) {
        for slot in self.slots.iter().filter(|s| s.active.load(Ordering::Acquire)) {
            slot.inner.lock().unwrap().reset_requested = true;
        }
    }

    /// Context-switch event on `cpu`: the previously running task (tracked
    /// in per-CPU state) is switching out; a task of group `next_pgid`
    /// (0 or negative when unknown/idle) is switching in.
    pub fn on_switch(&self, cpu: usize, next_pgid: i32) {
        let Some(lane) = self.lanes.get(cpu) else {
            return;
        };
        let mut state = lane.state.lock().unwrap();
        let prev = state.take();

        let next = if next_pgid > 0 {
            self.lookup.read().unwrap().get(&next_pgid).copied()
        } else {
            None
        };

        if prev.is_none() && next.is_none() {
            return;
        }

        let sample = match lane.counters.read() {
            Ok(s) => s,
            Err(err) => {
                // Disarm and continue; never corrupt the slot.
                debug!("iat: counter read failed on cpu {cpu}: {err}");
                return;
            }
        };

        if let Some(run) = prev {
            let d_cycles = sample.cycles.wrapping_sub(run.start_cycles);
            let d_instructions = sample.instructions.wrapping_sub(run.start_instructions);
            let slot = &self.slots[run.slot];
            let mut inner = slot.inner.lock().unwrap();
            if slot.generation.load(Ordering::Acquire) == run.generation {
                if inner.reset_requested {
                    inner.cycles = d_cycles;
                    inner.instructions = d_instructions;
                    inner.reset_requested = false;
                } else {
                    inner.cycles = inner.cycles.wrapping_add(d_cycles);
                    inner.instructions = inner.instructions.wrapping_add(d_instructions);
                }
                self.layout().publish(
                    run.slot,
                    inner.pgid,
                    inner.job_id,
                    inner.worker_num,
                    inner.cycles,
                    inner.instructions,
                );
            }
            // Stale generation: the slot was reused since switch-in; discard.
        }

        *state = next.map(|r| Running {
            slot: r.idx,
            generation: r.generation,
            start_cycles: sample.cycles,
            start_instructions: sample.instructions,
        });
    }

    /// Consistent snapshots of all live slots, reader-side protocol.
    pub fn snapshots(&self) -> Vec<SnapshotRecord> {
        self.layout().iter_active().collect()
    }

    /// Whether `pgid` currently holds a slot.
    pub fn contains(&self, pgid: i32) -> bool {
        self.lookup.read().unwrap().contains_key(&pgid)
    }

    /// Number of live slots.
    pub fn active_count(&self) -> usize {
        self.layout().active_count() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{CounterError, CounterSample};
    use std::sync::atomic::AtomicU64 as TestCounter;

    /// Counter pair that advances by a fixed step per read.
    struct SteppingCounters {
        clock: TestCounter,
        cycle_step: u64,
        instr_step: u64,
    }

    impl SteppingCounters {
        fn boxed(cycle_step: u64, instr_step: u64) -> Box<dyn CounterPair> {
            Box::new(Self {
                clock: TestCounter::new(0),
                cycle_step,
                instr_step,
            })
        }
    }

    impl CounterPair for SteppingCounters {
        fn read(&self) -> Result<CounterSample, CounterError> {
            let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(CounterSample {
                cycles: tick * self.cycle_step,
                instructions: tick * self.instr_step,
            })
        }
    }

    /// Counter pair that always fails.
    struct BrokenCounters;

    impl CounterPair for BrokenCounters {
        fn read(&self) -> Result<CounterSample, CounterError> {
            Err(CounterError::ShortRead(0))
        }
    }

    fn table(cpus: usize) -> AttributionTable {
        let counters = (0..cpus).map(|_| SteppingCounters::boxed(100, 150)).collect();
        AttributionTable::new(counters).unwrap()
    }

    #[test]
    fn add_then_snapshot() {
        let t = table(1);
        t.add(1001, 7, 4).unwrap();
        let snaps = t.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].pgid, 1001);
        assert_eq!(snaps[0].job_id, 7);
        assert_eq!(snaps[0].worker_num, 4);
        assert_eq!(snaps[0].cycles, 0);
    }

    #[test]
    fn duplicate_add_rejected_without_leak() {
        let t = table(1);
        t.add(1001, 7, 4).unwrap();
        assert_eq!(t.add(1001, 7, 4), Err(IatError::Duplicate(1001)));
        // Exactly one active slot for the pgid.
        assert_eq!(t.snapshots().len(), 1);
        // The provisional slot went back to the free list: filling the rest
        // of the table must still succeed.
        for pg in 0..(MAX_SLOTS as i32 - 1) {
            t.add(2000 + pg, 1, 1).unwrap();
        }
        assert_eq!(t.add(9_999_999, 1, 1), Err(IatError::NoCapacity));
    }

    #[test]
    fn capacity_exhaustion_then_reuse() {
        let t = table(1);
        for pg in 1..=(MAX_SLOTS as i32) {
            t.add(pg, 1, 1).unwrap();
        }
        assert_eq!(t.add(99_999, 1, 1), Err(IatError::NoCapacity));
        t.remove(17).unwrap();
        t.add(99_999, 1, 1).unwrap();
    }

    #[test]
    fn invalid_pgid_rejected() {
        let t = table(1);
        assert_eq!(t.add(0, 1, 1), Err(IatError::InvalidPgid(0)));
        assert_eq!(t.add(-5, 1, 1), Err(IatError::InvalidPgid(-5)));
    }

    #[test]
    fn remove_unknown_is_not_found() {
        let t = table(1);
        assert_eq!(t.remove(42), Err(IatError::NotFound(42)));
    }

    #[test]
    fn switch_attributes_delta_to_prev_group() {
        let t = table(1);
        t.add(1001, 7, 2).unwrap();
        t.on_switch(0, 1001); // switch in: one counter read
        t.on_switch(0, 0); // switch out: second read, delta = one step
        let snap = &t.snapshots()[0];
        assert_eq!(snap.cycles, 100);
        assert_eq!(snap.instructions, 150);
    }

    #[test]
    fn unmonitored_switches_do_not_read_counters() {
        let t = table(1);
        t.add(1001, 7, 2).unwrap();
        // Neither side monitored: no counter consumption.
        t.on_switch(0, 0);
        t.on_switch(0, 4242);
        // Now a monitored interval; if the unmonitored switches had consumed
        // reads, the delta would be larger than one step.
        t.on_switch(0, 1001);
        t.on_switch(0, 0);
        assert_eq!(t.snapshots()[0].cycles, 100);
    }

    #[test]
    fn accumulators_add_across_intervals() {
        let t = table(1);
        t.add(1001, 7, 2).unwrap();
        for _ in 0..3 {
            t.on_switch(0, 1001);
            t.on_switch(0, 0);
        }
        assert_eq!(t.snapshots()[0].cycles, 300);
        assert_eq!(t.snapshots()[0].instructions, 450);
    }

    #[test]
    fn reset_replaces_instead_of_adding() {
        let t = table(1);
        t.add(1001, 7, 2).unwrap();
        t.on_switch(0, 1001);
        t.on_switch(0, 0);
        assert_eq!(t.snapshots()[0].cycles, 100);

        t.reset_all();
        // Reset flag pending; next completed interval replaces.
        t.on_switch(0, 1001);
        t.on_switch(0, 0);
        assert_eq!(t.snapshots()[0].cycles, 100, "replace, not add");

        // Flag consumed; the interval after that adds again.
        t.on_switch(0, 1001);
        t.on_switch(0, 0);
        assert_eq!(t.snapshots()[0].cycles, 200);
    }

    /// Slot reused between switch-in and switch-out. The
    /// stale delta must be discarded and the new occupant unaffected.
    #[test]
    fn stale_gen_delta_discarded_after_slot_reuse() {
        let t = table(1);
        t.add(1001, 7, 1).unwrap();
        t.on_switch(0, 1001); // switch in under generation g
        t.remove(1001).unwrap(); // generation bump
        t.add(2002, 9, 1).unwrap(); // slot 0 reused, generation bumps again
        t.on_switch(0, 0); // switch out: delta carries a stale generation
        let snaps = t.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].pgid, 2002);
        assert_eq!(snaps[0].cycles, 0, "stale delta must not leak");
    }

    /// Generations strictly increase across add/remove/add, and the
    /// re-added group starts from zeroed accumulators.
    #[test]
    fn readd_starts_from_zero() {
        let t = table(1);
        t.add(1001, 7, 1).unwrap();
        t.on_switch(0, 1001);
        t.on_switch(0, 0);
        assert!(t.snapshots()[0].cycles > 0);

        t.remove(1001).unwrap();
        t.add(1001, 7, 1).unwrap();
        assert_eq!(t.snapshots()[0].cycles, 0);
    }

    #[test]
    fn counter_failure_disarms_without_corruption() {
        let counters: Vec<Box<dyn CounterPair>> =
            vec![SteppingCounters::boxed(100, 150), Box::new(BrokenCounters)];
        let t = AttributionTable::new(counters).unwrap();
        t.add(1001, 7, 1).unwrap();
        t.on_switch(1, 1001); // read fails: lane disarmed
        t.on_switch(1, 0);
        assert_eq!(t.snapshots()[0].cycles, 0);
        // The healthy lane still attributes.
        t.on_switch(0, 1001);
        t.on_switch(0, 0);
        assert_eq!(t.snapshots()[0].cycles, 100);
    }

    #[test]
    fn remove_hides_before_release() {
        let t = table(2);
        t.add(1001, 7, 1).unwrap();
        t.remove(1001).unwrap();
        assert_eq!(t.snapshots().len(), 0);
        assert_eq!(t.active_count(), 0);
        assert!(!t.contains(1001));
    }
}
