//! Affinity commitment.
//!
//! The winning placement becomes per-process-group CPU masks applied to
//! every thread of every member process and their descendants. Individual
//! syscall failures are logged and tolerated: short-lived threads routinely
//! exit between the /proc scan and the affinity call.

use std::collections::HashMap;
use std::fs;

use log::{debug, warn};
use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;

/// Seam for committing affinity masks; tests record instead of syscalling.
pub trait AffinityCommitter {
    /// Apply `cpus` to every thread of every process in each group.
    fn commit(&mut self, affinities: &HashMap<i32, Vec<usize>>);
}

/// Real committer: /proc scan plus `sched_setaffinity`.
#[derive(Debug, Default)]
pub struct ProcAffinity;

impl AffinityCommitter for ProcAffinity {
    fn commit(&mut self, affinities: &HashMap<i32, Vec<usize>>) {
        let procs = scan_processes();
        for (&pgid, cpus) in affinities {
            let mask = match cpu_set(cpus) {
                Ok(mask) => mask,
                Err(err) => {
                    warn!("affinity: bad cpu set for pgid {pgid}: {err}");
                    continue;
                }
            };
            let members = group_with_descendants(&procs, pgid);
            if members.is_empty() {
                debug!("affinity: no live processes in pgid {pgid}");
                continue;
            }
            for pid in members {
                apply_to_process_threads(pid, &mask);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ProcEntry {
    pid: i32,
    ppid: i32,
    pgrp: i32,
}

/// One pass over /proc: pid, parent, process group of every process.
fn scan_processes() -> Vec<ProcEntry> {
    let mut entries = Vec::new();
    let Ok(dir) = fs::read_dir("/proc") else {
        return entries;
    };
    for dent in dir.flatten() {
        let Some(pid) = dent
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some(entry) = parse_stat(pid, &stat) {
            entries.push(entry);
        }
    }
    entries
}

/// Parse ppid and pgrp out of a /proc/pid/stat line. The comm field may
/// contain spaces and parentheses, so fields are counted from the last ')'.
fn parse_stat(pid: i32, stat: &str) -> Option<ProcEntry> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_ascii_whitespace();
    let _state = fields.next()?;
    let ppid: i32 = fields.next()?.parse().ok()?;
    let pgrp: i32 = fields.next()?.parse().ok()?;
    Some(ProcEntry { pid, ppid, pgrp })
}

/// Members of `pgid` plus every descendant process, whatever its group.
fn group_with_descendants(procs: &[ProcEntry], pgid: i32) -> Vec<i32> {
    let mut members: Vec<i32> = Vec::new();
    let mut in_set = vec![false; procs.len()];
    for (i, p) in procs.iter().enumerate() {
        if p.pgrp == pgid {
            in_set[i] = true;
            members.push(p.pid);
        }
    }
    // Fixed-point over the parent links; /proc scans are small enough that
    // the quadratic worst case does not matter here.
    loop {
        let mut grew = false;
        for (i, p) in procs.iter().enumerate() {
            if !in_set[i] && members.contains(&p.ppid) {
                in_set[i] = true;
                members.push(p.pid);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    members
}

fn cpu_set(cpus: &[usize]) -> nix::Result<CpuSet> {
    let mut mask = CpuSet::new();
    for &cpu in cpus {
        mask.set(cpu)?;
    }
    Ok(mask)
}

/// Apply the mask to every thread of one process.
fn apply_to_process_threads(pid: i32, mask: &CpuSet) {
    let Ok(tasks) = fs::read_dir(format!("/proc/{pid}/task")) else {
        // The process exited since the scan; tolerated.
        return;
    };
    for task in tasks.flatten() {
        let Some(tid) = task
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        if let Err(err) = sched_setaffinity(Pid::from_raw(tid), mask) {
            debug!("affinity: tid {tid} of pid {pid} not updated: {err}");
        }
    }
}

/// Recording committer for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingCommitter {
    pub commits: Vec<HashMap<i32, Vec<usize>>>,
}

impl AffinityCommitter for RecordingCommitter {
    fn commit(&mut self, affinities: &HashMap<i32, Vec<usize>>) {
        self.commits.push(affinities.clone());
    }
}
