//! Control command surface.
//!
//! The watchdog's admission and tuning operations arrive as fixed-size
//! 16-byte datagrams on a control socket: a `u32` opcode followed by three
//! little-endian `i32` arguments (unused arguments are zero).

pub const FRAME_LEN: usize = 16;

const OP_ADD_PGID: u32 = 1;
const OP_REMOVE_PGID: u32 = 2;
const OP_SET_THRESHOLD: u32 = 3;
const OP_SET_NOTIFY_ENDPOINT: u32 = 4;
const OP_REQUEST_PROFILE: u32 = 5;
const OP_RESET_COUNTERS: u32 = 6;

/// A decoded control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    AddPgid {
        pgid: i32,
        job_id: i32,
        worker_num: i32,
    },
    RemovePgid(i32),
    SetThreshold(i32),
    SetNotifyEndpoint(i32),
    RequestProfile(i32),
    /// Reset all attribution accumulators (no payload).
    ResetCounters,
}

/// Encode a command frame.
pub fn encode(cmd: &Command) -> [u8; FRAME_LEN] {
    let (op, a, b, c) = match *cmd {
        Command::AddPgid {
            pgid,
            job_id,
            worker_num,
        } => (OP_ADD_PGID, pgid, job_id, worker_num),
        Command::RemovePgid(pgid) => (OP_REMOVE_PGID, pgid, 0, 0),
        Command::SetThreshold(secs) => (OP_SET_THRESHOLD, secs, 0, 0),
        Command::SetNotifyEndpoint(id) => (OP_SET_NOTIFY_ENDPOINT, id, 0, 0),
        Command::RequestProfile(pid) => (OP_REQUEST_PROFILE, pid, 0, 0),
        Command::ResetCounters => (OP_RESET_COUNTERS, 0, 0, 0),
    };
    let mut buf = [0u8; FRAME_LEN];
    buf[0..4].copy_from_slice(&op.to_le_bytes());
    buf[4..8].copy_from_slice(&a.to_le_bytes());
    buf[8..12].copy_from_slice(&b.to_le_bytes());
    buf[12..16].copy_from_slice(&c.to_le_bytes());
    buf
}

/// Decode a command frame. Short frames and unknown opcodes are `None`.
pub fn parse(buf: &[u8]) -> Option<Command> {
    if buf.len() != FRAME_LEN {
        return None;
    }
    let word = |i: usize| i32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
    let op = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let (a, b, c) = (word(1), word(2), word(3));
    match op {
        OP_ADD_PGID => Some(Command::AddPgid {
            pgid: a,
            job_id: b,
            worker_num: c,
        }),
        OP_REMOVE_PGID => Some(Command::RemovePgid(a)),
        OP_SET_THRESHOLD => Some(Command::SetThreshold(a)),
        OP_SET_NOTIFY_ENDPOINT => Some(Command::SetNotifyEndpoint(a)),
        OP_REQUEST_PROFILE => Some(Command::RequestProfile(a)),
        OP_RESET_COUNTERS => Some(Command::ResetCounters),
        _ => None,
    }
}
