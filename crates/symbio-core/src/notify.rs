//! Notification and acknowledgement wire formats.
//!
//! The watchdog tells user space about long-running process groups with an
//! ASCII datagram `"<pgid>,<elapsed_sec>,<job_id>\0"`; user space answers
//! with a single little-endian `i32` carrying the pgid. Endpoints are
//! abstract-namespace Unix datagram sockets so the numeric endpoint id from
//! the control surface maps to a concrete address.

use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};

/// A long-running-workload notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub pgid: i32,
    pub elapsed_sec: u64,
    pub job_id: i32,
}

/// Encode a notification datagram.
pub fn encode_notification(n: &Notification) -> Vec<u8> {
    let mut buf = format!("{},{},{}", n.pgid, n.elapsed_sec, n.job_id).into_bytes();
    buf.push(0);
    buf
}

/// Parse a notification datagram. Tolerates a missing trailing NUL.
pub fn parse_notification(buf: &[u8]) -> Option<Notification> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let text = std::str::from_utf8(&buf[..end]).ok()?;
    let mut parts = text.split(',');
    let pgid = parts.next()?.parse().ok()?;
    let elapsed_sec = parts.next()?.parse().ok()?;
    let job_id = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Notification {
        pgid,
        elapsed_sec,
        job_id,
    })
}

/// Encode an acknowledgement datagram.
pub fn encode_ack(pgid: i32) -> [u8; 4] {
    pgid.to_le_bytes()
}

/// Parse an acknowledgement datagram.
pub fn parse_ack(buf: &[u8]) -> Option<i32> {
    Some(i32::from_le_bytes(buf.get(..4)?.try_into().ok()?))
}

/// Abstract address for a numeric notification endpoint id.
pub fn endpoint_addr(id: i32) -> io::Result<SocketAddr> {
    SocketAddr::from_abstract_name(format!("symbio-notify-{id}"))
}

/// Bind a datagram socket to the abstract endpoint `id`.
pub fn bind_endpoint(id: i32) -> io::Result<UnixDatagram> {
    UnixDatagram::bind_addr(&endpoint_addr(id)?)
}
