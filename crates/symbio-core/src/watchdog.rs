//! Runtime watchdog.
//!
//! Watches admitted process groups, flags the ones that run past the
//! threshold, requests profiling from user space, and — only after the
//! profiling acknowledgement arrives — registers them with the attribution
//! table. Per group the state machine is
//! `NEW → REQUESTED → PROFILED → REGISTERED → DEAD`, carried by three
//! flags (`is_long_running`, `profile_done`, `ipc_registered`) plus the
//! pending-request bit.
//!
//! The tick is two-phase: state is scanned and mutated under one lock while
//! building out-lists (notifications to send, table operations to run,
//! groups to forget); all I/O happens after the lock is released. A failed
//! notification send re-arms the request for the next tick; a capacity
//! refusal from the table keeps the group in PROFILED and retries as slots
//! free up.

use std::collections::HashMap;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::iat::{AttributionTable, IatError};
use crate::notify::{self, Notification};

/// Tick period of the watchdog timer.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WatchdogError {
    #[error("process group {0} is already watched")]
    AlreadyWatched(i32),
    #[error("process group {0} is not watched")]
    NotWatched(i32),
    #[error("threshold must be positive, got {0}")]
    BadThreshold(i32),
    #[error("no process group for pid {0}")]
    NoSuchPid(i32),
}

/// Watchdog tuning.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Runtime after which a group counts as long-running.
    ///
    /// **Default:** 3600 seconds.
    pub threshold: Duration,
    /// Emit a profiling request immediately on admission, before the
    /// threshold elapses.
    ///
    /// **Default:** `true`.
    pub request_on_admit: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(3600),
            request_on_admit: true,
        }
    }
}

struct PgEntry {
    start: Instant,
    job_id: i32,
    worker_num: i32,
    is_long_running: bool,
    need_send_request: bool,
    profile_done: bool,
    ipc_registered: bool,
}

struct Inner {
    pgs: HashMap<i32, PgEntry>,
    threshold: Duration,
    endpoint: Option<SocketAddr>,
}

/// Probe for "does this process group still have live tasks".
pub type LivenessProbe = Box<dyn Fn(i32) -> bool + Send + Sync>;

/// Default probe: signal 0 to the process group.
fn pg_alive(pgid: i32) -> bool {
    // SAFETY: kill with signal 0 performs permission/existence checks only.
    let rc = unsafe { libc::kill(-pgid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub struct Watchdog {
    inner: Mutex<Inner>,
    table: Arc<AttributionTable>,
    /// Bound datagram socket: notifications go out here and acknowledgement
    /// datagrams come back to it.
    sock: UnixDatagram,
    alive: LivenessProbe,
    config_request_on_admit: bool,
}

impl Watchdog {
    pub fn new(table: Arc<AttributionTable>, config: WatchdogConfig) -> std::io::Result<Self> {
        Self::with_liveness_probe(table, config, Box::new(pg_alive))
    }

    /// As [`Watchdog::new`], with an injected liveness probe.
    pub fn with_liveness_probe(
        table: Arc<AttributionTable>,
        config: WatchdogConfig,
        alive: LivenessProbe,
    ) -> std::io::Result<Self> {
        static INSTANCE: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "symbio-watchdog-{}-{}",
            std::process::id(),
            INSTANCE.fetch_add(1, Ordering::Relaxed)
        );
        let addr = SocketAddr::from_abstract_name(name)?;
        let sock = UnixDatagram::bind_addr(&addr)?;
        sock.set_nonblocking(true)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                pgs: HashMap::new(),
                threshold: config.threshold,
                endpoint: None,
            }),
            table,
            sock,
            alive,
            config_request_on_admit: config.request_on_admit,
        })
    }

    // -----------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------

    /// Admit a process group for watching.
    pub fn add_pgid(&self, pgid: i32, job_id: i32, worker_num: i32) -> Result<(), WatchdogError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pgs.contains_key(&pgid) {
            return Err(WatchdogError::AlreadyWatched(pgid));
        }
        inner.pgs.insert(
            pgid,
            PgEntry {
                start: Instant::now(),
                job_id,
                worker_num,
                is_long_running: false,
                need_send_request: self.config_request_on_admit,
                profile_done: false,
                ipc_registered: false,
            },
        );
        info!("watchdog: admitted pgid {pgid} (job {job_id}, {worker_num} workers)");
        Ok(())
    }

    /// Forget a process group, deregistering it from the table if needed.
    pub fn remove_pgid(&self, pgid: i32) -> Result<(), WatchdogError> {
        let registered = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .pgs
                .remove(&pgid)
                .ok_or(WatchdogError::NotWatched(pgid))?;
            entry.ipc_registered
        };
        if registered {
            if let Err(err) = self.table.remove(pgid) {
                warn!("watchdog: table remove of pgid {pgid} failed: {err}");
            }
        }
        info!("watchdog: forgot pgid {pgid}");
        Ok(())
    }

    /// Set the long-running threshold in seconds.
    pub fn set_threshold(&self, seconds: i32) -> Result<(), WatchdogError> {
        if seconds <= 0 {
            return Err(WatchdogError::BadThreshold(seconds));
        }
        self.inner.lock().unwrap().threshold = Duration::from_secs(seconds as u64);
        Ok(())
    }

    /// Point notifications at abstract endpoint `id`.
    pub fn set_notify_endpoint(&self, id: i32) -> std::io::Result<()> {
        let addr = notify::endpoint_addr(id)?;
        self.inner.lock().unwrap().endpoint = Some(addr);
        Ok(())
    }

    /// Force a re-request for the process group of `pid`.
    pub fn request_profile(&self, pid: i32) -> Result<(), WatchdogError> {
        // SAFETY: getpgid performs no memory access.
        let pgid = unsafe { libc::getpgid(pid) };
        if pgid < 0 {
            return Err(WatchdogError::NoSuchPid(pid));
        }
        self.request_profile_for_pgid(pgid)
    }

    /// As [`Watchdog::request_profile`], addressed by pgid.
    pub fn request_profile_for_pgid(&self, pgid: i32) -> Result<(), WatchdogError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .pgs
            .get_mut(&pgid)
            .ok_or(WatchdogError::NotWatched(pgid))?;
        entry.need_send_request = true;
        Ok(())
    }

    /// Profiling acknowledgement for `pgid`.
    pub fn ack(&self, pgid: i32) {
        let mut inner = self.inner.lock().unwrap();
        match inner.pgs.get_mut(&pgid) {
            Some(entry) => {
                entry.profile_done = true;
                // The threshold stays authoritative; an early ACK is only
                // observable, never a shortcut to REGISTERED.
                debug!(
                    "watchdog: profile ack for pgid {pgid} (long_running={})",
                    entry.is_long_running
                );
            }
            None => debug!("watchdog: ack for unknown pgid {pgid}"),
        }
    }

    /// The address acknowledgement datagrams must be sent to.
    pub fn ack_addr(&self) -> SocketAddr {
        self.sock.local_addr().expect("bound abstract socket")
    }

    // -----------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------

    /// One watchdog tick.
    pub fn tick(&self) {
        self.drain_acks();

        // Probe liveness outside the state lock.
        let watched: Vec<i32> = {
            let inner = self.inner.lock().unwrap();
            inner.pgs.keys().copied().collect()
        };
        let dead: Vec<i32> = watched
            .into_iter()
            .filter(|&pgid| !(self.alive)(pgid))
            .collect();

        // Phase one: mutate state, build out-lists.
        let mut notifications: Vec<Notification> = Vec::new();
        let mut registrations: Vec<(i32, i32, i32)> = Vec::new();
        let mut deregistrations: Vec<i32> = Vec::new();
        let endpoint = {
            let mut inner = self.inner.lock().unwrap();
            for pgid in &dead {
                if let Some(entry) = inner.pgs.remove(pgid) {
                    info!("watchdog: pgid {pgid} has no tasks left");
                    if entry.ipc_registered {
                        deregistrations.push(*pgid);
                    }
                }
            }
            let threshold = inner.threshold;
            let endpoint = inner.endpoint.clone();
            for (&pgid, entry) in inner.pgs.iter_mut() {
                let elapsed = entry.start.elapsed();
                if !entry.is_long_running && elapsed >= threshold {
                    entry.is_long_running = true;
                    entry.need_send_request = true;
                    info!(
                        "watchdog: pgid {pgid} is long-running ({}s)",
                        elapsed.as_secs()
                    );
                }
                if entry.need_send_request && endpoint.is_some() {
                    notifications.push(Notification {
                        pgid,
                        elapsed_sec: elapsed.as_secs(),
                        job_id: entry.job_id,
                    });
                    entry.need_send_request = false;
                }
                if entry.is_long_running && entry.profile_done && !entry.ipc_registered {
                    // Optimistic; rolled back if the table refuses.
                    entry.ipc_registered = true;
                    registrations.push((pgid, entry.job_id, entry.worker_num));
                }
            }
            endpoint
        };

        // Phase two: I/O with no lock held. Removals first so freed slots
        // can satisfy this tick's registrations.
        for pgid in deregistrations {
            if let Err(err) = self.table.remove(pgid) {
                warn!("watchdog: table remove of dead pgid {pgid} failed: {err}");
            }
        }

        for (pgid, job_id, worker_num) in registrations {
            match self.table.add(pgid, job_id, worker_num) {
                Ok(()) => info!("watchdog: pgid {pgid} registered for attribution"),
                // An existing slot for the pgid is success for our purposes.
                Err(IatError::Duplicate(_)) => {}
                Err(err) => {
                    warn!("watchdog: registration of pgid {pgid} failed: {err}");
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(entry) = inner.pgs.get_mut(&pgid) {
                        entry.ipc_registered = false;
                    }
                }
            }
        }

        if let Some(endpoint) = endpoint {
            for n in notifications {
                let buf = notify::encode_notification(&n);
                if let Err(err) = self.sock.send_to_addr(&buf, &endpoint) {
                    debug!(
                        "watchdog: notification for pgid {} not sent ({err}); re-arming",
                        n.pgid
                    );
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(entry) = inner.pgs.get_mut(&n.pgid) {
                        entry.need_send_request = true;
                    }
                }
            }
        }
    }

    /// Drain pending acknowledgement datagrams.
    fn drain_acks(&self) {
        let mut buf = [0u8; 16];
        loop {
            match self.sock.recv(&mut buf) {
                Ok(n) => match notify::parse_ack(&buf[..n]) {
                    Some(pgid) => self.ack(pgid),
                    None => debug!("watchdog: malformed ack ({n} bytes)"),
                },
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!("watchdog: ack receive failed: {err}");
                    break;
                }
            }
        }
    }

    /// Run the 1 Hz tick loop until `stop` is raised.
    pub fn run_ticker(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.tick();
            let spent = started.elapsed();
            if let Some(rest) = TICK_PERIOD.checked_sub(spent) {
                std::thread::sleep(rest);
            }
        }
    }

    /// Number of watched process groups.
    pub fn watched_count(&self) -> usize {
        self.inner.lock().unwrap().pgs.len()
    }
}
