//! symbiod — the interference-aware SMT pair scheduling daemon.
//!
//! Wires the core pieces into the single-threaded cooperative event loop:
//! the attribution table fed by per-CPU switch monitors, the 1 Hz watchdog
//! ticker, the control socket, and the profile-load → acknowledge →
//! score → schedule cycle.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};

use symbio_core::counters::{CounterError, CounterPair, CounterSample, PerfCounterPair};
use symbio_core::loader::{BackoffConfig, ProfileLoader};
use symbio_core::monitor::{MonitorConfig, SwitchMonitor};
use symbio_core::sched::{MeasuredStp, PairScheduler, ProcAffinity, SchedulerConfig};
use symbio_core::store::{DirStore, DocumentStore, StoreError};
use symbio_core::watchdog::{Watchdog, WatchdogConfig};
use symbio_core::{
    AttributionTable, ResourceCatalog, ScoreEngine, SlowdownModel, Topology, control,
};

#[derive(Debug, Parser)]
#[command(
    name = "symbiod",
    version,
    about = "Pair co-resident workloads onto SMT siblings by measured compatibility"
)]
struct Opts {
    /// Document store directory (measurement.jsonl, model.json).
    #[arg(long, default_value = "/var/lib/symbio")]
    store_dir: PathBuf,

    /// Resource catalog document; built-in default when omitted.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Control socket path.
    #[arg(long, default_value = "/run/symbio/control.sock")]
    control_socket: PathBuf,

    /// Numeric id of the notification endpoint.
    #[arg(long, default_value = "1")]
    endpoint_id: i32,

    /// Long-running threshold in seconds.
    #[arg(long, default_value = "3600")]
    threshold_secs: u32,

    /// Settling time per empirical candidate, in seconds.
    #[arg(long, default_value = "20")]
    settle_secs: u64,

    /// Candidate assignments (and random baselines) per cycle.
    #[arg(long, default_value = "3")]
    candidates: usize,

    /// Keep running without attribution when perf is unavailable; no
    /// affinity is ever committed in this mode.
    #[arg(long)]
    allow_degraded: bool,
}

/// Counter stand-in for degraded mode: every read fails, so the switch
/// path disarms itself and no deltas are ever attributed.
struct DisabledCounters;

impl CounterPair for DisabledCounters {
    fn read(&self) -> Result<CounterSample, CounterError> {
        Err(CounterError::Read(std::io::Error::from(
            std::io::ErrorKind::Unsupported,
        )))
    }
}

fn open_counters(cpus: usize, allow_degraded: bool) -> anyhow::Result<(Vec<Box<dyn CounterPair>>, bool)> {
    let mut counters: Vec<Box<dyn CounterPair>> = Vec::with_capacity(cpus);
    for cpu in 0..cpus {
        match PerfCounterPair::open(cpu) {
            Ok(pair) => counters.push(Box::new(pair)),
            Err(err) if allow_degraded => {
                warn!("perf counters unavailable on cpu {cpu} ({err}); running degraded");
                return Ok(((0..cpus).map(|_| Box::new(DisabledCounters) as _).collect(), false));
            }
            Err(err) => {
                return Err(err).context(format!("opening hardware counters on cpu {cpu}"));
            }
        }
    }
    Ok((counters, true))
}

fn load_catalog(path: Option<&Path>) -> anyhow::Result<ResourceCatalog> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading catalog {}", path.display()))?;
            serde_json::from_str(&text).context("parsing catalog document")
        }
        None => Ok(ResourceCatalog::default_catalog()),
    }
}

fn bind_control_socket(path: &Path) -> anyhow::Result<UnixDatagram> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let sock = UnixDatagram::bind(path)
        .with_context(|| format!("binding control socket {}", path.display()))?;
    sock.set_read_timeout(Some(Duration::from_millis(500)))?;
    Ok(sock)
}

fn run_control_loop(
    sock: UnixDatagram,
    watchdog: Arc<Watchdog>,
    table: Arc<AttributionTable>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; control::FRAME_LEN];
    while !stop.load(Ordering::Relaxed) {
        let n = match sock.recv(&mut buf) {
            Ok(n) => n,
            Err(ref err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                warn!("control: receive failed: {err}");
                continue;
            }
        };
        let Some(cmd) = control::parse(&buf[..n]) else {
            warn!("control: dropping malformed {n}-byte frame");
            continue;
        };
        debug!("control: {cmd:?}");
        let outcome = match cmd {
            control::Command::AddPgid {
                pgid,
                job_id,
                worker_num,
            } => watchdog.add_pgid(pgid, job_id, worker_num).err(),
            control::Command::RemovePgid(pgid) => watchdog.remove_pgid(pgid).err(),
            control::Command::SetThreshold(secs) => watchdog.set_threshold(secs).err(),
            control::Command::SetNotifyEndpoint(id) => {
                if let Err(err) = watchdog.set_notify_endpoint(id) {
                    warn!("control: endpoint {id} rejected: {err}");
                }
                None
            }
            control::Command::RequestProfile(pid) => watchdog.request_profile(pid).err(),
            control::Command::ResetCounters => {
                table.reset_all();
                None
            }
        };
        if let Some(err) = outcome {
            warn!("control: {err}");
        }
    }
}

/// Poll until the watchdog's registration of `pgid` lands in the table.
fn wait_registered(table: &AttributionTable, pgid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if table.contains(pgid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    table.contains(pgid)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let topology = Topology::discover().context("discovering SMT topology")?;
    info!(
        "topology: {} physical cores, {} logical cpus",
        topology.core_count(),
        topology.logical_count()
    );

    let catalog = load_catalog(opts.catalog.as_deref())?;
    let store = DirStore::new(&opts.store_dir);
    let model_doc = store
        .model_document()
        .context("loading trained model document")?;
    let model =
        SlowdownModel::from_doc(&model_doc, &catalog).context("validating trained model")?;
    let mut engine = ScoreEngine::new(catalog.clone(), model);

    let (counters, attribution_enabled) =
        open_counters(topology.logical_count(), opts.allow_degraded)?;
    let table = Arc::new(AttributionTable::new(counters).context("creating attribution table")?);

    let monitor = if attribution_enabled {
        match SwitchMonitor::spawn(table.clone(), MonitorConfig::default()) {
            Ok(monitor) => Some(monitor),
            Err(err) if opts.allow_degraded => {
                warn!("switch monitor unavailable ({err}); running degraded");
                None
            }
            Err(err) => return Err(err).context("starting switch monitors"),
        }
    } else {
        None
    };
    let attribution_enabled = attribution_enabled && monitor.is_some();

    let watchdog = Arc::new(
        Watchdog::new(
            table.clone(),
            WatchdogConfig {
                threshold: Duration::from_secs(opts.threshold_secs as u64),
                ..WatchdogConfig::default()
            },
        )
        .context("creating watchdog")?,
    );
    watchdog
        .set_notify_endpoint(opts.endpoint_id)
        .context("setting notification endpoint")?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    let ticker = {
        let watchdog = watchdog.clone();
        let stop = stop.clone();
        std::thread::spawn(move || watchdog.run_ticker(&stop))
    };

    let control_sock = bind_control_socket(&opts.control_socket)?;
    let control_thread = {
        let watchdog = watchdog.clone();
        let table = table.clone();
        let stop = stop.clone();
        std::thread::spawn(move || run_control_loop(control_sock, watchdog, table, stop))
    };

    let loader = ProfileLoader::bind(
        opts.endpoint_id,
        watchdog.ack_addr(),
        DirStore::new(&opts.store_dir),
        catalog,
        BackoffConfig::default(),
    )
    .context("binding notification endpoint")?;

    let mut scheduler = PairScheduler::new(
        topology,
        SchedulerConfig {
            settle: Duration::from_secs(opts.settle_secs),
            candidates: opts.candidates,
            shuffle_seed: None,
        },
        ProcAffinity,
        MeasuredStp::new(table.clone(), engine.single_ipc_map()),
    );

    info!("symbiod {} ready", symbio_core::VERSION);
    while !stop.load(Ordering::Relaxed) {
        let notification = match loader.listen_timeout(Duration::from_secs(1)) {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(err) => {
                warn!("loader: endpoint receive failed: {err}");
                continue;
            }
        };
        info!(
            "loader: pgid {} (job {}) reported long-running after {}s",
            notification.pgid, notification.job_id, notification.elapsed_sec
        );

        if engine.profile(notification.job_id).is_none() {
            match loader.load_profile(notification.job_id) {
                Ok(profile) => engine.add_workload(profile),
                Err(StoreError::NotFound(job)) => {
                    // No ack: the group never registers and the OS keeps
                    // scheduling it wherever it likes.
                    warn!("loader: no profile for job {job}; leaving pgid {} unpaired", notification.pgid);
                    continue;
                }
                Err(err) => {
                    // Re-arm the request so the next tick tries again.
                    warn!("loader: store unavailable ({err}); re-requesting");
                    if let Err(err) = watchdog.request_profile_for_pgid(notification.pgid) {
                        debug!("loader: re-request failed: {err}");
                    }
                    continue;
                }
            }
        }

        if let Err(err) = loader.send_ack(notification.pgid) {
            warn!("loader: ack for pgid {} failed: {err}", notification.pgid);
            continue;
        }

        if !attribution_enabled {
            debug!("degraded mode: skipping assignment cycle");
            continue;
        }
        if !wait_registered(&table, notification.pgid, Duration::from_secs(5)) {
            // Table full or the group died; the watchdog keeps retrying.
            warn!(
                "pgid {} not registered after ack; deferring assignment",
                notification.pgid
            );
            continue;
        }

        scheduler.probe_mut().set_baselines(engine.single_ipc_map());
        match scheduler.run_cycle(&table.snapshots(), engine.scores()) {
            Some(placement) => info!(
                "committed assignment over {} pairs (selection score {:.3})",
                placement.pairs().len(),
                placement.selection_score()
            ),
            None => debug!("no assignment committed"),
        }
        debug!("scoreboard:\n{}", engine.scoreboard());
    }

    info!("shutting down");
    if let Some(monitor) = monitor {
        monitor.shutdown();
    }
    let _ = ticker.join();
    let _ = control_thread.join();
    let _ = std::fs::remove_file(&opts.control_socket);
    Ok(())
}
