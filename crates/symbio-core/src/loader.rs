//! Profile data loader.
//!
//! The user-space bridge between the watchdog's notification stream and the
//! document database: block on the endpoint, fetch the workload's
//! characteristic vector, acknowledge. Transient store failures retry on a
//! bounded exponential backoff; a genuinely absent profile is surfaced so
//! the scheduler can exclude the job from pair selection.

use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::time::Duration;

use log::{debug, warn};

use crate::catalog::ResourceCatalog;
use crate::notify::{self, Notification};
use crate::profile::WorkloadProfile;
use crate::store::{DocumentStore, StoreError};

/// Retry schedule for transient store failures.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First retry delay.
    ///
    /// **Default:** 100 ms.
    pub initial: Duration,
    /// Delay cap.
    ///
    /// **Default:** 5 s.
    pub max: Duration,
    /// Attempts before giving up.
    ///
    /// **Default:** `6`.
    pub attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            attempts: 6,
        }
    }
}

pub struct ProfileLoader<S: DocumentStore> {
    endpoint: UnixDatagram,
    ack_addr: SocketAddr,
    store: S,
    catalog: ResourceCatalog,
    backoff: BackoffConfig,
}

impl<S: DocumentStore> ProfileLoader<S> {
    /// Bind the notification endpoint `endpoint_id` and acknowledge to
    /// `ack_addr` (the watchdog's socket).
    pub fn bind(
        endpoint_id: i32,
        ack_addr: SocketAddr,
        store: S,
        catalog: ResourceCatalog,
        backoff: BackoffConfig,
    ) -> std::io::Result<Self> {
        let endpoint = notify::bind_endpoint(endpoint_id)?;
        Ok(Self {
            endpoint,
            ack_addr,
            store,
            catalog,
            backoff,
        })
    }

    /// Bound wait for the next notification; `None` on timeout.
    pub fn listen_timeout(&self, timeout: Duration) -> std::io::Result<Option<Notification>> {
        self.endpoint.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; 128];
        match self.endpoint.recv(&mut buf) {
            Ok(n) => Ok(notify::parse_notification(&buf[..n])),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Block for the next well-formed notification.
    pub fn listen(&self) -> std::io::Result<Notification> {
        self.endpoint.set_read_timeout(None)?;
        let mut buf = [0u8; 128];
        loop {
            let n = self.endpoint.recv(&mut buf)?;
            match notify::parse_notification(&buf[..n]) {
                Some(notification) => return Ok(notification),
                None => debug!("loader: dropping malformed notification ({n} bytes)"),
            }
        }
    }

    /// Fetch and derive the characteristic vector for `job_id`, retrying
    /// transient failures per the backoff schedule.
    pub fn load_profile(&self, job_id: i32) -> Result<WorkloadProfile, StoreError> {
        let mut delay = self.backoff.initial;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.fetch(job_id) {
                Ok(profile) => return Ok(profile),
                Err(err @ StoreError::NotFound(_)) => return Err(err),
                Err(err) => err,
            };
            if attempt >= self.backoff.attempts {
                return Err(err);
            }
            warn!("loader: store failure for job {job_id} (attempt {attempt}): {err}");
            std::thread::sleep(delay);
            delay = (delay * 2).min(self.backoff.max);
        }
    }

    fn fetch(&self, job_id: i32) -> Result<WorkloadProfile, StoreError> {
        let docs = self.store.measurements_for(job_id)?;
        WorkloadProfile::derive(job_id, &self.catalog, &docs)
    }

    /// Acknowledge a completed profile load for `pgid`.
    pub fn send_ack(&self, pgid: i32) -> std::io::Result<()> {
        self.endpoint
            .send_to_addr(&notify::encode_ack(pgid), &self.ack_addr)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::linux::net::SocketAddrExt;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::store::test_support::doc;
    use crate::store::{FEATURE_L3_CORUN, FEATURE_SINGLE, MeasurementDoc, ModelDoc, RunType};

    fn tiny_catalog() -> ResourceCatalog {
        use crate::catalog::{Resource, ResourceKind};
        ResourceCatalog::new(vec![Resource {
            name: "l1d".to_string(),
            kind: ResourceKind::Parallel,
        }])
    }

    fn good_docs(job: i32) -> Vec<MeasurementDoc> {
        vec![
            doc(job, FEATURE_SINGLE, 0, RunType::Workload, 2.0),
            doc(job, FEATURE_L3_CORUN, 0, RunType::Workload, 1.8),
            doc(job, "l1d", 1, RunType::Workload, 1.9),
            doc(job, "l1d", 8, RunType::Workload, 1.0),
            doc(job, "l1d", 0, RunType::Injector, 1.5),
            doc(job, "l1d", 1, RunType::Injector, 1.2),
            doc(job, "l1d", 8, RunType::Injector, 0.9),
        ]
    }

    /// Store that fails transiently a configurable number of times.
    struct FlakyStore {
        docs: Vec<MeasurementDoc>,
        failures_left: Mutex<u32>,
        calls: AtomicU32,
    }

    impl DocumentStore for FlakyStore {
        fn measurements_for(&self, job_id: i32) -> Result<Vec<MeasurementDoc>, StoreError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Unavailable(std::io::Error::other("flaky")));
            }
            let docs: Vec<_> = self
                .docs
                .iter()
                .filter(|d| d.job_id == job_id)
                .cloned()
                .collect();
            if docs.is_empty() {
                return Err(StoreError::NotFound(job_id));
            }
            Ok(docs)
        }

        fn model_document(&self) -> Result<ModelDoc, StoreError> {
            unimplemented!("not used by the loader")
        }
    }

    fn loader(store: FlakyStore, endpoint_id: i32) -> ProfileLoader<FlakyStore> {
        let ack_addr = SocketAddr::from_abstract_name(format!("symbio-test-ack-{endpoint_id}"))
            .expect("abstract name");
        ProfileLoader::bind(
            endpoint_id,
            ack_addr,
            store,
            tiny_catalog(),
            BackoffConfig {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(4),
                attempts: 4,
            },
        )
        .unwrap()
    }

    #[test]
    fn transient_failures_are_retried() {
        let store = FlakyStore {
            docs: good_docs(7),
            failures_left: Mutex::new(2),
            calls: AtomicU32::new(0),
        };
        let l = loader(store, 941_001);
        let profile = l.load_profile(7).unwrap();
        assert_eq!(profile.job_id, 7);
        assert_eq!(l.store.calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn permanent_absence_is_not_retried() {
        let store = FlakyStore {
            docs: Vec::new(),
            failures_left: Mutex::new(0),
            calls: AtomicU32::new(0),
        };
        let l = loader(store, 941_002);
        assert!(matches!(l.load_profile(7), Err(StoreError::NotFound(7))));
        assert_eq!(l.store.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn bounded_attempts_give_up() {
        let store = FlakyStore {
            docs: good_docs(7),
            failures_left: Mutex::new(100),
            calls: AtomicU32::new(0),
        };
        let l = loader(store, 941_003);
        assert!(matches!(
            l.load_profile(7),
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(l.store.calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn listen_timeout_returns_none_when_quiet() {
        let store = FlakyStore {
            docs: Vec::new(),
            failures_left: Mutex::new(0),
            calls: AtomicU32::new(0),
        };
        let l = loader(store, 941_004);
        let got = l.listen_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(got, None);
    }
}
