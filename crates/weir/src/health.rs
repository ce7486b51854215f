//! Readiness is a composition of independent probes, each refreshed by the
//! component that owns it. Liveness never consults any of this.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How recently a probe must have reported to count as healthy.
pub const PROBE_FRESHNESS: Duration = Duration::from_secs(60);
/// WAL durability errors only fail readiness once they persist this long.
pub const WAL_ERROR_GRACE: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct Probes {
    /// Last 2xx from the sink's readiness endpoint (or a successful push).
    sink_ok_at: Mutex<Option<Instant>>,
    /// Last forwarder loop iteration, idle or not.
    forwarder_at: Mutex<Option<Instant>>,
    /// Start of the current streak of WAL durability errors.
    wal_error_since: Mutex<Option<Instant>>,
    recover_ok: Mutex<bool>,
}

#[derive(Debug, serde::Serialize)]
pub struct ProbeStatus {
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, serde::Serialize)]
pub struct ReadyReport {
    pub ready: bool,
    pub probes: BTreeMap<&'static str, ProbeStatus>,
}

impl Probes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_sink_ok(&self) {
        *self.sink_ok_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn note_forwarder_progress(&self) {
        *self.forwarder_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn note_wal_ok(&self) {
        *self.wal_error_since.lock().unwrap() = None;
    }

    pub fn note_wal_error(&self) {
        let mut since = self.wal_error_since.lock().unwrap();
        since.get_or_insert_with(Instant::now);
    }

    pub fn note_recovered(&self, ok: bool) {
        *self.recover_ok.lock().unwrap() = ok;
    }

    /// Whether WAL durability has been failing past the grace period.
    pub fn wal_failing(&self) -> bool {
        self.wal_error_since
            .lock()
            .unwrap()
            .map(|since| since.elapsed() > WAL_ERROR_GRACE)
            .unwrap_or(false)
    }

    pub fn evaluate(&self, disk_free_ratio: f64, disk_free_min_ratio: f64, wal_writable: bool) -> ReadyReport {
        let mut probes = BTreeMap::new();

        let sink_fresh = self
            .sink_ok_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed() <= PROBE_FRESHNESS)
            .unwrap_or(false);
        probes.insert(
            "sink",
            ProbeStatus {
                ok: sink_fresh,
                detail: if sink_fresh {
                    "sink ready within the last 60s".to_string()
                } else {
                    "no successful sink contact within the last 60s".to_string()
                },
            },
        );

        let disk_ok = disk_free_ratio >= disk_free_min_ratio;
        probes.insert(
            "disk",
            ProbeStatus {
                ok: disk_ok,
                detail: format!("free ratio {disk_free_ratio:.3}, minimum {disk_free_min_ratio:.2}"),
            },
        );

        let recovered = *self.recover_ok.lock().unwrap();
        let wal_ok = recovered && wal_writable && !self.wal_failing();
        probes.insert(
            "wal",
            ProbeStatus {
                ok: wal_ok,
                detail: match (recovered, wal_writable, self.wal_failing()) {
                    (false, _, _) => "recovery has not completed".to_string(),
                    (_, false, _) => "WAL root is not writable".to_string(),
                    (_, _, true) => "durability errors persisting beyond 30s".to_string(),
                    _ => "writable, recovered".to_string(),
                },
            },
        );

        let forwarder_fresh = self
            .forwarder_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed() <= PROBE_FRESHNESS)
            .unwrap_or(false);
        probes.insert(
            "forwarder",
            ProbeStatus {
                ok: forwarder_fresh,
                detail: if forwarder_fresh {
                    "loop active within the last 60s".to_string()
                } else {
                    "no loop progress within the last 60s".to_string()
                },
            },
        );

        ReadyReport {
            ready: probes.values().all(|p| p.ok),
            probes,
        }
    }
}
