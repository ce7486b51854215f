//! Background forwarder: drains sealed segments round-robin across tenants,
//! assembles Loki pushes under the per-push caps, and deletes segments only
//! once the sink has acknowledged every record they contributed.

use crate::config::Handle;
use crate::health::Probes;
use crate::loki::{self, PushBuilder, PushError};
use crate::wal::{segment, SegmentHandle, Tenant, WalManager, HEADER_LEN};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-tenant forwarder state, published for the admin status endpoint.
pub type StatusBoard = Arc<Mutex<BTreeMap<String, String>>>;

pub fn new_status_board() -> StatusBoard {
    Arc::new(Mutex::new(BTreeMap::new()))
}

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    Idle,
    Draining,
    Backoff { until: Instant },
    Parked { until: Instant },
}

impl FlowState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::Backoff { .. } => "backoff",
            Self::Parked { .. } => "parked",
        }
    }

    fn wait_until(&self) -> Option<Instant> {
        match self {
            Self::Backoff { until } | Self::Parked { until } => Some(*until),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    seq: u64,
    offset: u64,
}

struct TenantFlow {
    state: FlowState,
    /// Position of the next unpushed record; advances only on sink success.
    cursor: Option<Cursor>,
    attempts: u32,
}

impl Default for TenantFlow {
    fn default() -> Self {
        Self {
            state: FlowState::Idle,
            cursor: None,
            attempts: 0,
        }
    }
}

enum Outcome {
    /// A push was acknowledged; `cursor` points into a partially-drained
    /// segment, if any.
    Pushed { cursor: Option<Cursor> },
    /// No sealed data left to push.
    Drained,
    /// The push was poisoned and its segments dropped.
    Poisoned,
    Transient { retry_after: Option<Duration> },
}

pub struct Forwarder {
    wal: Arc<WalManager>,
    client: loki::Client,
    config: Handle,
    health: Arc<Probes>,
    status: StatusBoard,
    flows: HashMap<String, TenantFlow>,
}

impl Forwarder {
    pub fn new(
        wal: Arc<WalManager>,
        client: loki::Client,
        config: Handle,
        health: Arc<Probes>,
        status: StatusBoard,
    ) -> Self {
        Self {
            wal,
            client,
            config,
            health,
            status,
            flows: HashMap::new(),
        }
    }

    /// Serve until cancelled. Cancellation is only observed between pushes,
    /// so an in-flight push runs to completion or its request timeout.
    pub async fn run(mut self, cancel: tokio_util::sync::CancellationToken) {
        tracing::info!("forwarder started");
        loop {
            let mut wake_at: Option<Instant> = None;

            for tenant in self.wal.tenants() {
                if cancel.is_cancelled() {
                    tracing::info!("forwarder stopping");
                    return;
                }
                let flow = self.flows.entry(tenant.id.clone()).or_default();
                let now = Instant::now();
                if let Some(until) = flow.state.wait_until() {
                    if until > now {
                        wake_at = Some(wake_at.map_or(until, |w| w.min(until)));
                        continue;
                    }
                }
                if tenant.sealed().is_empty() {
                    flow.state = FlowState::Idle;
                    flow.cursor = None;
                    continue;
                }

                let cursor = flow.cursor;
                let outcome = self.service_tenant(&tenant, cursor).await;

                let flow = self.flows.get_mut(&tenant.id).expect("flow exists");
                let snapshot = self.config.snapshot();
                match outcome {
                    Outcome::Pushed { cursor } => {
                        flow.cursor = cursor;
                        flow.state = FlowState::Draining;
                        flow.attempts = 0;
                    }
                    Outcome::Drained => {
                        flow.cursor = None;
                        flow.state = FlowState::Idle;
                        flow.attempts = 0;
                    }
                    Outcome::Poisoned => {
                        flow.cursor = None;
                        flow.state = FlowState::Draining;
                        flow.attempts = 0;
                    }
                    Outcome::Transient { retry_after } => {
                        let loki = &snapshot.config.loki;
                        if flow.attempts >= loki.max_retries {
                            // Schedule exhausted: park, then start over.
                            flow.state = FlowState::Parked {
                                until: Instant::now()
                                    + Duration::from_secs(loki.park_seconds),
                            };
                            flow.attempts = 0;
                        } else {
                            let delay = retry_after.unwrap_or_else(|| {
                                backoff_delay(&loki.backoff_seconds, flow.attempts)
                            });
                            flow.state = FlowState::Backoff {
                                until: Instant::now() + delay,
                            };
                            flow.attempts += 1;
                        }
                    }
                }
                if let Some(until) = flow.state.wait_until() {
                    wake_at = Some(wake_at.map_or(until, |w| w.min(until)));
                }
            }

            self.health.note_forwarder_progress();
            self.publish_status();

            let sleep_for = wake_at
                .map(|at| at.saturating_duration_since(Instant::now()).min(TICK))
                .unwrap_or(TICK);
            tokio::select! {
                _ = self.wal.seal_notify.notified() => (),
                _ = tokio::time::sleep(sleep_for) => (),
                _ = cancel.cancelled() => {
                    tracing::info!("forwarder stopping");
                    return;
                }
            }
        }
    }

    fn publish_status(&self) {
        let mut status = self.status.lock().unwrap();
        for (tenant, flow) in &self.flows {
            status.insert(tenant.clone(), flow.state.name().to_string());
        }
    }

    /// Build and send at most one push for this tenant, coalescing sealed
    /// segments up to the per-push caps.
    async fn service_tenant(&self, tenant: &Arc<Tenant>, cursor: Option<Cursor>) -> Outcome {
        let snapshot = self.config.snapshot();
        let label = tenant.label();
        let mut builder = PushBuilder::new(&snapshot.config.loki);

        let sealed = tenant.sealed();
        let mut consumed: Vec<SegmentHandle> = Vec::new();
        let mut partial: Option<(SegmentHandle, Cursor)> = None;

        'segments: for handle in &sealed {
            let mut reader = match self.wal.open_reader(handle).await {
                Ok(reader) => reader,
                Err(segment::OpenError::Io(err))
                    if err.kind() == std::io::ErrorKind::NotFound =>
                {
                    // Evicted by quota enforcement while queued; let delete
                    // settle the bookkeeping.
                    let _ = self.wal.delete(handle).await;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(?err, path = %handle.path.display(), "dropping unreadable segment");
                    metrics::counter!("wal_segments_corrupt_total", "token" => label.clone())
                        .increment(1);
                    let _ = self.wal.delete(handle).await;
                    continue;
                }
            };
            if let Some(cursor) = cursor {
                if cursor.seq == handle.seq && cursor.offset > HEADER_LEN {
                    if let Err(err) = reader.seek(cursor.offset).await {
                        tracing::warn!(?err, seq = handle.seq, "cursor seek failed; re-reading segment");
                    }
                }
            }

            loop {
                let at = reader.offset();
                match reader.next().await {
                    Some((record, _)) => {
                        if !builder.push(&record) {
                            partial = Some((
                                handle.clone(),
                                Cursor {
                                    seq: handle.seq,
                                    offset: at,
                                },
                            ));
                            break 'segments;
                        }
                    }
                    None => break,
                }
            }
            if reader.saw_corruption() {
                // Whole records before the corruption forward normally; the
                // remainder is unreadable and goes down with the segment.
                tracing::warn!(seq = handle.seq, tenant = %tenant.id, "segment has a corrupt frame");
                metrics::counter!("wal_segments_corrupt_total", "token" => label.clone())
                    .increment(1);
            }
            consumed.push(handle.clone());
        }

        if builder.is_empty() {
            for handle in &consumed {
                let _ = self.wal.delete(handle).await;
            }
            return Outcome::Drained;
        }

        let values = builder.values();
        let request = builder.build();
        let started = Instant::now();
        match self.client.push(&request).await {
            Ok(()) => {
                self.health.note_sink_ok();
                metrics::histogram!("forwarder_push_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                for handle in &consumed {
                    let _ = self.wal.delete(handle).await;
                    metrics::counter!("wal_segments_forwarded_total", "token" => label.clone())
                        .increment(1);
                }
                tracing::debug!(
                    tenant = %tenant.id,
                    values,
                    segments = consumed.len(),
                    "push acknowledged"
                );
                Outcome::Pushed {
                    cursor: partial.map(|(_, cursor)| cursor),
                }
            }
            Err(PushError::Poison { status }) => {
                // The sink permanently refuses this payload. Nothing in the
                // contributing segments can be retried.
                let poisoned: Vec<_> = consumed
                    .iter()
                    .chain(partial.as_ref().map(|(handle, _)| handle))
                    .cloned()
                    .collect();
                tracing::error!(
                    tenant = %tenant.id,
                    %status,
                    segments = poisoned.len(),
                    "sink rejected push as poison; dropping segments"
                );
                for handle in &poisoned {
                    metrics::counter!("forwarder_poison_total", "token" => label.clone())
                        .increment(1);
                    let _ = self.wal.delete(handle).await;
                }
                Outcome::Poisoned
            }
            Err(PushError::Transient {
                status,
                retry_after,
            }) => {
                tracing::warn!(tenant = %tenant.id, ?status, "transient push failure");
                Outcome::Transient { retry_after }
            }
        }
    }
}

/// Full jitter over the configured schedule: a uniform draw from zero up to
/// the scheduled delay.
fn backoff_delay(schedule: &[u64], attempts: u32) -> Duration {
    let base = schedule[(attempts as usize).min(schedule.len() - 1)];
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=1.0) * base as f64)
}
