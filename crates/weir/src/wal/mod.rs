//! Per-tenant write-ahead log. Each tenant owns a directory of append-only
//! segment files; writes are serialized by a per-tenant mutex held across
//! fsync, while the forwarder reads and deletes sealed segments concurrently.

use crate::config::{Handle, TokenSpec, WalConfig};
use crate::validate::NormalizedRecord;
use crate::Error;
use anyhow::Context;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

pub mod segment;
pub use segment::{SegmentReader, HEADER_LEN};

/// Acknowledgement returned to the admission path once records are durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Ack {
    pub segment_seq: u64,
    pub first_offset: u64,
    pub count: usize,
}

/// A sealed segment eligible for forwarding.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SegmentHandle {
    pub tenant: String,
    pub seq: u64,
    pub path: PathBuf,
    pub bytes: u64,
    pub created_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QuotaState {
    pub bytes: u64,
    pub age_seconds: u64,
    pub ratio: f64,
}

#[derive(Debug, serde::Serialize)]
pub struct TenantStatus {
    pub tenant: String,
    pub name: Option<String>,
    pub bytes_on_disk: u64,
    pub sealed_segments: usize,
    pub active_segment: Option<u64>,
    pub oldest_segment_age_seconds: Option<u64>,
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub tenants: usize,
    pub segments: usize,
    pub purged: usize,
    pub corrupt: usize,
}

pub struct WalManager {
    root: PathBuf,
    config: Handle,
    tenants: Mutex<HashMap<String, Arc<Tenant>>>,
    /// Signaled whenever a segment is sealed, waking the forwarder.
    pub seal_notify: tokio::sync::Notify,
    recovered: AtomicBool,
}

pub struct Tenant {
    /// Directory name: 16 hex digits of the token hash. Never the token.
    pub id: String,
    pub token_hash: u64,
    dir: PathBuf,
    /// Token name for metric labels, learned on first authenticated append.
    name: OnceLock<String>,
    writer: tokio::sync::Mutex<Writer>,
    sealed: Mutex<VecDeque<SegmentHandle>>,
    bytes_on_disk: AtomicU64,
}

#[derive(Default)]
struct Writer {
    active: Option<ActiveSegment>,
    next_seq: u64,
    /// Why the next segment will be created; set by the seal that vacated
    /// the active slot.
    create_reason: &'static str,
}

struct ActiveSegment {
    file: tokio::fs::File,
    path: PathBuf,
    seq: u64,
    /// File length including the header; advanced only after fsync.
    bytes: u64,
    created_unix_ms: u64,
    created: Instant,
    last_write: Instant,
}

pub fn token_safe_name(token: &str) -> String {
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(token.as_bytes()))
}

fn segment_file_name(seq: u64) -> String {
    format!("segment_{seq:010}.wal")
}

fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("segment_")?
        .strip_suffix(".wal")?
        .parse()
        .ok()
}

fn now_unix_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

impl Tenant {
    /// Metric label: the token name when known, the directory name before
    /// the first authenticated append.
    pub(crate) fn label(&self) -> String {
        self.name.get().cloned().unwrap_or_else(|| self.id.clone())
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.bytes_on_disk.load(Ordering::Relaxed)
    }

    pub fn sealed(&self) -> Vec<SegmentHandle> {
        self.sealed.lock().unwrap().iter().cloned().collect()
    }

    fn oldest_created_ms(&self) -> Option<u64> {
        self.sealed.lock().unwrap().front().map(|h| h.created_unix_ms)
    }
}

impl WalManager {
    /// The WAL root is fixed at startup; other WAL tuning is re-read from
    /// the live config snapshot on every append.
    pub fn new(config: Handle) -> Self {
        let root = config.snapshot().config.wal.root_path.clone();
        Self {
            root,
            config,
            tenants: Mutex::new(HashMap::new()),
            seal_notify: tokio::sync::Notify::new(),
            recovered: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn recovered(&self) -> bool {
        self.recovered.load(Ordering::Relaxed)
    }

    fn tenant(&self, token: &str) -> Arc<Tenant> {
        let id = token_safe_name(token);
        self.tenant_by_id(&id)
    }

    fn tenant_by_id(&self, id: &str) -> Arc<Tenant> {
        let mut tenants = self.tenants.lock().unwrap();
        tenants
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Tenant {
                    id: id.to_string(),
                    token_hash: u64::from_str_radix(id, 16).unwrap_or(0),
                    dir: self.root.join(id),
                    name: OnceLock::new(),
                    writer: tokio::sync::Mutex::new(Writer::default()),
                    sealed: Mutex::new(VecDeque::new()),
                    bytes_on_disk: AtomicU64::new(0),
                })
            })
            .clone()
    }

    pub fn tenants(&self) -> Vec<Arc<Tenant>> {
        let mut tenants: Vec<_> = self.tenants.lock().unwrap().values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        tenants
    }

    /// Fraction of the WAL filesystem still free, in [0, 1].
    pub fn disk_free_ratio(&self) -> f64 {
        match nix::sys::statvfs::statvfs(&self.root) {
            Ok(stat) if stat.blocks() > 0 => {
                stat.blocks_available() as f64 / stat.blocks() as f64
            }
            Ok(_) => 1.0,
            Err(err) => {
                tracing::warn!(?err, root = %self.root.display(), "statvfs failed");
                1.0
            }
        }
    }

    /// Durably append a batch for one tenant. Holds the tenant writer mutex
    /// across the fsync: the 202 must not race durability.
    pub async fn append(
        &self,
        token: &str,
        spec: &TokenSpec,
        records: &[NormalizedRecord],
    ) -> Result<Ack, Error> {
        let started = Instant::now();
        let wal_cfg = self.config.snapshot().config.wal.clone();
        let tenant = self.tenant(token);
        let _ = tenant.name.set(spec.name.clone());
        let label = spec.name.clone();

        let mut frames = Vec::new();
        for record in records {
            let payload = serde_json::to_vec(record)
                .context("encoding record")
                .map_err(Error::Internal)?;
            segment::append_frame(&mut frames, &payload);
        }
        let write_size = frames.len() as u64;

        let mut writer = tenant.writer.lock().await;

        let ratio = self.disk_free_ratio();
        metrics::gauge!("disk_free_ratio").set(ratio);
        if ratio < wal_cfg.disk_free_min_ratio {
            return Err(Error::QuotaHard);
        }

        self.enforce_quota(&tenant, spec, &label).await;

        let bytes_now = tenant.bytes_on_disk();
        if (bytes_now + write_size) as f64 > 0.8 * spec.wal_quota_bytes as f64 {
            metrics::counter!("wal_backpressure_total", "token" => label.clone()).increment(1);
            return Err(Error::QuotaSoft);
        }

        // A write that would cross the segment cap rotates first (the cap is
        // strict), then the post-append rules below handle everything else.
        let crosses_cap = writer
            .active
            .as_ref()
            .map(|active| active.bytes + write_size > wal_cfg.segment_max_bytes)
            .unwrap_or(false);
        if crosses_cap {
            self.seal_locked(&tenant, &mut writer, "size", &label).await?;
        }
        if writer.active.is_none() {
            self.open_active(&tenant, &mut writer, &label).await?;
        }

        let active = writer.active.as_mut().expect("active segment was just ensured");
        let idle_for = active.last_write.elapsed();
        let first_offset = active.bytes;

        // Position at the durable tail. A previous append cancelled mid-write
        // may have left bytes past it; they are overwritten, never replayed.
        active
            .file
            .seek(std::io::SeekFrom::Start(active.bytes))
            .await
            .context("seeking to segment tail")
            .map_err(Error::Internal)?;
        active
            .file
            .write_all(&frames)
            .await
            .context("writing segment frames")
            .map_err(Error::Internal)?;
        active
            .file
            .sync_all()
            .await
            .context("fsync of segment")
            .map_err(Error::Internal)?;

        // Durable: only now advance the tail and expose the bytes.
        active.bytes += write_size;
        active.last_write = Instant::now();
        tenant.bytes_on_disk.fetch_add(write_size, Ordering::Relaxed);

        let ack = Ack {
            segment_seq: active.seq,
            first_offset,
            count: records.len(),
        };

        metrics::gauge!("wal_disk_usage_bytes", "token" => label.clone())
            .set(tenant.bytes_on_disk() as f64);
        metrics::histogram!("wal_append_duration_seconds").record(started.elapsed().as_secs_f64());

        let (size, age) = (active.bytes, active.created.elapsed());
        if let Some(reason) = should_rotate(size, age, idle_for, &wal_cfg) {
            self.seal_locked(&tenant, &mut writer, reason, &label).await?;
        }

        Ok(ack)
    }

    /// Force rotation of a tenant's active segment. With `force`, even a
    /// record-free segment is sealed.
    pub async fn seal(&self, token: &str, force: bool) -> Result<Option<SegmentHandle>, Error> {
        let tenant = self.tenant(token);
        self.seal_tenant(&tenant, force).await
    }

    async fn seal_tenant(
        &self,
        tenant: &Arc<Tenant>,
        force: bool,
    ) -> Result<Option<SegmentHandle>, Error> {
        let mut writer = tenant.writer.lock().await;
        let has_records = writer
            .active
            .as_ref()
            .map(|a| a.bytes > HEADER_LEN)
            .unwrap_or(false);
        if !has_records && !force {
            return Ok(None);
        }
        if writer.active.is_none() {
            return Ok(None);
        }
        self.seal_locked(tenant, &mut writer, "flush", &tenant.label())
            .await
    }

    /// Admin flush: seal matching active segments and return their handles.
    pub async fn flush(
        &self,
        token: Option<&str>,
        force: bool,
    ) -> Result<Vec<SegmentHandle>, Error> {
        let tenants = match token {
            Some(token) => vec![self.tenant(token)],
            None => self.tenants(),
        };
        let mut flushed = Vec::new();
        for tenant in tenants {
            if let Some(handle) = self.seal_tenant(&tenant, force).await? {
                flushed.push(handle);
            }
        }
        Ok(flushed)
    }

    pub fn list_sealed(&self, tenant: &Tenant) -> Vec<SegmentHandle> {
        tenant.sealed()
    }

    pub async fn open_reader(&self, handle: &SegmentHandle) -> Result<SegmentReader, segment::OpenError> {
        let expect = u64::from_str_radix(&handle.tenant, 16).ok();
        SegmentReader::open(&handle.path, expect).await
    }

    /// Remove a sealed segment. Idempotent: a segment already evicted or
    /// deleted is not an error.
    pub async fn delete(&self, handle: &SegmentHandle) -> std::io::Result<()> {
        if let Some(tenant) = self.tenants.lock().unwrap().get(&handle.tenant).cloned() {
            let mut sealed = tenant.sealed.lock().unwrap();
            if let Some(at) = sealed.iter().position(|h| h.seq == handle.seq) {
                sealed.remove(at);
                tenant.bytes_on_disk.fetch_sub(handle.bytes, Ordering::Relaxed);
            }
        }
        match tokio::fs::remove_file(&handle.path).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn quota_state(&self, token: &str, spec: &TokenSpec) -> QuotaState {
        let tenant = self.tenant(token);
        let bytes = tenant.bytes_on_disk();
        let age_seconds = tenant
            .oldest_created_ms()
            .map(|ms| now_unix_ms().saturating_sub(ms) / 1000)
            .unwrap_or(0);
        QuotaState {
            bytes,
            age_seconds,
            ratio: bytes as f64 / spec.wal_quota_bytes.max(1) as f64,
        }
    }

    pub async fn status(&self) -> Vec<TenantStatus> {
        let mut statuses = Vec::new();
        for tenant in self.tenants() {
            let writer = tenant.writer.lock().await;
            statuses.push(TenantStatus {
                tenant: tenant.id.clone(),
                name: tenant.name.get().cloned(),
                bytes_on_disk: tenant.bytes_on_disk(),
                sealed_segments: tenant.sealed.lock().unwrap().len(),
                active_segment: writer.active.as_ref().map(|a| a.seq),
                oldest_segment_age_seconds: tenant
                    .oldest_created_ms()
                    .map(|ms| now_unix_ms().saturating_sub(ms) / 1000),
            });
        }
        statuses
    }

    /// Startup scan of the WAL root. Every surviving segment is treated as
    /// sealed: writing never resumes into a pre-restart segment. Zero-length
    /// and malformed-header segments are purged.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating WAL root {}", self.root.display()))?;

        let mut report = RecoveryReport::default();
        let mut dirs = tokio::fs::read_dir(&self.root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let id = dir.file_name().to_string_lossy().to_string();
            let Ok(token_hash) = u64::from_str_radix(&id, 16) else {
                tracing::warn!(dir = %id, "skipping non-tenant directory in WAL root");
                continue;
            };

            let mut handles = Vec::new();
            let mut files = tokio::fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().to_string();
                let Some(seq) = parse_segment_file_name(&name) else {
                    continue;
                };
                let path = file.path();
                let len = file.metadata().await?.len();
                if len < HEADER_LEN {
                    tracing::warn!(path = %path.display(), len, "purging truncated segment");
                    tokio::fs::remove_file(&path).await.ok();
                    report.purged += 1;
                    continue;
                }
                let header = {
                    let buf = read_prefix(&path, HEADER_LEN as usize).await?;
                    segment::decode_header(&buf)
                };
                let header = match header {
                    Ok(header) if header.token_hash == token_hash => header,
                    bad => {
                        tracing::warn!(path = %path.display(), ?bad, "purging malformed segment header");
                        metrics::counter!("wal_segments_corrupt_total", "token" => id.clone())
                            .increment(1);
                        tokio::fs::remove_file(&path).await.ok();
                        report.purged += 1;
                        report.corrupt += 1;
                        continue;
                    }
                };
                handles.push(SegmentHandle {
                    tenant: id.clone(),
                    seq,
                    path,
                    bytes: len,
                    created_unix_ms: header.created_unix_ms,
                });
            }
            handles.sort_by_key(|h| h.seq);

            let tenant = self.tenant_by_id(&id);
            let next_seq = handles.last().map(|h| h.seq + 1).unwrap_or(0);
            let bytes: u64 = handles.iter().map(|h| h.bytes).sum();
            report.segments += handles.len();
            report.tenants += 1;

            tenant.bytes_on_disk.store(bytes, Ordering::Relaxed);
            *tenant.sealed.lock().unwrap() = handles.into();
            tenant.writer.lock().await.next_seq = next_seq;
            debug_assert_eq!(tenant.token_hash, token_hash);

            metrics::gauge!("wal_disk_usage_bytes", "token" => id.clone()).set(bytes as f64);
        }

        self.recovered.store(true, Ordering::Relaxed);
        if report.segments > 0 || report.purged > 0 {
            self.seal_notify.notify_waiters();
            tracing::info!(
                tenants = report.tenants,
                segments = report.segments,
                purged = report.purged,
                "recovered WAL"
            );
        }
        Ok(report)
    }

    async fn open_active(
        &self,
        tenant: &Arc<Tenant>,
        writer: &mut Writer,
        label: &str,
    ) -> Result<(), Error> {
        tokio::fs::create_dir_all(&tenant.dir)
            .await
            .with_context(|| format!("creating tenant directory {}", tenant.dir.display()))
            .map_err(Error::Internal)?;

        let seq = writer.next_seq;
        let path = tenant.dir.join(segment_file_name(seq));
        let created_unix_ms = now_unix_ms();

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .with_context(|| format!("creating segment {}", path.display()))
            .map_err(Error::Internal)?;
        file.write_all(&segment::encode_header(segment::Header {
            token_hash: tenant.token_hash,
            created_unix_ms,
        }))
        .await
        .context("writing segment header")
        .map_err(Error::Internal)?;

        let reason = if writer.create_reason.is_empty() {
            "first"
        } else {
            writer.create_reason
        };
        metrics::counter!(
            "wal_segments_created_total",
            "token" => label.to_string(),
            "reason" => reason,
        )
        .increment(1);
        metrics::gauge!("wal_segments_active", "token" => label.to_string()).set(1.0);

        let now = Instant::now();
        writer.next_seq = seq + 1;
        writer.active = Some(ActiveSegment {
            file,
            path,
            seq,
            bytes: HEADER_LEN,
            created_unix_ms,
            created: now,
            last_write: now,
        });
        tenant.bytes_on_disk.fetch_add(HEADER_LEN, Ordering::Relaxed);
        Ok(())
    }

    async fn seal_locked(
        &self,
        tenant: &Arc<Tenant>,
        writer: &mut Writer,
        reason: &'static str,
        label: &str,
    ) -> Result<Option<SegmentHandle>, Error> {
        let Some(mut active) = writer.active.take() else {
            return Ok(None);
        };

        active
            .file
            .seek(std::io::SeekFrom::Start(active.bytes))
            .await
            .context("seeking to segment tail")
            .map_err(Error::Internal)?;
        active
            .file
            .write_all(&segment::seal_frame())
            .await
            .context("writing seal sentinel")
            .map_err(Error::Internal)?;
        active
            .file
            .sync_all()
            .await
            .context("fsync at seal")
            .map_err(Error::Internal)?;

        let bytes = active.bytes + segment::FRAME_OVERHEAD;
        tenant
            .bytes_on_disk
            .fetch_add(segment::FRAME_OVERHEAD, Ordering::Relaxed);

        let handle = SegmentHandle {
            tenant: tenant.id.clone(),
            seq: active.seq,
            path: active.path,
            bytes,
            created_unix_ms: active.created_unix_ms,
        };
        tenant.sealed.lock().unwrap().push_back(handle.clone());
        writer.create_reason = reason;

        metrics::gauge!("wal_segments_active", "token" => label.to_string()).set(0.0);
        metrics::histogram!("segment_size_bytes").record(bytes as f64);
        tracing::debug!(tenant = %tenant.id, seq = handle.seq, bytes, reason, "sealed segment");

        self.seal_notify.notify_waiters();
        Ok(Some(handle))
    }

    /// Byte- and age-quota enforcement: evict oldest sealed segments until
    /// back under both. The only path that drops unforwarded data.
    async fn enforce_quota(&self, tenant: &Arc<Tenant>, spec: &TokenSpec, label: &str) {
        loop {
            let evict = {
                let sealed = tenant.sealed.lock().unwrap();
                let Some(oldest) = sealed.front() else { break };
                let over_bytes = tenant.bytes_on_disk() >= spec.wal_quota_bytes;
                let age_ms = now_unix_ms().saturating_sub(oldest.created_unix_ms);
                let over_age = age_ms > spec.wal_quota_age.as_millis() as u64;
                if over_bytes || over_age {
                    Some(oldest.clone())
                } else {
                    None
                }
            };
            let Some(handle) = evict else { break };

            tracing::warn!(
                tenant = %tenant.id,
                seq = handle.seq,
                bytes = handle.bytes,
                "evicting oldest sealed segment to satisfy quota"
            );
            metrics::counter!("quota_evicted_total", "token" => label.to_string()).increment(1);
            if let Err(err) = self.delete(&handle).await {
                tracing::error!(?err, path = %handle.path.display(), "failed to evict segment");
                break;
            }
        }
    }
}

/// Adaptive rotation, evaluated after each successful append. `idle_for` is
/// the gap between the previous write and the one just performed.
fn should_rotate(
    size: u64,
    age: Duration,
    idle_for: Duration,
    cfg: &WalConfig,
) -> Option<&'static str> {
    let active_after = Duration::from_secs(cfg.rotation_time_active_minutes * 60);
    let idle_after = Duration::from_secs(cfg.rotation_time_idle_hours * 3600);
    let idle_threshold = Duration::from_secs(cfg.idle_threshold_minutes * 60);
    let force_after = Duration::from_secs(cfg.force_rotation_hours * 3600);

    if size >= cfg.segment_max_bytes {
        return Some("size");
    }
    if size < cfg.min_rotation_bytes && age < force_after {
        return None;
    }
    if idle_for < idle_threshold && age >= active_after && size >= cfg.min_rotation_bytes {
        return Some("active_interval");
    }
    if idle_for >= idle_threshold && age >= idle_after {
        return Some("idle_interval");
    }
    if age >= force_after {
        return Some("force");
    }
    None
}

async fn read_prefix(path: &std::path::Path, len: usize) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
