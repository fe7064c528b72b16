//! LocalTransferScheduler - file:// ロケータ間のコピーを行う転送エンジン
//!
//! Every accepted DTR becomes a tokio task that waits for a transfer slot,
//! copies on a blocking thread and posts the DTR back on the completion
//! channel. A copy is never interrupted halfway: cancellation is checked
//! before the first try and between tries.
//!
//! # 学習ポイント
//! - Semaphore による同時実行数の制御（通常スロット + 緊急スロット）
//! - spawn_blocking でのファイル I/O
//! - コピーと同時に blake3 ハッシュを計算（single pass）
//!
//! # キャッシュ
//! Downloads marked cache-eligible go through one of the configured cache
//! directories, chosen by the blake3 of the source locator:
//! `<cache>/data/<key>` holds the file, `<cache>/joblinks/<job>/<key>` marks
//! that a job uses it. [`CacheReleaser::release`] drops a job's marks.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::TransferConfig;
use crate::domain::files::write_atomic;
use crate::domain::{
    Direction, DtrError, DtrId, DtrStatus, JobId, Locator, Owner, TransferRequest,
};
use crate::error::FerryError;
use crate::ports::{CacheReleaser, DtrSink, TransferScheduler};

const CHUNK_SIZE: usize = 256 * 1024;
const CACHE_DATA: &str = "data";
const CACHE_LINKS: &str = "joblinks";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bookkeeping of an accepted DTR until it is posted back.
struct InFlight {
    job_id: JobId,
    status: DtrStatus,
    priority: u8,
    share: String,
    destination: String,
    cancel: Arc<AtomicBool>,
}

struct Inner {
    config: TransferConfig,
    sink: DtrSink,
    slots: Arc<Semaphore>,
    emergency: Arc<Semaphore>,
    in_flight: Mutex<HashMap<DtrId, InFlight>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct LocalTransferScheduler {
    inner: Arc<Inner>,
    runtime: Handle,
}

impl LocalTransferScheduler {
    /// Has to be called from inside a tokio runtime; transfers run on it.
    pub fn new(config: TransferConfig, sink: DtrSink) -> Result<Self, FerryError> {
        let runtime = Handle::try_current().map_err(|e| {
            FerryError::Other(format!("transfer scheduler needs a tokio runtime: {e}"))
        })?;
        for dir in &config.cache_dirs {
            for sub in [CACHE_DATA, CACHE_LINKS] {
                let path = dir.join(sub);
                fs::create_dir_all(&path).map_err(|e| FerryError::io(&path, e))?;
            }
        }
        let inner = Inner {
            slots: Arc::new(Semaphore::new(config.slots)),
            emergency: Arc::new(Semaphore::new(config.emergency_slots)),
            config,
            sink,
            in_flight: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        };
        Ok(Self {
            inner: Arc::new(inner),
            runtime,
        })
    }

    /// DTRs accepted and not yet posted back.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }
}

#[async_trait]
impl TransferScheduler for LocalTransferScheduler {
    fn submit(&self, dtr: TransferRequest) -> Result<(), FerryError> {
        if self.inner.slots.is_closed() {
            return Err(FerryError::Scheduler("shutting down".to_string()));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        lock(&self.inner.in_flight).insert(
            dtr.id,
            InFlight {
                job_id: dtr.job_id.clone(),
                status: DtrStatus::Queued,
                priority: dtr.priority,
                share: dtr.transfer_share.clone(),
                destination: dtr.destination.clone(),
                cancel: Arc::clone(&cancel),
            },
        );
        self.inner.write_dump();
        tracing::debug!(dtr_id = %dtr.id, job_id = %dtr.job_id, lfn = %dtr.lfn, "transfer queued");

        let task = self
            .runtime
            .spawn(run_transfer(Arc::clone(&self.inner), dtr, cancel));
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(())
    }

    fn cancel(&self, job_id: &JobId) {
        let in_flight = lock(&self.inner.in_flight);
        for entry in in_flight.values().filter(|f| &f.job_id == job_id) {
            entry.cancel.store(true, Ordering::SeqCst);
        }
    }

    async fn shutdown(&self) {
        for entry in lock(&self.inner.in_flight).values() {
            entry.cancel.store(true, Ordering::SeqCst);
        }
        // queued transfers stop waiting for a slot
        self.inner.slots.close();
        self.inner.emergency.close();

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        tracing::info!(count = tasks.len(), "waiting for transfers to finish");
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "transfer task panicked");
            }
        }
    }
}

impl CacheReleaser for LocalTransferScheduler {
    fn release(&self, job_id: &JobId, owner: &Owner) -> Result<(), FerryError> {
        for dir in &self.inner.config.cache_dirs {
            let links = dir.join(CACHE_LINKS).join(job_id.as_str());
            match fs::remove_dir_all(&links) {
                Ok(()) => {
                    tracing::debug!(job_id = %job_id, uid = owner.uid, cache = %dir.display(), "released cache entries");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(FerryError::io(links, e)),
            }
        }
        Ok(())
    }
}

impl Inner {
    async fn acquire(&self, priority: u8) -> Option<OwnedSemaphorePermit> {
        if priority >= self.config.emergency_priority && self.config.emergency_slots > 0 {
            tokio::select! {
                p = Arc::clone(&self.slots).acquire_owned() => p.ok(),
                p = Arc::clone(&self.emergency).acquire_owned() => p.ok(),
            }
        } else {
            Arc::clone(&self.slots).acquire_owned().await.ok()
        }
    }

    fn set_status(&self, id: &DtrId, status: DtrStatus) {
        if let Some(entry) = lock(&self.in_flight).get_mut(id) {
            entry.status = status;
        }
        self.write_dump();
    }

    fn forget(&self, id: &DtrId) {
        lock(&self.in_flight).remove(id);
        self.write_dump();
    }

    /// `<id> <STATE> <priority> <share> <destination>` per in-flight DTR.
    fn write_dump(&self) {
        let Some(path) = &self.config.dump_file else {
            return;
        };
        let text = {
            let in_flight = lock(&self.in_flight);
            let mut lines: Vec<String> = in_flight
                .iter()
                .map(|(id, f)| {
                    let state = match f.status {
                        DtrStatus::Transferring => "TRANSFERRING",
                        _ => "QUEUED",
                    };
                    format!("{id} {state} {} {} {}\n", f.priority, f.share, f.destination)
                })
                .collect();
            lines.sort();
            lines.concat()
        };
        if let Err(e) = write_atomic(path, text.as_bytes()) {
            tracing::warn!(error = %e, "can't write DTR dump");
        }
    }
}

async fn run_transfer(inner: Arc<Inner>, mut dtr: TransferRequest, cancel: Arc<AtomicBool>) {
    let permit = inner.acquire(dtr.priority).await;
    if permit.is_none() || cancel.load(Ordering::SeqCst) {
        dtr.status = DtrStatus::Cancelled;
    } else {
        inner.set_status(&dtr.id, DtrStatus::Transferring);
        dtr.started = Some(Utc::now());
        execute(&inner, &mut dtr, &cancel).await;
        dtr.finished = Some(Utc::now());
    }
    drop(permit);
    inner.forget(&dtr.id);

    match &dtr.error {
        Some(e) => tracing::info!(dtr_id = %dtr.id, job_id = %dtr.job_id, lfn = %dtr.lfn, error = %e.message, "transfer failed"),
        None => tracing::debug!(dtr_id = %dtr.id, job_id = %dtr.job_id, status = ?dtr.status, "transfer over"),
    }
    inner.sink.post(dtr);
}

/// Try until the copy succeeds, a permanent error shows up, the tries run
/// out or the DTR is cancelled.
async fn execute(inner: &Arc<Inner>, dtr: &mut TransferRequest, cancel: &AtomicBool) {
    let delay = Duration::from_millis(inner.config.retry_delay_millis);
    loop {
        let shared = Arc::clone(inner);
        let snapshot = dtr.clone();
        let error = match tokio::task::spawn_blocking(move || copy_once(&shared.config, &snapshot))
            .await
        {
            Ok(Ok(copied)) => {
                dtr.status = DtrStatus::Done;
                dtr.bytes = Some(copied.bytes);
                dtr.cache_hit = copied.cache_hit;
                return;
            }
            Ok(Err(e)) => e,
            Err(e) => DtrError::transient(format!("transfer task failed: {e}")),
        };

        dtr.tries_left = dtr.tries_left.saturating_sub(1);
        let stop = cancel.load(Ordering::SeqCst);
        if stop || !error.kind.is_retryable() || dtr.tries_left == 0 {
            dtr.status = if stop {
                DtrStatus::Cancelled
            } else {
                DtrStatus::Failed
            };
            dtr.error = Some(error);
            return;
        }
        tracing::warn!(dtr_id = %dtr.id, tries_left = dtr.tries_left, error = %error.message, "transfer try failed, retrying");
        tokio::time::sleep(delay).await;
        if cancel.load(Ordering::SeqCst) {
            dtr.status = DtrStatus::Cancelled;
            return;
        }
    }
}

#[derive(Debug)]
struct Copied {
    bytes: u64,
    cache_hit: bool,
}

/// A remote locator resolved to a local path.
#[derive(Debug)]
struct Remote {
    path: PathBuf,
    checksum: Option<String>,
    overwrite: bool,
}

fn copy_once(config: &TransferConfig, dtr: &TransferRequest) -> Result<Copied, DtrError> {
    let tag = dtr.id.to_string();
    match dtr.direction() {
        Direction::Download => {
            let source = resolve(&map_url(config, &dtr.source))?;
            let dest = dtr.local();
            if dtr.cache_eligible
                && let Some(cache) = cache_dir(config, &dtr.source)
            {
                return fetch_cached(cache, dtr, &source, dest);
            }
            let bytes = copy_verified(&source.path, dest, source.checksum.as_deref(), &tag)?;
            Ok(Copied {
                bytes,
                cache_hit: false,
            })
        }
        Direction::Upload => {
            let dest = resolve(&dtr.destination)?;
            if !dtr.force_overwrite && !dest.overwrite && dest.path.exists() {
                return Err(DtrError::permanent(format!(
                    "destination {} already exists",
                    dtr.destination
                )));
            }
            let bytes = copy_verified(dtr.local(), &dest.path, None, &tag)?;
            Ok(Copied {
                bytes,
                cache_hit: false,
            })
        }
    }
}

/// Apply the first matching source prefix rewrite.
fn map_url(config: &TransferConfig, url: &str) -> String {
    config
        .url_map
        .iter()
        .find_map(|m| {
            url.strip_prefix(m.from.as_str())
                .map(|rest| format!("{}{rest}", m.to))
        })
        .unwrap_or_else(|| url.to_string())
}

fn resolve(url: &str) -> Result<Remote, DtrError> {
    let locator =
        Locator::parse(url).map_err(|e| DtrError::permanent(format!("bad locator {url}: {e}")))?;
    if locator.scheme() != "file" {
        return Err(DtrError::permanent(format!(
            "unsupported protocol {}",
            locator.scheme()
        )));
    }
    let checksum = match locator.option("checksum") {
        None => None,
        Some(value) => match value.split_once(':') {
            None => Some(value.to_string()),
            Some(("blake3", hex)) => Some(hex.to_string()),
            Some((algo, _)) => {
                return Err(DtrError::permanent(format!(
                    "unsupported checksum type {algo}"
                )));
            }
        },
    };
    Ok(Remote {
        path: PathBuf::from(locator.path()),
        checksum,
        overwrite: locator.option_is_yes("overwrite"),
    })
}

fn cache_dir<'a>(config: &'a TransferConfig, source: &str) -> Option<&'a Path> {
    if config.cache_dirs.is_empty() {
        return None;
    }
    let hash = blake3::hash(source.as_bytes());
    let idx = usize::from(hash.as_bytes()[0]) % config.cache_dirs.len();
    Some(config.cache_dirs[idx].as_path())
}

fn fetch_cached(
    cache: &Path,
    dtr: &TransferRequest,
    source: &Remote,
    dest: &Path,
) -> Result<Copied, DtrError> {
    let tag = dtr.id.to_string();
    let key = blake3::hash(dtr.source.as_bytes()).to_hex().to_string();
    let cached = cache.join(CACHE_DATA).join(&key);
    let hit = cached.is_file();
    if !hit {
        copy_verified(&source.path, &cached, source.checksum.as_deref(), &tag)?;
    }
    let bytes = copy_verified(&cached, dest, None, &tag)?;

    let links = cache.join(CACHE_LINKS).join(dtr.job_id.as_str());
    fs::create_dir_all(&links)
        .and_then(|()| fs::File::create(links.join(&key)).map(|_| ()))
        .map_err(|e| DtrError::transient(format!("can't link cache entry: {e}")))?;
    Ok(Copied {
        bytes,
        cache_hit: hit,
    })
}

/// Copy through a temporary file next to `dest`, hashing on the way, and
/// rename once the hash matches `expected` (if given).
fn copy_verified(
    source: &Path,
    dest: &Path,
    expected: Option<&str>,
    tag: &str,
) -> Result<u64, DtrError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(e, parent))?;
    }
    let mut tmp = dest.as_os_str().to_owned();
    tmp.push(format!(".{tag}.part"));
    let tmp = PathBuf::from(tmp);

    let result = copy_and_hash(source, &tmp).and_then(|(bytes, hash)| {
        if let Some(expected) = expected
            && !hash.eq_ignore_ascii_case(expected.trim())
        {
            return Err(DtrError::permanent(format!(
                "checksum mismatch for {}: expected {expected}, got {hash}",
                source.display()
            )));
        }
        fs::rename(&tmp, dest).map_err(|e| io_error(e, dest))?;
        Ok(bytes)
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Single pass: read → hash → write.
fn copy_and_hash(source: &Path, dest: &Path) -> Result<(u64, String), DtrError> {
    let mut input = fs::File::open(source).map_err(|e| io_error(e, source))?;
    let mut output = fs::File::create(dest).map_err(|e| io_error(e, dest))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;
    loop {
        let n = input.read(&mut buf).map_err(|e| io_error(e, source))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n]).map_err(|e| io_error(e, dest))?;
        bytes += n as u64;
    }
    output.flush().map_err(|e| io_error(e, dest))?;
    Ok((bytes, hasher.finalize().to_hex().to_string()))
}

fn io_error(err: io::Error, path: &Path) -> DtrError {
    match err.kind() {
        io::ErrorKind::NotFound => DtrError::permanent(format!("no such file {}", path.display())),
        io::ErrorKind::PermissionDenied => {
            DtrError::permanent(format!("permission denied on {}", path.display()))
        }
        _ => DtrError::transient(format!("I/O error on {}: {err}", path.display())),
    }
}
