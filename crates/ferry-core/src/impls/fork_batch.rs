//! ForkBatch - ジョブをセッションディレクトリで直接実行するバッチシステム
//!
//! The executable runs under `sh -c` with the session directory as working
//! directory. The wrapper script writes the exit code to
//! [`EXIT_MARKER`] in the session directory, so a job that ended while
//! ferry was down is still reported correctly after a restart.
//!
//! Each job leads its own process group; cancelling kills the whole group.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};

use crate::domain::{Job, JobId};
use crate::error::FerryError;
use crate::ports::{BatchStatus, BatchSystem};

pub const EXIT_MARKER: &str = ".ferry.exit";
const OUTPUT_LOG: &str = ".ferry.log";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct ForkBatch {
    children: Mutex<HashMap<JobId, Child>>,
}

impl ForkBatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_dir(job: &Job) -> Result<&Path, FerryError> {
        job.local
            .as_ref()
            .map(|l| l.session_dir.as_path())
            .ok_or_else(|| FerryError::Batch(format!("job {} has no local record", job.id)))
    }
}

/// The executable runs in a subshell so an `exit` in it still reaches the
/// marker line.
fn script(executable: &str) -> String {
    format!(
        "(\n{executable}\n)\nrc=$?\necho $rc > {EXIT_MARKER}.tmp && mv {EXIT_MARKER}.tmp {EXIT_MARKER}\nexit $rc\n"
    )
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// SIGKILL to every process in group `pgid`. A group that is already gone
/// is not an error.
fn kill_group(pgid: libc::pid_t) -> io::Result<()> {
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

fn read_marker(session_dir: &Path) -> Result<Option<i32>, FerryError> {
    let path = session_dir.join(EXIT_MARKER);
    match fs::read_to_string(&path) {
        Ok(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| FerryError::corrupt(&path, format!("bad exit code: {e}"))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FerryError::io(path, e)),
    }
}

impl BatchSystem for ForkBatch {
    fn submit(&self, job: &Job) -> Result<String, FerryError> {
        let session_dir = Self::session_dir(job)?;
        let executable = job
            .local
            .as_ref()
            .and_then(|l| l.executable.as_deref())
            .ok_or_else(|| FerryError::Batch(format!("job {} has no executable", job.id)))?;

        let marker = session_dir.join(EXIT_MARKER);
        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(FerryError::io(marker, e)),
        }
        let log_path = session_dir.join(OUTPUT_LOG);
        let log = fs::File::create(&log_path).map_err(|e| FerryError::io(&log_path, e))?;
        let log_err = log.try_clone().map_err(|e| FerryError::io(&log_path, e))?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(script(executable))
            .current_dir(session_dir)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(|e| FerryError::Batch(format!("can't start {executable}: {e}")))?;

        let pid = child.id().to_string();
        tracing::info!(job_id = %job.id, pid = %pid, "job started");
        lock(&self.children).insert(job.id.clone(), child);
        Ok(pid)
    }

    fn cancel(&self, job: &Job) -> Result<(), FerryError> {
        let mut children = lock(&self.children);
        let Some(child) = children.get_mut(&job.id) else {
            tracing::debug!(job_id = %job.id, "nothing to cancel");
            return Ok(());
        };
        let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
            return Err(FerryError::Batch(format!("job {} has no valid pid", job.id)));
        };
        kill_group(pgid)
            .map_err(|e| FerryError::Batch(format!("can't kill job {}: {e}", job.id)))
    }

    fn poll(&self, job: &Job) -> Result<BatchStatus, FerryError> {
        let session_dir = Self::session_dir(job)?;
        let mut children = lock(&self.children);
        if let Some(child) = children.get_mut(&job.id) {
            let waited = child
                .try_wait()
                .map_err(|e| FerryError::Batch(format!("can't wait for job {}: {e}", job.id)))?;
            let Some(status) = waited else {
                return Ok(BatchStatus::Running);
            };
            children.remove(&job.id);
            // the marker is missing when the wrapper itself was killed
            let code = read_marker(session_dir)?.unwrap_or_else(|| exit_code(status));
            return Ok(BatchStatus::Done { exit_code: code });
        }
        drop(children);

        match read_marker(session_dir)? {
            Some(code) => Ok(BatchStatus::Done { exit_code: code }),
            None => Ok(BatchStatus::Failed(
                "job is not known to the batch system".to_string(),
            )),
        }
    }
}
