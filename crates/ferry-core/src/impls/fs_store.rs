//! FsJobStore - コントロールディレクトリ上のジョブ記録
//!
//! One file per record, named `job.<id>.<suffix>`:
//!
//! | suffix          | content                                  |
//! |-----------------|------------------------------------------|
//! | `description`   | submitted description (JSON)             |
//! | `status`        | state name                               |
//! | `local`         | local snapshot (JSON)                    |
//! | `input`         | input file list (JSON lines)             |
//! | `output`        | output file list (JSON lines)            |
//! | `output_status` | outputs already uploaded (JSON lines)    |
//! | `failed`        | accumulated failure text                 |
//! | `statistics`    | one line per completed transfer          |
//! | `cancel` / `rerun` / `clean` | request markers (empty)     |

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::domain::files::{read_list, write_atomic, write_list};
use crate::domain::{FileEntry, FileList, JobDescription, JobId, JobLocal, JobState};
use crate::error::FerryError;
use crate::ports::{JobStore, Request};

const DESCRIPTION: &str = "description";
const STATUS: &str = "status";
const LOCAL: &str = "local";
const FAILED: &str = "failed";
const STATISTICS: &str = "statistics";

const ALL_SUFFIXES: [&str; 11] = [
    DESCRIPTION,
    STATUS,
    LOCAL,
    "input",
    "output",
    "output_status",
    FAILED,
    STATISTICS,
    "cancel",
    "rerun",
    "clean",
];

/// Records kept for a DELETED job.
const TRACE_SUFFIXES: [&str; 2] = [STATUS, FAILED];

#[derive(Debug, Clone)]
pub struct FsJobStore {
    root: PathBuf,
}

impl FsJobStore {
    /// Open (and create if needed) a control directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, FerryError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| FerryError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, id: &JobId, suffix: &str) -> PathBuf {
        self.root.join(format!("job.{id}.{suffix}"))
    }

    fn read_optional(&self, id: &JobId, suffix: &str) -> Result<Option<String>, FerryError> {
        let path = self.path(id, suffix);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FerryError::io(path, e)),
        }
    }

    fn write_json<T: serde::Serialize>(
        &self,
        id: &JobId,
        suffix: &str,
        value: &T,
    ) -> Result<(), FerryError> {
        let path = self.path(id, suffix);
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| FerryError::corrupt(&path, e.to_string()))?;
        write_atomic(&path, &bytes)
    }

    fn remove(&self, id: &JobId, suffix: &str) -> Result<bool, FerryError> {
        let path = self.path(id, suffix);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FerryError::io(path, e)),
        }
    }
}

impl JobStore for FsJobStore {
    fn list_jobs(&self) -> Result<Vec<JobId>, FerryError> {
        let entries = fs::read_dir(&self.root).map_err(|e| FerryError::io(&self.root, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FerryError::io(&self.root, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((id, suffix)) = name
                .strip_prefix("job.")
                .and_then(|rest| rest.rsplit_once('.'))
            else {
                continue;
            };
            if suffix == DESCRIPTION || suffix == STATUS {
                let id = JobId::new(id);
                if id.is_valid() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn write_description(&self, id: &JobId, desc: &JobDescription) -> Result<(), FerryError> {
        self.write_json(id, DESCRIPTION, desc)
    }

    fn read_description(&self, id: &JobId) -> Result<JobDescription, FerryError> {
        let path = self.path(id, DESCRIPTION);
        let text = fs::read_to_string(&path).map_err(|e| FerryError::io(&path, e))?;
        serde_json::from_str(&text).map_err(|e| FerryError::corrupt(&path, e.to_string()))
    }

    fn read_state(&self, id: &JobId) -> Result<Option<JobState>, FerryError> {
        self.read_optional(id, STATUS)?
            .map(|text| {
                text.parse()
                    .map_err(|e| FerryError::corrupt(self.path(id, STATUS), format!("{e}")))
            })
            .transpose()
    }

    fn write_state(&self, id: &JobId, state: JobState) -> Result<(), FerryError> {
        write_atomic(&self.path(id, STATUS), format!("{state}\n").as_bytes())
    }

    fn read_local(&self, id: &JobId) -> Result<Option<JobLocal>, FerryError> {
        self.read_optional(id, LOCAL)?
            .map(|text| {
                serde_json::from_str(&text)
                    .map_err(|e| FerryError::corrupt(self.path(id, LOCAL), e.to_string()))
            })
            .transpose()
    }

    fn write_local(&self, id: &JobId, local: &JobLocal) -> Result<(), FerryError> {
        self.write_json(id, LOCAL, local)
    }

    fn read_list(&self, id: &JobId, list: FileList) -> Result<Vec<FileEntry>, FerryError> {
        match read_list(&self.path(id, list.suffix())) {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    fn write_list(
        &self,
        id: &JobId,
        list: FileList,
        entries: &[FileEntry],
    ) -> Result<(), FerryError> {
        write_list(&self.path(id, list.suffix()), entries)
    }

    fn read_failed(&self, id: &JobId) -> Result<Option<String>, FerryError> {
        self.read_optional(id, FAILED)
    }

    fn write_failed(&self, id: &JobId, text: &str) -> Result<(), FerryError> {
        write_atomic(&self.path(id, FAILED), text.as_bytes())
    }

    fn clear_failed(&self, id: &JobId) -> Result<(), FerryError> {
        self.remove(id, FAILED).map(|_| ())
    }

    fn place_request(&self, id: &JobId, request: Request) -> Result<(), FerryError> {
        let path = self.path(id, request.suffix());
        fs::File::create(&path)
            .map(|_| ())
            .map_err(|e| FerryError::io(path, e))
    }

    fn has_request(&self, id: &JobId, request: Request) -> Result<bool, FerryError> {
        Ok(self.path(id, request.suffix()).exists())
    }

    fn take_request(&self, id: &JobId, request: Request) -> Result<bool, FerryError> {
        self.remove(id, request.suffix())
    }

    fn append_statistics(&self, id: &JobId, line: &str) -> Result<(), FerryError> {
        let path = self.path(id, STATISTICS);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| FerryError::io(&path, e))?;
        writeln!(file, "{line}").map_err(|e| FerryError::io(&path, e))
    }

    fn purge_to_trace(&self, id: &JobId) -> Result<(), FerryError> {
        for suffix in ALL_SUFFIXES.iter().filter(|s| !TRACE_SUFFIXES.contains(*s)) {
            self.remove(id, suffix)?;
        }
        Ok(())
    }

    fn purge(&self, id: &JobId) -> Result<(), FerryError> {
        for suffix in ALL_SUFFIXES {
            self.remove(id, suffix)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Owner;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsJobStore::open(dir.path().join("control")).unwrap();
        (dir, store)
    }

    fn description() -> JobDescription {
        JobDescription {
            owner: Owner::default(),
            session_dir: PathBuf::from("/sessions/a"),
            executable: Some("/bin/true".to_string()),
            priority: 50,
            start_time: None,
            credential: None,
            inputs: vec![FileEntry::remote("/in", "gsiftp://se/in")],
            outputs: Vec::new(),
        }
    }

    #[test]
    fn state_roundtrip_and_missing_state() {
        let (_dir, store) = store();
        let id = JobId::new("a");
        assert_eq!(store.read_state(&id).unwrap(), None);
        store.write_state(&id, JobState::InBatchSystem).unwrap();
        assert_eq!(store.read_state(&id).unwrap(), Some(JobState::InBatchSystem));
    }

    #[test]
    fn garbage_state_is_corrupt() {
        let (_dir, store) = store();
        let id = JobId::new("a");
        fs::write(store.path(&id, STATUS), "RUNNING").unwrap();
        assert!(matches!(
            store.read_state(&id),
            Err(FerryError::Corrupt { .. })
        ));
    }

    #[test]
    fn lists_jobs_from_description_and_status() {
        let (_dir, store) = store();
        store.write_description(&JobId::new("b.1"), &description()).unwrap();
        store.write_state(&JobId::new("a"), JobState::Finished).unwrap();
        store.write_state(&JobId::new("b.1"), JobState::Accepted).unwrap();
        // stray files are ignored
        fs::write(store.root().join("notes.txt"), "x").unwrap();
        let ids = store.list_jobs().unwrap();
        assert_eq!(ids, vec![JobId::new("a"), JobId::new("b.1")]);
    }

    #[test]
    fn missing_list_reads_empty() {
        let (_dir, store) = store();
        assert!(store
            .read_list(&JobId::new("a"), FileList::Output)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn request_markers_are_consumed_once() {
        let (_dir, store) = store();
        let id = JobId::new("a");
        store.place_request(&id, Request::Cancel).unwrap();
        assert!(store.has_request(&id, Request::Cancel).unwrap());
        assert!(store.take_request(&id, Request::Cancel).unwrap());
        assert!(!store.take_request(&id, Request::Cancel).unwrap());
        assert!(!store.has_request(&id, Request::Rerun).unwrap());
    }

    #[test]
    fn statistics_are_appended() {
        let (_dir, store) = store();
        let id = JobId::new("a");
        store.append_statistics(&id, "inputfile:url=x").unwrap();
        store.append_statistics(&id, "outputfile:url=y").unwrap();
        let text = fs::read_to_string(store.path(&id, STATISTICS)).unwrap();
        assert_eq!(text, "inputfile:url=x\noutputfile:url=y\n");
    }

    #[test]
    fn purge_to_trace_keeps_state_and_failure() {
        let (_dir, store) = store();
        let id = JobId::new("a");
        store.write_description(&id, &description()).unwrap();
        store.write_state(&id, JobState::Finished).unwrap();
        store.write_failed(&id, "boom").unwrap();
        store
            .write_list(&id, FileList::Input, &description().inputs)
            .unwrap();

        store.purge_to_trace(&id).unwrap();
        assert!(store.read_description(&id).is_err());
        assert_eq!(store.read_state(&id).unwrap(), Some(JobState::Finished));
        assert_eq!(store.read_failed(&id).unwrap().as_deref(), Some("boom"));

        store.purge(&id).unwrap();
        assert!(store.list_jobs().unwrap().is_empty());
    }
}
