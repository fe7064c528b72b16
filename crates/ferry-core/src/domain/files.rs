//! File lists of a job and remote locators.
//!
//! A job declares input files (downloaded into the session directory before
//! execution) and output files (uploaded after execution). Entries without a
//! locator are user-managed: the user uploads / downloads them by hand.
//!
//! Lists are stored one JSON object per line so that single entries can be
//! dropped as transfers complete.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FerryError;

/// Which of the two per-job lists an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileList {
    Input,
    Output,
    /// Outputs already uploaded; excluded when a rerun rebuilds the output list.
    Uploaded,
}

impl FileList {
    pub fn suffix(self) -> &'static str {
        match self {
            FileList::Input => "input",
            FileList::Output => "output",
            FileList::Uploaded => "output_status",
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the session directory ("/data/in.txt" or "data/in.txt").
    pub lfn: String,

    /// Remote locator; `None` means the user moves this file by hand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Credential overriding the job's default one for this file only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<PathBuf>,

    /// Input may replace a user-downloadable output of the same name.
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_overwrite: bool,

    /// Output is uploaded even when the job failed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub preserve: bool,

    /// Output entry naming a side list of further outputs written by the job.
    #[serde(default, skip_serializing_if = "is_false")]
    pub dynamic: bool,

    /// Side list this entry was expanded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl FileEntry {
    /// A user-managed entry.
    pub fn local(lfn: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            locator: None,
            size: None,
            checksum: None,
            credential: None,
            allow_overwrite: false,
            preserve: false,
            dynamic: false,
            origin: None,
        }
    }

    pub fn remote(lfn: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            locator: Some(locator.into()),
            ..Self::local(lfn)
        }
    }

    pub fn is_remote(&self) -> bool {
        self.locator.as_deref().is_some_and(|l| !l.trim().is_empty())
    }

    /// Normalised lfn (leading slashes stripped), the key entries are matched by.
    pub fn key(&self) -> &str {
        self.lfn.trim_start_matches('/')
    }

    pub fn parsed_locator(&self) -> Option<Result<Locator, LocatorError>> {
        self.locator
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .map(Locator::parse)
    }

    /// Absolute path of this entry inside `session_dir`, or `None` when the
    /// lfn tries to escape the session directory.
    pub fn session_path(&self, session_dir: &Path) -> Option<PathBuf> {
        let rel = Path::new(self.key());
        if rel.as_os_str().is_empty() {
            return None;
        }
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(session_dir.join(rel))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    #[error("locator has no scheme: {0}")]
    NoScheme(String),

    #[error("empty locator")]
    Empty,
}

/// A remote locator of the form `scheme://host/path[;opt=val...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    base: String,
    options: Vec<(String, String)>,
}

impl Locator {
    pub fn parse(s: &str) -> Result<Self, LocatorError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocatorError::Empty);
        }
        let Some(scheme_end) = s.find("://") else {
            return Err(LocatorError::NoScheme(s.to_string()));
        };
        if scheme_end == 0 {
            return Err(LocatorError::NoScheme(s.to_string()));
        }
        let rest_start = scheme_end + 3;
        let (base, opts) = match s[rest_start..].find(';') {
            Some(pos) => (&s[..rest_start + pos], &s[rest_start + pos + 1..]),
            None => (s, ""),
        };
        let options = opts
            .split(';')
            .filter(|o| !o.is_empty())
            .map(|o| match o.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (o.to_string(), String::new()),
            })
            .collect();
        Ok(Self {
            base: base.to_string(),
            options,
        })
    }

    pub fn scheme(&self) -> &str {
        self.base.split("://").next().unwrap_or_default()
    }

    /// Everything after `scheme://` without options.
    pub fn path(&self) -> &str {
        self.base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or_default()
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn option_is_yes(&self, key: &str) -> bool {
        matches!(self.option(key), Some("yes" | "true" | "1" | ""))
    }

    /// Set (or replace) an option.
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        match self.options.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.options.push((key.to_string(), value.to_string())),
        }
        self
    }

    /// Text used to decide whether two locators name the same remote object.
    ///
    /// `strict` compares options in the order they were written; otherwise
    /// options are sorted first, so `;a=1;b=2` and `;b=2;a=1` are the same.
    pub fn identity(&self, strict: bool) -> String {
        if strict {
            return self.to_string();
        }
        let mut options = self.options.clone();
        options.sort();
        let mut out = self.base.clone();
        for (k, v) in &options {
            push_option(&mut out, k, v);
        }
        out
    }
}

fn push_option(out: &mut String, k: &str, v: &str) {
    out.push(';');
    out.push_str(k);
    if !v.is_empty() {
        out.push('=');
        out.push_str(v);
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = self.base.clone();
        for (k, v) in &self.options {
            push_option(&mut out, k, v);
        }
        f.write_str(&out)
    }
}

/// Parse a line-oriented list. Blank lines are skipped.
pub fn parse_list(text: &str, origin: &Path) -> Result<Vec<FileEntry>, FerryError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<FileEntry>(line)
                .map_err(|e| FerryError::corrupt(origin, format!("line {}: {e}", n + 1)))
        })
        .collect()
}

pub fn format_list(entries: &[FileEntry]) -> Result<String, FerryError> {
    let mut out = String::new();
    for entry in entries {
        let line = serde_json::to_string(entry)
            .map_err(|e| FerryError::Other(format!("encode file entry: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

pub fn read_list(path: &Path) -> Result<Vec<FileEntry>, FerryError> {
    let text = fs::read_to_string(path).map_err(|e| FerryError::io(path, e))?;
    parse_list(&text, path)
}

/// Replace the list at `path` through a temporary file and a rename.
pub fn write_list(path: &Path, entries: &[FileEntry]) -> Result<(), FerryError> {
    write_atomic(path, format_list(entries)?.as_bytes())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FerryError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| FerryError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| FerryError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| FerryError::io(path, e))
}
