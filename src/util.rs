//! Small path/hashing helpers shared by the Auditor, Watcher and Operation
//! executor.

use std::fs;
use std::path::{Path, PathBuf};

use log::Level;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::types::{ContentKind, RelativeFilePath, Sha256 as Sha256Str};

pub fn path_to_string(path: &Path) -> Result<String, Error> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| Error::PathCastingError(format!("Unable to cast path {:?} to str", path)))
}

pub fn string_path_file_name(relative_path: &str) -> Result<String, Error> {
    Path::new(relative_path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            Error::PathCastingError(format!("Unable to get file name of {:?}", relative_path))
        })
}

/// Number of path components, used to sort the Watcher's create cache so
/// parent folders are dispatched before their children.
pub fn parent_count(path: &str) -> usize {
    Path::new(path).components().count()
}

/// Hashes a file's content. IO failures here are "sha unavailable", not a
/// hard error: callers treat `Ok(None)` the same as a missing row.
pub fn hash_file(path: &Path) -> Option<Sha256Str> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return None,
    };
    let mut hasher = Sha256::new();
    match std::io::copy(&mut file, &mut hasher) {
        Ok(_) => Some(hex::encode(hasher.finalize())),
        Err(_) => None,
    }
}

/// Maps a local IO error to the log level the caller should report it at:
/// local IO during an Operation is worth surfacing, but shouldn't be
/// escalated beyond `warn` for common, expected races like "file vanished
/// between list and read".
pub fn io_error_to_log_level(error: &std::io::Error) -> Level {
    use std::io::ErrorKind::*;
    match error.kind() {
        NotFound => Level::Warn,
        _ => Level::Error,
    }
}

/// Whether `name` is illegal on the local filesystem and therefore needs an
/// alias: if a remote name is illegal locally, the local file uses the
/// alias instead. Covers the reserved characters/names common to a
/// combined Windows+POSIX target set.
pub fn needs_alias(name: &str) -> bool {
    const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    const RESERVED: &[&str] = &[
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3",
    ];
    if name.is_empty() || name.trim_end_matches('.').is_empty() {
        return true;
    }
    if name.chars().any(|c| ILLEGAL_CHARS.contains(&c) || c.is_control()) {
        return true;
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return true;
    }
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name))
}

/// Produces a legal local alias for an illegal remote name by stripping /
/// replacing offending characters.
pub fn make_alias(name: &str) -> String {
    const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let mut alias: String = name
        .chars()
        .map(|c| if ILLEGAL_CHARS.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    while alias.ends_with('.') || alias.ends_with(' ') {
        alias.pop();
    }
    if alias.is_empty() {
        alias = "_".to_string();
    }
    alias
}

/// Per-file snapshot gathered from a relative path.
pub struct FileInfos {
    pub relative_path: RelativeFilePath,
    pub absolute_path: PathBuf,
    pub file_name: String,
    pub content_kind: ContentKind,
    pub last_modified_timestamp: u64,
}

impl FileInfos {
    pub fn from(folder_path: &Path, relative_path: RelativeFilePath) -> Result<Self, Error> {
        let absolute_path = folder_path.join(&relative_path);
        let metadata = fs::metadata(&absolute_path)?;
        let content_kind = if metadata.is_dir() {
            ContentKind::Folder
        } else {
            ContentKind::File
        };
        let last_modified_timestamp = metadata
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)?
            .as_millis() as u64;
        let file_name = string_path_file_name(&relative_path)?;

        Ok(Self {
            relative_path,
            absolute_path,
            file_name,
            content_kind,
            last_modified_timestamp,
        })
    }
}

/// Pick the smallest `n >= 1` such that `"<stem> (<n>)<suffix>"` does not
/// already exist under `parent`.
pub fn first_free_conflict_name(parent: &Path, stem: &str, suffix: &str) -> PathBuf {
    let mut n = 1;
    loop {
        let candidate = parent.join(format!("{} ({}){}", stem, n, suffix));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
