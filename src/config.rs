//! Settings loading: typed TOML settings, overridable from the command
//! line via `--folder` / `--token`-style flags.

use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_derive::Deserialize;
use structopt::StructOpt;

use crate::error::Error;

fn default_event_debounce() -> u64 {
    5
}

fn default_storage_folder() -> String {
    "osfstorage".to_string()
}

fn default_ignored_names() -> Vec<String> {
    vec![".DS_Store".to_string(), "Thumbs.db".to_string(), ".git".to_string()]
}

fn default_ignored_patterns() -> Vec<String> {
    vec!["*.tmp".to_string(), "~*".to_string(), "*.swp".to_string()]
}

/// On-disk settings file. Deserialized with `toml`; any field left unset
/// in the user's file falls back to its documented default.
#[derive(Debug, Clone, Deserialize)]
pub struct FileSettings {
    #[serde(default = "default_event_debounce")]
    pub event_debounce_seconds: u64,
    #[serde(default = "default_storage_folder")]
    pub osf_storage_folder: String,
    #[serde(default = "default_ignored_names")]
    pub ignored_names: Vec<String>,
    #[serde(default = "default_ignored_patterns")]
    pub ignored_patterns: Vec<String>,
    #[serde(default)]
    pub dry: bool,
    pub remote_base_url: Option<String>,
    pub remote_token: Option<String>,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            event_debounce_seconds: default_event_debounce(),
            osf_storage_folder: default_storage_folder(),
            ignored_names: default_ignored_names(),
            ignored_patterns: default_ignored_patterns(),
            dry: false,
            remote_base_url: None,
            remote_token: None,
        }
    }
}

/// CLI overrides.
#[derive(Debug, StructOpt)]
#[structopt(name = "osfsync", about = "Two-way sync between a local folder and a remote project hosting service")]
pub struct Opt {
    /// Path to the user's folder mirroring synced nodes.
    #[structopt(long, parse(from_os_str))]
    pub folder: PathBuf,

    /// Path to the TOML settings file. Defaults next to the database.
    #[structopt(long, parse(from_os_str))]
    pub settings: Option<PathBuf>,

    /// Log operations without mutating local FS, remote service, or DB.
    #[structopt(long)]
    pub dry: bool,

    #[structopt(long)]
    pub remote_base_url: Option<String>,

    #[structopt(long)]
    pub remote_token: Option<String>,
}

/// Fully resolved settings used by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub user_folder: PathBuf,
    pub event_debounce: std::time::Duration,
    pub osf_storage_folder: String,
    pub ignored_names: Vec<String>,
    pub ignored_patterns: Vec<String>,
    pub dry: bool,
    pub remote_base_url: String,
    pub remote_token: String,
}

impl Settings {
    pub fn load(opt: Opt) -> Result<Self, Error> {
        let file_settings = match &opt.settings {
            Some(path) => read_file_settings(path)?,
            None => FileSettings::default(),
        };

        Ok(Self {
            user_folder: opt.folder,
            event_debounce: std::time::Duration::from_secs(file_settings.event_debounce_seconds),
            osf_storage_folder: file_settings.osf_storage_folder,
            ignored_names: file_settings.ignored_names,
            ignored_patterns: file_settings.ignored_patterns,
            dry: opt.dry || file_settings.dry,
            remote_base_url: opt
                .remote_base_url
                .or(file_settings.remote_base_url)
                .unwrap_or_default(),
            remote_token: opt
                .remote_token
                .or(file_settings.remote_token)
                .unwrap_or_default(),
        })
    }
}

impl Settings {
    /// Compiles `ignored_patterns` into a matchable set, applied by the
    /// Watcher to raw events. An unparsable pattern is logged and skipped
    /// rather than failing the whole set.
    pub fn ignore_glob_set(&self) -> GlobSet {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.ignored_patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => log::warn!("Invalid ignore pattern {:?}: {}", pattern, e),
            }
        }
        builder
            .build()
            .unwrap_or_else(|_| GlobSetBuilder::new().build().expect("empty glob set always builds"))
    }
}

fn read_file_settings(path: &Path) -> Result<FileSettings, Error> {
    let contents = fs::read_to_string(path)?;
    toml::from_str(&contents)
        .map_err(|e| Error::UnexpectedError(format!("Invalid settings file {:?} : {}", path, e)))
}
