//! Durable service settings: a section/key string store backed by one file.
//!
//! The only value the bridge itself stores is which serial port to use,
//! under `[Settings] com_port`.

use std::{
    collections::BTreeMap,
    fs, io,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// The section the bridge's own settings live under.
pub const SECTION: &str = "Settings";

/// The key naming the serial port of the supply.
pub const COM_PORT_KEY: &str = "com_port";

/// The port written into a freshly created settings file.
pub const DEFAULT_COM_PORT: &str = "COM3";

/// Problems accessing the settings file.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Filesystem trouble.
    #[error("could not access `{path}`: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,

        /// The underlying error.
        source: io::Error,
    },

    /// The file exists but does not parse.
    #[error("`{path}` is not a valid settings file: {problem}")]
    Malformed {
        /// The file involved.
        path: PathBuf,

        /// What was wrong with it.
        problem: String,
    },

    /// The section/key pair is not in the file.
    #[error("no value for `{key}` under `[{section}]`")]
    Missing {
        /// The section looked in.
        section: String,

        /// The key looked for.
        key: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sections(BTreeMap<String, BTreeMap<String, String>>);

/// A file-backed store of string settings grouped into sections.
///
/// Nothing is cached: every read parses the file, every write rewrites it.
/// Writes go to a sibling temp file first and are renamed into place,
/// so a concurrent reader never observes a half-written file.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// A store at the given path. The file itself may not exist yet;
    /// see [`SettingsStore::ensure_template`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create the file with default contents if it does not exist.
    /// An existing file is left untouched.
    pub fn ensure_template(&self) -> Result<(), SettingsError> {
        if self.path.exists() {
            return Ok(());
        }

        info!(path = %self.path.display(), "No settings file, creating template");

        let mut sections = Sections::default();
        sections
            .0
            .entry(SECTION.to_owned())
            .or_default()
            .insert(COM_PORT_KEY.to_owned(), DEFAULT_COM_PORT.to_owned());

        self.persist(&sections)
    }

    /// Look up one value.
    pub fn read(&self, section: &str, key: &str) -> Result<String, SettingsError> {
        let sections = self.load()?;

        sections
            .0
            .get(section)
            .and_then(|entries| entries.get(key))
            .cloned()
            .ok_or_else(|| SettingsError::Missing {
                section: section.to_owned(),
                key: key.to_owned(),
            })
    }

    /// Insert or overwrite one value, leaving all others alone.
    /// Durable when this returns.
    pub fn write(&self, section: &str, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut sections = if self.path.exists() {
            self.load()?
        } else {
            Sections::default()
        };

        sections
            .0
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());

        self.persist(&sections)
    }

    fn load(&self) -> Result<Sections, SettingsError> {
        let text = fs::read_to_string(&self.path).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })?;

        ron::from_str(&text).map_err(|e| SettingsError::Malformed {
            path: self.path.clone(),
            problem: e.to_string(),
        })
    }

    fn persist(&self, sections: &Sections) -> Result<(), SettingsError> {
        let text = ron::ser::to_string_pretty(sections, ron::ser::PrettyConfig::default())
            .map_err(|e| SettingsError::Malformed {
                path: self.path.clone(),
                problem: e.to_string(),
            })?;

        let io_error = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };

        // Readers must never see a partial write.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text).map_err(io_error)?;
        fs::rename(&tmp, &self.path).map_err(io_error)
    }
}
