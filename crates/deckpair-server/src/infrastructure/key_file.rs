//! TOML persistence for paired keys.
//!
//! The file lives in the platform config directory by default:
//! - Windows:  `%APPDATA%\deckpair\keys.toml`
//! - Linux:    `~/.config/deckpair/keys.toml`
//! - macOS:    `~/Library/Application Support/deckpair/keys.toml`
//!
//! ```toml
//! [[peers]]
//! id = "dev-42"
//! key = "q83vEjRWeJA..."   # base64, 32 bytes
//! ```
//!
//! The whole store is rewritten after every successful pairing.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use deckpair_core::{KeyStore, PeerId, SharedKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

/// Owner read/write only: the file holds every shared key.
#[cfg(unix)]
const KEY_FILE_MODE: u32 = 0o600;

/// Error type for key file operations.
#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing key file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse key file TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize key file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// On-disk layout.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct KeyFileContents {
    #[serde(default)]
    peers: Vec<PeerEntry>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct PeerEntry {
    id: String,
    key: String,
}

/// A key file at a fixed path.
#[derive(Debug)]
pub struct KeyFile {
    path: PathBuf,
    // Serializes concurrent saves from different connection tasks.
    write_lock: Mutex<()>,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file into a fresh [`KeyStore`].  A missing file yields an
    /// empty store.  Entries with a blank id or a key that is not 32 bytes
    /// of base64 are skipped with a warning; those peers simply pair again.
    ///
    /// # Errors
    ///
    /// [`KeyFileError::Io`] for file-system errors other than "not found",
    /// [`KeyFileError::Parse`] if the TOML is malformed.
    pub fn load(&self) -> Result<KeyStore, KeyFileError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(KeyStore::new()),
            Err(source) => {
                return Err(KeyFileError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let contents: KeyFileContents = toml::from_str(&content)?;
        let entries = contents.peers.into_iter().filter_map(|entry| {
            let Some(id) = PeerId::new(entry.id) else {
                warn!(path = %self.path.display(), "skipping key file entry with blank id");
                return None;
            };
            let key = STANDARD
                .decode(entry.key.trim())
                .ok()
                .and_then(|bytes| SharedKey::from_slice(&bytes));
            match key {
                Some(key) => Some((id, key)),
                None => {
                    warn!(peer = %id, "skipping key file entry with invalid key");
                    None
                }
            }
        });

        Ok(KeyStore::from_entries(entries))
    }

    /// Writes every entry of `store`, creating parent directories as needed.
    ///
    /// The contents go to a temporary file next to the target, readable by
    /// the owner only on unix, which is then renamed over the target.  A
    /// crash mid-save leaves the previous file intact.
    ///
    /// # Errors
    ///
    /// [`KeyFileError::Io`] for file-system failures or
    /// [`KeyFileError::Serialize`] if serialization fails.
    pub fn save(&self, store: &KeyStore) -> Result<(), KeyFileError> {
        let _guard = self.write_lock.lock();

        let contents = KeyFileContents {
            peers: store
                .snapshot()
                .into_iter()
                .map(|(id, key)| PeerEntry {
                    id: id.as_str().to_owned(),
                    key: STANDARD.encode(key.as_bytes()),
                })
                .collect(),
        };
        let text = toml::to_string_pretty(&contents)?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|source| KeyFileError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let io_err = |source: std::io::Error| KeyFileError::Io {
            path: self.path.clone(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(KEY_FILE_MODE))
                .map_err(io_err)?;
        }
        tmp.write_all(text.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// Default key file location: `<platform config dir>/deckpair/keys.toml`.
///
/// # Errors
///
/// [`KeyFileError::NoPlatformConfigDir`] when the base directory cannot be
/// determined from the environment.
pub fn default_key_file_path() -> Result<PathBuf, KeyFileError> {
    platform_config_dir()
        .map(|dir| dir.join("keys.toml"))
        .ok_or(KeyFileError::NoPlatformConfigDir)
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("deckpair"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("deckpair"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("deckpair")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
