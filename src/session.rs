//! Session persistence
//!
//! A session is the ordered list of connection configurations the UI last
//! asked to keep. It is written as one JSON record, replaced atomically: the
//! new record goes to a sibling temp file which is synced and then renamed
//! over the old one, so an interrupted save leaves the previous record intact.

use portmux_shared::{limits, now_ms, ConnectionConfig, ErrorKind};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to read session {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write session {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session record {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode session record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("session record {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PersistError
    }
}

/// On-disk shape of a saved session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: u32,
    pub saved_at_ms: u64,
    pub connections: Vec<ConnectionConfig>,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct SessionStore {
    path: PathBuf,
    /// Serializes saves so renames land in call order
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored session with `connections`
    pub async fn save(&self, connections: &[ConnectionConfig]) -> Result<(), SessionError> {
        let record = SessionRecord {
            version: limits::SESSION_RECORD_VERSION,
            saved_at_ms: now_ms(),
            connections: connections.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(SessionError::Encode)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.write_error(source))?;
        }

        let temp = self.temp_path();
        if let Err(source) = write_synced(&temp, &bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(self.write_error(source));
        }
        if let Err(source) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(self.write_error(source));
        }

        info!(path = %self.path.display(), count = connections.len(), "session saved");
        Ok(())
    }

    /// Stored connections, or an empty list when nothing was ever saved
    pub async fn load(&self) -> Result<Vec<ConnectionConfig>, SessionError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no session record");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(SessionError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let record: SessionRecord =
            serde_json::from_slice(&bytes).map_err(|source| SessionError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if record.version != limits::SESSION_RECORD_VERSION {
            warn!(path = %self.path.display(), version = record.version, "unsupported session version");
            return Err(SessionError::UnsupportedVersion {
                path: self.path.clone(),
                version: record.version,
            });
        }

        Ok(record.connections)
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session".into());
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), n))
    }

    fn write_error(&self, source: std::io::Error) -> SessionError {
        SessionError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}
