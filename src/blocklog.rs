//! Per-hostname accounting of allowed and blocked queries.
//!
//! The log is diagnostic, not authoritative: a corrupt or missing file
//! yields an empty log, and write failures are reported but never stop the
//! tunnel. Every operation takes the map lock for its whole duration, so
//! `save`/`clear` from another thread serialize against `new_connection`
//! calls made by the worker.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PersistError;

/// Attempt statistics for one hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedConnection {
    pub hostname: String,
    pub allowed: bool,
    pub attempts: u64,
    pub last_attempt: SystemTime,
}

impl LoggedConnection {
    fn first(hostname: &str, allowed: bool, at: SystemTime) -> Self {
        Self {
            hostname: hostname.to_string(),
            allowed,
            attempts: 1,
            last_attempt: at,
        }
    }
}

/// On-disk layout of the block log.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BlockLogDocument {
    #[serde(default)]
    connections: Vec<LoggedConnection>,
}

/// Shared handle to the block log.
///
/// Cloning is cheap; all clones see the same map.
#[derive(Debug, Clone, Default)]
pub struct BlockLogger {
    connections: Arc<Mutex<HashMap<String, LoggedConnection>>>,
    path: Option<Arc<PathBuf>>,
}

impl BlockLogger {
    /// Create an empty, memory-only logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the logger persisted at `path`.
    ///
    /// Falls back to an empty log when the file is absent or unreadable;
    /// later saves go to the same path.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let connections = match read_document(&path) {
            Ok(document) => document
                .connections
                .into_iter()
                .map(|entry| (entry.hostname.clone(), entry))
                .collect(),
            Err(PersistError::Read(err)) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No block log at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(err) => {
                warn!("Discarding block log at {}: {err}", path.display());
                HashMap::new()
            }
        };

        Self {
            connections: Arc::new(Mutex::new(connections)),
            path: Some(Arc::new(path)),
        }
    }

    /// Record one query for `hostname`.
    pub fn new_connection(&self, hostname: &str, allowed: bool) {
        self.new_connection_at(hostname, allowed, SystemTime::now());
    }

    /// Record one query for `hostname` observed at `at`.
    ///
    /// A verdict different from the recorded one replaces the entry, so the
    /// count always refers to the current verdict.
    pub fn new_connection_at(&self, hostname: &str, allowed: bool, at: SystemTime) {
        let mut connections = self.connections.lock();
        match connections.get_mut(hostname) {
            Some(entry) if entry.allowed == allowed => {
                entry.attempts = entry.attempts.saturating_add(1);
                entry.last_attempt = at;
            }
            _ => {
                connections.insert(
                    hostname.to_string(),
                    LoggedConnection::first(hostname, allowed, at),
                );
            }
        }
    }

    /// Current entry for `hostname`, if any.
    pub fn get(&self, hostname: &str) -> Option<LoggedConnection> {
        self.connections.lock().get(hostname).cloned()
    }

    /// All entries, sorted by hostname.
    pub fn snapshot(&self) -> Vec<LoggedConnection> {
        let mut entries: Vec<_> = self.connections.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        entries
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Persist the whole map. No-op for a memory-only logger.
    pub fn save(&self) -> Result<(), PersistError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let connections = self.connections.lock();
        let mut document = BlockLogDocument {
            connections: connections.values().cloned().collect(),
        };
        document
            .connections
            .sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let encoded = toml::to_string(&document).map_err(PersistError::Encode)?;

        // Readers never observe a partially written log.
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, encoded).map_err(PersistError::Write)?;
        std::fs::rename(&staging, path).map_err(PersistError::Write)?;

        debug!(
            "Saved {} block log entries to {}",
            document.connections.len(),
            path.display()
        );
        Ok(())
    }

    /// Forget every entry and remove the persisted file.
    pub fn clear(&self) {
        let mut connections = self.connections.lock();
        connections.clear();

        if let Some(path) = self.path.as_deref() {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed block log at {}", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove block log at {}: {err}", path.display()),
            }
        }
    }
}

fn read_document(path: &Path) -> Result<BlockLogDocument, PersistError> {
    let content = std::fs::read_to_string(path).map_err(PersistError::Read)?;
    toml::from_str(&content).map_err(PersistError::Decode)
}
