//! Run Ledger
//!
//! Durable record of step status transitions, enabling resume after an
//! interrupted or partially failed run.
//!
//! The ledger is a JSON Lines file with one [`LedgerEntry`] per
//! transition. Every write is flushed and synced before returning, so a
//! crash leaves the file consistent with the last completed transition.
//! On reload the last entry for each id wins.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

use super::model::{StepId, StepRecord, StepStatus};

/// One recorded status transition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LedgerEntry {
    pub id: StepId,
    pub name: String,
    pub status: StepStatus,

    /// Artifacts the step declared
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,

    /// For `Done` entries: whether every artifact existed at completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_verified: Option<bool>,

    /// Failure reason or other diagnostic text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    /// Builds an entry describing `record` moving to `status`.
    pub fn for_record(record: &StepRecord, status: StepStatus) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            status,
            artifacts: record.expected_artifacts.clone(),
            artifacts_verified: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_verified(mut self, verified: bool) -> Self {
        self.artifacts_verified = Some(verified);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug)]
enum Backing {
    File(PathBuf),
    Memory(Vec<LedgerEntry>),
}

/// Append-only store of step transitions.
#[derive(Debug)]
pub struct RunLedger {
    backing: Backing,
}

impl RunLedger {
    /// Opens (or prepares to create) a ledger file.
    ///
    /// The parent directory is created if needed; the file itself is
    /// created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        info!("Using run ledger {}", path.display());
        Ok(Self {
            backing: Backing::File(path),
        })
    }

    /// A ledger that only lives for the lifetime of this value.
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory(Vec::new()),
        }
    }

    /// Returns the ledger file path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    /// Appends one entry and makes it durable before returning.
    pub fn record_transition(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        debug!("Ledger: step {} '{}' -> {}", entry.id, entry.name, entry.status);
        match &mut self.backing {
            Backing::Memory(entries) => {
                entries.push(entry);
                Ok(())
            }
            Backing::File(path) => {
                let mut line = serde_json::to_string(&entry)?;
                line.push('\n');

                let io_err = |source: std::io::Error| LedgerError::Io {
                    path: path.clone(),
                    source,
                };
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&*path)
                    .map_err(io_err)?;
                file.write_all(line.as_bytes()).map_err(io_err)?;
                file.flush().map_err(io_err)?;
                file.sync_data().map_err(io_err)
            }
        }
    }

    /// Returns every entry in write order.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        match &self.backing {
            Backing::Memory(entries) => Ok(entries.clone()),
            Backing::File(path) => read_entries(path),
        }
    }

    /// Returns the last recorded entry for each step id.
    ///
    /// A missing ledger file means there was no prior run.
    pub fn load_prior_run(&self) -> Result<BTreeMap<StepId, LedgerEntry>, LedgerError> {
        let mut latest = BTreeMap::new();
        for entry in self.entries()? {
            latest.insert(entry.id, entry);
        }
        if !latest.is_empty() {
            info!("Loaded prior run: {} steps recorded", latest.len());
        }
        Ok(latest)
    }

    /// Checks whether a previously completed step can be trusted as is.
    pub fn verify_artifacts_still_present(record: &StepRecord, base: Option<&Path>) -> bool {
        let missing = record.missing_artifacts(base);
        for path in &missing {
            info!(
                "Step {} '{}': artifact {} is gone",
                record.id,
                record.name,
                path.display()
            );
        }
        missing.is_empty()
    }

    /// Removes all recorded history.
    pub fn clear(&mut self) -> Result<(), LedgerError> {
        match &mut self.backing {
            Backing::Memory(entries) => entries.clear(),
            Backing::File(path) => {
                if path.exists() {
                    fs::remove_file(&*path).map_err(|source| LedgerError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    info!("Deleted ledger: {}", path.display());
                }
            }
        }
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LedgerError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let lines: Vec<&str> = content.lines().collect();
    let mut entries = Vec::with_capacity(lines.len());

    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => entries.push(entry),
            // A torn final line is what a crash mid-write leaves behind.
            Err(e) if index + 1 == lines.len() && !content.ends_with('\n') => {
                warn!(
                    "Ignoring incomplete last line of ledger {}: {}",
                    path.display(),
                    e
                );
            }
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    path: path.to_path_buf(),
                    line: index + 1,
                    reason: e.to_string(),
                })
            }
        }
    }

    Ok(entries)
}
