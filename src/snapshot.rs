// ============================================================================
// SNAPSHOT & DURABLE STORE
// ============================================================================
// The immutable result of one refresh, and the JSON file it is mirrored to.
// The file is replaced atomically: temp file, fsync, rename.
// ============================================================================

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::types::{EntityDomain, EntityRecord};

/// Aggregates computed once when a snapshot is assembled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub total_entities: usize,
    pub entities_with_data: usize,
    pub per_domain: BTreeMap<EntityDomain, usize>,
    /// Entities not collected before the refresh deadline
    #[serde(default)]
    pub entities_pending: usize,
    /// Metric queries that failed during the refresh
    #[serde(default)]
    pub queries_failed: u64,
}

/// Published view of all entities. Never mutated after assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    pub summary: SnapshotSummary,
    pub records: Vec<EntityRecord>,
}

impl Snapshot {
    pub fn assemble(records: Vec<EntityRecord>, entities_pending: usize, queries_failed: u64) -> Self {
        let mut per_domain = BTreeMap::new();
        for record in &records {
            *per_domain.entry(record.entity.domain).or_insert(0) += 1;
        }
        let summary = SnapshotSummary {
            total_entities: records.len(),
            entities_with_data: records.iter().filter(|r| r.verdict.has_real_data).count(),
            per_domain,
            entities_pending,
            queries_failed,
        };
        Self {
            generated_at: Utc::now(),
            summary,
            records,
        }
    }

    pub fn record(&self, guid: &str) -> Option<&EntityRecord> {
        self.records.iter().find(|r| r.entity.guid == guid)
    }

    pub fn with_real_data(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.iter().filter(|r| r.verdict.has_real_data)
    }
}

// ----------------------------------------------------------------------------
// Durable Store
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Read the last persisted snapshot. `Ok(None)` when no file exists yet.
    pub fn load(&self) -> StorageResult<Option<Snapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::ReadFailed {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::DataCorruption {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

        info!(
            target: "cerebro::cache",
            path = %self.path.display(),
            entities = snapshot.summary.total_entities,
            generated_at = %snapshot.generated_at,
            "Loaded snapshot from disk"
        );
        Ok(Some(snapshot))
    }

    /// Replace the file with `snapshot`. A failure leaves the previous file intact.
    pub fn persist(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| StorageError::SerializationFailed {
            message: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StorageError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let temp = self.temp_path();
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(&json)?;
            file.sync_all()
        };
        if let Err(source) = write() {
            let _ = fs::remove_file(&temp);
            return Err(StorageError::WriteFailed { path: temp, source });
        }

        fs::rename(&temp, &self.path).map_err(|source| StorageError::WriteFailed {
            path: self.path.clone(),
            source,
        })?;

        debug!(
            target: "cerebro::cache",
            path = %self.path.display(),
            bytes = json.len(),
            "Snapshot persisted"
        );
        Ok(())
    }
}
