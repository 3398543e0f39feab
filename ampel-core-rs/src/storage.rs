//! Durable storage for frontier snapshots and the audit trail.
//!
//! Layout per node under the data directory:
//! - `frontier.json` - latest frontier, replaced atomically (temp + rename)
//! - `audit.log` - append-only JSON lines, one [`AuditEntry`] each
//!
//! Recovery loads the snapshot and then joins the frontier knowledge of every
//! audit record. Join is idempotent, so replaying records already covered by
//! the snapshot is harmless, and a lost snapshot write is repaired from the
//! log.

use crate::error::StorageError;
use crate::frontier::Frontier;
use crate::phase::AuditEntry;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Persistence collaborator of the coordinator
pub trait DurableStore: Send {
    /// Last known frontier of `node_id`, `None` on a cold start
    fn load_frontier(&mut self, node_id: &str) -> Result<Option<Frontier>, StorageError>;

    fn save_frontier(&mut self, node_id: &str, frontier: &Frontier) -> Result<(), StorageError>;

    fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StorageError>;
}

impl<S: DurableStore + ?Sized> DurableStore for Box<S> {
    fn load_frontier(&mut self, node_id: &str) -> Result<Option<Frontier>, StorageError> {
        (**self).load_frontier(node_id)
    }

    fn save_frontier(&mut self, node_id: &str, frontier: &Frontier) -> Result<(), StorageError> {
        (**self).save_frontier(node_id, frontier)
    }

    fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StorageError> {
        (**self).append_audit(entry)
    }
}

/// File storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base directory; each node gets its own subdirectory
    pub dir: PathBuf,
    /// Flush the audit log after every append
    pub fsync_on_write: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./ampel-data"),
            fsync_on_write: true,
        }
    }
}

/// File-backed durable store owned by one node
pub struct FileStore {
    config: StorageConfig,
    /// Node whose audit trail this store appends to
    owner: String,
    audit: Option<BufWriter<File>>,
}

impl FileStore {
    pub fn new(config: StorageConfig, owner: impl Into<String>) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.dir).map_err(|e| StorageError::io(&config.dir, e))?;
        Ok(Self {
            config,
            owner: owner.into(),
            audit: None,
        })
    }

    fn node_dir(&self, node_id: &str) -> PathBuf {
        self.config.dir.join(node_id)
    }

    fn snapshot_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join("frontier.json")
    }

    fn audit_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join("audit.log")
    }

    fn ensure_node_dir(&self, node_id: &str) -> Result<PathBuf, StorageError> {
        let dir = self.node_dir(node_id);
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(dir)
    }

    fn read_snapshot(&self, node_id: &str) -> Result<Option<Frontier>, StorageError> {
        let path = self.snapshot_path(node_id);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        match serde_json::from_str::<Frontier>(&data) {
            Ok(frontier) => {
                info!("Storage: Loaded snapshot {:?}", path);
                Ok(Some(frontier))
            }
            Err(e) => {
                warn!("Storage: Failed to parse snapshot {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    fn replay_audit(&self, node_id: &str) -> Result<Option<Frontier>, StorageError> {
        let path = self.audit_path(node_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        let mut recovered = Frontier::new();
        let mut replayed = 0usize;
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("Storage: Audit read error at line {}: {}", line_num + 1, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => {
                    if let Some(hint) = entry.frontier_hint() {
                        recovered.merge(&hint);
                    }
                    replayed += 1;
                }
                Err(e) => warn!("Storage: Audit parse error at line {}: {}", line_num + 1, e),
            }
        }

        info!("Storage: Replayed {} audit entries for {}", replayed, node_id);
        Ok(Some(recovered))
    }

    fn open_audit(&mut self) -> Result<&mut BufWriter<File>, StorageError> {
        if self.audit.is_none() {
            self.ensure_node_dir(&self.owner)?;
            let path = self.audit_path(&self.owner);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;
            debug!("Storage: Opened audit log at {:?}", path);
            self.audit = Some(BufWriter::new(file));
        }

        self.audit.as_mut().ok_or_else(|| {
            StorageError::io(
                PathBuf::from("audit.log"),
                std::io::Error::new(ErrorKind::NotConnected, "audit log not open"),
            )
        })
    }
}

impl DurableStore for FileStore {
    fn load_frontier(&mut self, node_id: &str) -> Result<Option<Frontier>, StorageError> {
        let snapshot = self.read_snapshot(node_id)?;
        let replayed = self.replay_audit(node_id)?;

        Ok(match (snapshot, replayed) {
            (Some(snapshot), Some(replayed)) => Some(snapshot.join(&replayed)),
            (snapshot, replayed) => snapshot.or(replayed),
        })
    }

    fn save_frontier(&mut self, node_id: &str, frontier: &Frontier) -> Result<(), StorageError> {
        let dir = self.ensure_node_dir(node_id)?;
        let path = dir.join("frontier.json");
        let temp_path = dir.join("frontier.json.tmp");

        let data = serde_json::to_string_pretty(frontier)?;
        fs::write(&temp_path, data).map_err(|e| StorageError::io(&temp_path, e))?;
        fs::rename(&temp_path, &path).map_err(|e| StorageError::io(&path, e))?;

        debug!("Storage: Saved frontier for {} ({} entries)", node_id, frontier.len());
        Ok(())
    }

    fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StorageError> {
        let data = serde_json::to_string(entry)?;
        let fsync = self.config.fsync_on_write;
        let path = self.audit_path(&self.owner);
        let writer = self.open_audit()?;

        writeln!(writer, "{}", data).map_err(|e| StorageError::io(&path, e))?;
        if fsync {
            writer.flush().map_err(|e| StorageError::io(&path, e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    frontiers: HashMap<String, Frontier>,
    audit: Vec<AuditEntry>,
}

/// In-memory store for tests and the simulation harness. Keeps the whole
/// audit trail.
///
/// Clones share the same contents, so a "restarted" coordinator built on a
/// clone sees what its predecessor saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saved frontier of a node, if any
    pub fn frontier(&self, node_id: &str) -> Option<Frontier> {
        self.state.lock().frontiers.get(node_id).cloned()
    }

    /// Copy of the audit trail
    pub fn audit(&self) -> Vec<AuditEntry> {
        self.state.lock().audit.clone()
    }
}

impl DurableStore for MemoryStore {
    fn load_frontier(&mut self, node_id: &str) -> Result<Option<Frontier>, StorageError> {
        Ok(self.frontier(node_id))
    }

    fn save_frontier(&mut self, node_id: &str, frontier: &Frontier) -> Result<(), StorageError> {
        self.state
            .lock()
            .frontiers
            .insert(node_id.to_string(), frontier.clone());
        Ok(())
    }

    fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StorageError> {
        self.state.lock().audit.push(entry.clone());
        Ok(())
    }
}

/// Audit records an [`EphemeralStore`] keeps by default
pub const EPHEMERAL_AUDIT_CAPACITY: usize = 256;

/// Store for nodes running without persistence.
///
/// Frontiers live as long as the process. Only the most recent audit records
/// are kept, so a node left in a priority state for days does not grow.
#[derive(Debug)]
pub struct EphemeralStore {
    frontiers: HashMap<String, Frontier>,
    recent: VecDeque<AuditEntry>,
    capacity: usize,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::with_capacity(EPHEMERAL_AUDIT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frontiers: HashMap::new(),
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Most recent audit records, oldest first
    pub fn recent_audit(&self) -> impl Iterator<Item = &AuditEntry> {
        self.recent.iter()
    }
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for EphemeralStore {
    fn load_frontier(&mut self, node_id: &str) -> Result<Option<Frontier>, StorageError> {
        Ok(self.frontiers.get(node_id).cloned())
    }

    fn save_frontier(&mut self, node_id: &str, frontier: &Frontier) -> Result<(), StorageError> {
        self.frontiers.insert(node_id.to_string(), frontier.clone());
        Ok(())
    }

    fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StorageError> {
        if self.capacity == 0 {
            return Ok(());
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ModeKind;
    use crate::phase::{PhaseDriver, RenderCause};
    use crate::types::Phase;
    use tempfile::tempdir;

    fn frontier(entries: &[(&str, u64)]) -> Frontier {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_memory_store_shared_between_clones() {
        let mut store = MemoryStore::new();
        let reader = store.clone();

        store.save_frontier("A", &frontier(&[("A", 3)])).unwrap();
        assert_eq!(reader.frontier("A"), Some(frontier(&[("A", 3)])));
        assert_eq!(reader.frontier("B"), None);
    }

    #[test]
    fn test_file_store_roundtrip() -> Result<(), StorageError> {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            dir: dir.path().to_path_buf(),
            fsync_on_write: false,
        };

        {
            let mut store = FileStore::new(config.clone(), "A")?;
            assert_eq!(store.load_frontier("A")?, None);
            store.save_frontier("A", &frontier(&[("A", 6), ("B", 6)]))?;
        }

        {
            let mut store = FileStore::new(config, "A")?;
            assert_eq!(store.load_frontier("A")?, Some(frontier(&[("A", 6), ("B", 6)])));
        }

        Ok(())
    }

    #[test]
    fn test_audit_replay_repairs_lost_snapshot() -> Result<(), StorageError> {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            dir: dir.path().to_path_buf(),
            fsync_on_write: true,
        };

        {
            let mut store = FileStore::new(config.clone(), "A")?;
            store.save_frontier("A", &frontier(&[("A", 2), ("B", 2)]))?;

            let record = PhaseDriver::render("A", ModeKind::Normal, 3, Phase::MainGreen, RenderCause::Switch);
            store.append_audit(&AuditEntry::phase(record))?;
            store.append_audit(&AuditEntry::merge("C", frontier(&[("C", 4)]), true))?;
        }

        // Snapshot write for counter 3 never happened
        let mut store = FileStore::new(config, "A")?;
        let recovered = store.load_frontier("A")?.unwrap();
        assert_eq!(recovered, frontier(&[("A", 3), ("B", 2), ("C", 4)]));
        Ok(())
    }

    #[test]
    fn test_corrupt_audit_lines_skipped() -> Result<(), StorageError> {
        let dir = tempdir().unwrap();
        let node_dir = dir.path().join("A");
        fs::create_dir_all(&node_dir).unwrap();

        let record = PhaseDriver::render("A", ModeKind::Normal, 5, Phase::MainGreen, RenderCause::Switch);
        let good = serde_json::to_string(&AuditEntry::phase(record)).unwrap();
        fs::write(node_dir.join("audit.log"), format!("garbage\n\n{}\n", good)).unwrap();
        fs::write(node_dir.join("frontier.json"), "{ not json").unwrap();

        let mut store = FileStore::new(
            StorageConfig {
                dir: dir.path().to_path_buf(),
                fsync_on_write: false,
            },
            "A",
        )?;
        assert_eq!(store.load_frontier("A")?, Some(frontier(&[("A", 5)])));
        Ok(())
    }

    #[test]
    fn test_ephemeral_store_bounds_audit() {
        let mut store = EphemeralStore::with_capacity(16);
        assert_eq!(store.load_frontier("A").unwrap(), None);

        // An hour of all-red refreshes
        for _ in 0..3600 {
            let record = PhaseDriver::render("A", ModeKind::Emergency, 1, Phase::AllRed, RenderCause::Refresh);
            store.append_audit(&AuditEntry::phase(record)).unwrap();
        }
        let merge = AuditEntry::merge("B", frontier(&[("B", 2)]), true);
        store.append_audit(&merge).unwrap();

        assert_eq!(store.recent_audit().count(), 16);
        assert_eq!(store.recent_audit().last(), Some(&merge));

        store.save_frontier("A", &frontier(&[("A", 1), ("B", 2)])).unwrap();
        assert_eq!(store.load_frontier("A").unwrap(), Some(frontier(&[("A", 1), ("B", 2)])));
    }
}
