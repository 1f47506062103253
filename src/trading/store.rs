//! Position snapshot persistence
//! Whole-snapshot JSON file, validated record by record on load

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
#[cfg(unix)]
use std::fs::File;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::trading::position::{OrphanedLeg, Position, PositionState};
use crate::trading::TradingError;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    positions: BTreeMap<String, Position>,
}

/// Outcome of reading the snapshot
#[derive(Debug, Default)]
pub struct LoadedSnapshot {
    /// Accepted records; in-flight ones already marked orphaned
    pub positions: Vec<Position>,
    /// Records rejected by validation, staleness or the test flag
    pub dropped: usize,
    /// Snapshot existed but could not be parsed at all
    pub corrupt: bool,
}

/// Durable store for the open-position set
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    /// Create new store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the full position set, replacing the previous snapshot
    pub fn persist<'a>(
        &self,
        positions: impl IntoIterator<Item = &'a Position>,
    ) -> Result<(), TradingError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            positions: positions
                .into_iter()
                .filter(|p| p.state != PositionState::Closed)
                .map(|p| (p.order_ref.clone(), p.clone()))
                .collect(),
        };

        let content = serde_json::to_string_pretty(&snapshot).map_err(|e| {
            TradingError::PersistenceUnavailable {
                message: format!("serialize snapshot: {}", e),
            }
        })?;

        self.write_atomically(&content)
            .map_err(|e| TradingError::PersistenceUnavailable {
                message: format!("{}: {}", self.path.display(), e),
            })
    }

    /// Write to a sibling tmp file, flush it to disk, then rename over the
    /// snapshot. A crash leaves either the old or the new snapshot whole.
    fn write_atomically(&self, content: &str) -> std::io::Result<()> {
        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        // Owner-only (0o600) on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &self.path)?;

        // Make the rename itself durable
        #[cfg(unix)]
        {
            if let Some(parent) = parent {
                if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                    warn!("Could not sync {}: {}", parent.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Read the snapshot.
    ///
    /// Missing or corrupt snapshots yield an empty set; only an unreadable
    /// medium is an error. Records older than `stale_after` are dropped.
    pub fn load(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<LoadedSnapshot, TradingError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No position snapshot at {}, starting fresh", self.path.display());
                return Ok(LoadedSnapshot::default());
            }
            Err(e) => {
                return Err(TradingError::PersistenceUnavailable {
                    message: format!("{}: {}", self.path.display(), e),
                })
            }
        };

        let records = match parse_records(&content) {
            Ok(records) => records,
            Err(err) => {
                warn!("⚠️ Discarding position snapshot {}: {}", self.path.display(), err);
                return Ok(LoadedSnapshot {
                    corrupt: true,
                    ..LoadedSnapshot::default()
                });
            }
        };

        let mut loaded = LoadedSnapshot::default();

        for (key, value) in records {
            match admit_record(&key, value, now, stale_after) {
                Ok(position) => loaded.positions.push(position),
                Err(reason) => {
                    warn!("⚠️ Dropping snapshot record {}: {}", key, reason);
                    loaded.dropped += 1;
                }
            }
        }

        info!(
            "Loaded {} positions from snapshot ({} dropped)",
            loaded.positions.len(),
            loaded.dropped
        );
        Ok(loaded)
    }
}

fn parse_records(content: &str) -> Result<serde_json::Map<String, serde_json::Value>, TradingError> {
    let root: serde_json::Value =
        serde_json::from_str(content).map_err(|e| TradingError::PersistenceCorrupt { message: e.to_string() })?;

    match root.get("positions") {
        Some(serde_json::Value::Object(map)) => Ok(map.clone()),
        _ => Err(TradingError::PersistenceCorrupt {
            message: "missing positions map".to_string(),
        }),
    }
}

fn admit_record(
    key: &str,
    value: serde_json::Value,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<Position, String> {
    let mut position: Position = serde_json::from_value(value).map_err(|e| format!("malformed: {}", e))?;

    if position.order_ref != key {
        return Err(format!("key does not match order ref {}", position.order_ref));
    }
    position.validate().map_err(|e| e.to_string())?;

    if position.test {
        return Err("test record".to_string());
    }
    if now.signed_duration_since(position.entry_time) > stale_after {
        return Err(format!("stale (entered {})", position.entry_time.to_rfc3339()));
    }

    position.state = match position.state {
        PositionState::AwaitingEntryFill => PositionState::Orphaned(OrphanedLeg::Entry),
        PositionState::AwaitingExitFill => PositionState::Orphaned(OrphanedLeg::Exit),
        other => other,
    };

    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Instrument, Side};
    use crate::trading::position::NewPosition;
    use pretty_assertions::assert_eq;

    fn pending(order_ref: &str) -> Position {
        Position::awaiting_entry(NewPosition {
            order_ref: order_ref.to_string(),
            instrument: Instrument::new("NSE", "2885", "RELIANCE-EQ"),
            side: Side::Long,
            quantity: 10,
            reference_price: 2500.0,
            stop_loss_pct: 0.5,
            target_pct: 1.0,
        })
        .unwrap()
    }

    fn store_in(dir: &tempfile::TempDir) -> PositionStore {
        PositionStore::new(dir.path().join("active_trades.json"))
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = store_in(&dir).load(Utc::now(), Duration::hours(24)).unwrap();
        assert!(loaded.positions.is_empty());
        assert!(!loaded.corrupt);
    }

    #[test]
    fn test_corrupt_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{ not json").unwrap();

        let loaded = store.load(Utc::now(), Duration::hours(24)).unwrap();
        assert!(loaded.corrupt);
        assert!(loaded.positions.is_empty());
    }

    #[test]
    fn test_open_roundtrip_and_pending_orphaned() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut open = pending("A1");
        open.fill_entry(2500.0, Utc::now()).unwrap();
        let waiting = pending("B2");

        store.persist([&open, &waiting]).unwrap();
        let loaded = store.load(Utc::now(), Duration::hours(24)).unwrap();

        assert_eq!(loaded.positions.len(), 2);
        assert_eq!(loaded.positions[0], open);
        assert_eq!(loaded.positions[1].state, PositionState::Orphaned(OrphanedLeg::Entry));
    }

    #[test]
    fn test_rewrite_replaces_whole_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.persist([&pending("A1"), &pending("B2"), &pending("C3")]).unwrap();
        store.persist([&pending("A1")]).unwrap();

        assert!(!store.path().with_extension("json.tmp").exists());
        let loaded = store.load(Utc::now(), Duration::hours(24)).unwrap();
        assert!(!loaded.corrupt);
        assert_eq!(loaded.positions.len(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_bad_records_dropped_individually() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut test_record = pending("T1");
        test_record.test = true;
        let mut stale = pending("S1");
        stale.entry_time = Utc::now() - Duration::hours(30);
        store.persist([&pending("OK1"), &test_record, &stale]).unwrap();

        // Splice in a record with a wrong-typed field
        let mut root: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        root["positions"]["BAD"] = serde_json::json!({ "order_ref": "BAD", "quantity": "ten" });
        std::fs::write(store.path(), root.to_string()).unwrap();

        let loaded = store.load(Utc::now(), Duration::hours(24)).unwrap();
        assert_eq!(loaded.dropped, 3);
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.positions[0].order_ref, "OK1");
    }
}
