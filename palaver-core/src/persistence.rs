//! Dialogue archive: export, import and SQLite storage of NPC dialogue logs.
//!
//! The archive is a mapping from NPC id to [`DialogueRecord`] with no
//! required ordering. It round-trips through JSON for hand-off to other
//! tools and is stored one row per NPC:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS dialogue_records (
//!     npc_id     TEXT PRIMARY KEY,
//!     data       BLOB NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     checksum   TEXT
//! );
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::npc::{DialogueRecord, NpcRegistry};
use crate::types::NpcId;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS dialogue_records (
    npc_id     TEXT PRIMARY KEY,
    data       BLOB NOT NULL,
    updated_at TEXT NOT NULL,
    checksum   TEXT
);";

// ---------------------------------------------------------------------------
// CRC-32
// ---------------------------------------------------------------------------

fn crc32_hex(data: &[u8]) -> String {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ POLY } else { crc >> 1 };
        }
    }
    format!("{:08x}", !crc)
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// Every NPC's identity and dialogue log, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialogueArchive {
    records: BTreeMap<NpcId, DialogueRecord>,
}

impl DialogueArchive {
    /// Empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot every NPC in the registry.
    #[must_use]
    pub fn from_registry(npcs: &NpcRegistry) -> Self {
        Self {
            records: npcs
                .iter()
                .map(|npc| (npc.id.clone(), npc.to_record()))
                .collect(),
        }
    }

    /// Insert or replace a record.
    pub fn insert(&mut self, record: DialogueRecord) {
        self.records.insert(record.id.clone(), record);
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, id: &NpcId) -> Option<&DialogueRecord> {
        self.records.get(id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the archive is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in id order.
    pub fn records(&self) -> impl Iterator<Item = &DialogueRecord> {
        self.records.values()
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    /// `Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from JSON.
    ///
    /// # Errors
    /// `Serialization` on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Restore dialogue logs into NPCs that exist in the registry.
    ///
    /// Identity fields of live NPCs are left alone; only an empty log is
    /// replaced, and only by a non-empty one. Returns how many NPCs were
    /// restored.
    pub fn restore_into(&self, npcs: &mut NpcRegistry) -> usize {
        let mut restored = 0;
        for record in self.records.values() {
            if let Some(npc) = npcs.get_mut(&record.id) {
                if npc.dialogue.is_empty() && !record.dialogue.is_empty() {
                    npc.dialogue.clone_from(&record.dialogue);
                    restored += 1;
                }
            }
        }
        restored
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// SQLite-backed storage for [`DialogueArchive`]s.
pub struct ArchiveStore {
    conn: Connection,
    db_path: PathBuf,
}

impl std::fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl ArchiveStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    /// `Database` on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %db_path.display(), "dialogue archive opened");
        Ok(Self { conn, db_path })
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    /// `Database` on SQLite failures.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Database path, or `:memory:`.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Upsert one record.
    ///
    /// # Errors
    /// `Serialization` or `Database`.
    pub fn save_record(&self, record: &DialogueRecord) -> Result<()> {
        let json = serde_json::to_vec(record)?;
        let checksum = crc32_hex(&json);
        self.conn.execute(
            "INSERT INTO dialogue_records (npc_id, data, updated_at, checksum)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(npc_id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at,
                checksum = excluded.checksum",
            params![record.id.as_str(), json, Utc::now().to_rfc3339(), checksum],
        )?;
        Ok(())
    }

    /// Upsert every record of an archive in one transaction.
    ///
    /// # Errors
    /// `Serialization` or `Database`; nothing is written on failure.
    pub fn save_archive(&mut self, archive: &DialogueArchive) -> Result<()> {
        let start = Instant::now();
        let tx = self.conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for record in archive.records() {
            let json = serde_json::to_vec(record)?;
            let checksum = crc32_hex(&json);
            tx.execute(
                "INSERT INTO dialogue_records (npc_id, data, updated_at, checksum)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(npc_id) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at,
                    checksum = excluded.checksum",
                params![record.id.as_str(), json, now, checksum],
            )?;
        }
        tx.commit()?;
        debug!(
            records = archive.len(),
            elapsed_us = start.elapsed().as_micros(),
            "dialogue archive saved"
        );
        Ok(())
    }

    /// Load one record.
    ///
    /// A checksum mismatch is logged but the data is still returned.
    ///
    /// # Errors
    /// `Serialization` or `Database`.
    pub fn load_record(&self, id: &NpcId) -> Result<Option<DialogueRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT data, checksum FROM dialogue_records WHERE npc_id = ?1")?;
        let row: Option<(Vec<u8>, Option<String>)> = stmt
            .query_row(params![id.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((data, stored)) = row else {
            return Ok(None);
        };
        Self::verify(id.as_str(), &data, stored.as_deref());
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Load every stored record.
    ///
    /// # Errors
    /// `Serialization` or `Database`.
    pub fn load_archive(&self) -> Result<DialogueArchive> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT npc_id, data, checksum FROM dialogue_records")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut archive = DialogueArchive::new();
        for row in rows {
            let (id, data, stored) = row?;
            Self::verify(&id, &data, stored.as_deref());
            archive.insert(serde_json::from_slice(&data)?);
        }
        debug!(records = archive.len(), "dialogue archive loaded");
        Ok(archive)
    }

    /// Delete one record. Returns whether a row was removed.
    ///
    /// # Errors
    /// `Database`.
    pub fn delete_record(&self, id: &NpcId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM dialogue_records WHERE npc_id = ?1", params![id.as_str()])?;
        Ok(deleted > 0)
    }

    /// Number of stored records.
    ///
    /// # Errors
    /// `Database`.
    pub fn record_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM dialogue_records", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Copy the database to `dest` with SQLite's online-backup API.
    ///
    /// # Errors
    /// `Database` on SQLite failures.
    pub fn backup<P: AsRef<Path>>(&self, dest: P) -> Result<()> {
        let mut target = Connection::open(dest.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut target)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(10), None)?;
        info!(dest = %dest.as_ref().display(), "dialogue archive backed up");
        Ok(())
    }

    fn verify(id: &str, data: &[u8], stored: Option<&str>) {
        if let Some(expected) = stored {
            let actual = crc32_hex(data);
            if expected != actual {
                warn!(npc = %id, expected, actual = %actual, "checksum mismatch in dialogue archive");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npc::NpcRecord;

    fn registry() -> NpcRegistry {
        let mut reg = NpcRegistry::new();
        let mut a = NpcRecord::new(
            NpcId::from("npc_1"),
            "NPC 1",
            "brave warrior",
            "A brave warrior",
            vec!["brave".into(), "loyal".into()],
            40.0,
        );
        a.record_line("User: hello");
        a.record_line("NPC 1: \"Well met.\"");
        reg.insert(a);
        reg.insert(NpcRecord::new(
            NpcId::from("npc_2"),
            "NPC 2",
            "wise elder",
            "A wise elder",
            vec![],
            40.0,
        ));
        reg
    }

    #[test]
    fn json_is_a_map_keyed_by_id() {
        let archive = DialogueArchive::from_registry(&registry());
        let json = archive.to_json().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert!(value.get("npc_1").is_some());
        assert_eq!(value["npc_1"]["dialogue"][1], "NPC 1: \"Well met.\"");
        assert_eq!(DialogueArchive::from_json(&json).expect("decode"), archive);
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        assert!(matches!(
            DialogueArchive::from_json("{not json"),
            Err(crate::PalaverError::Serialization(_))
        ));
    }

    #[test]
    fn restore_fills_empty_logs_only() {
        let archive = DialogueArchive::from_registry(&registry());
        let mut fresh = registry();
        fresh
            .get_mut(&NpcId::from("npc_1"))
            .expect("present")
            .dialogue
            .clear();
        assert_eq!(archive.restore_into(&mut fresh), 1);
        assert_eq!(
            fresh.get(&NpcId::from("npc_1")).expect("present").dialogue.len(),
            2
        );
    }

    #[test]
    fn empty_stored_logs_are_not_counted() {
        let mut stored = registry();
        for npc in stored.iter_mut() {
            npc.dialogue.clear();
        }
        let archive = DialogueArchive::from_registry(&stored);
        let mut fresh = stored.clone();
        assert_eq!(archive.restore_into(&mut fresh), 0);
    }

    #[test]
    fn store_round_trip_in_memory() {
        let mut store = ArchiveStore::open_in_memory().expect("open");
        let archive = DialogueArchive::from_registry(&registry());
        store.save_archive(&archive).expect("save");
        assert_eq!(store.record_count().expect("count"), 2);
        assert_eq!(store.load_archive().expect("load"), archive);

        let one = store
            .load_record(&NpcId::from("npc_1"))
            .expect("query")
            .expect("row");
        assert_eq!(one.traits, vec!["brave".to_string(), "loyal".to_string()]);
        assert!(store.delete_record(&NpcId::from("npc_1")).expect("delete"));
        assert!(store.load_record(&NpcId::from("npc_1")).expect("query").is_none());
    }

    #[test]
    fn store_on_disk_and_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dialogue.db");
        {
            let mut store = ArchiveStore::open(&path).expect("open");
            store
                .save_archive(&DialogueArchive::from_registry(&registry()))
                .expect("save");
            store.backup(dir.path().join("dialogue.bak")).expect("backup");
        }
        let reopened = ArchiveStore::open(dir.path().join("dialogue.bak")).expect("reopen");
        assert_eq!(reopened.record_count().expect("count"), 2);
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(crc32_hex(b"123456789"), "cbf43926");
    }
}
