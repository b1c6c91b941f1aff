//! SQLite database operations for session persistence

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::{FileSystemType, RecoverySession, ScanMode, SessionMetadata};

/// SQLite database for storing recovery sessions
pub struct SessionDatabase {
    conn: Connection,
    db_path: PathBuf,
}

/// Lightweight session summary for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub fs_type: FileSystemType,
    pub mode: ScanMode,
    pub device_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub files_found: u32,
    pub recoverable_files: u32,
    pub device_size: u64,
    pub scan_duration_ms: u64,
    pub cancelled: bool,
}

const SUMMARY_COLUMNS: &str = "id, fs_type, scan_mode, device_path, created_at, \
     files_found, recoverable_files, device_size, scan_duration_ms, cancelled";

/// Summary columns as read straight from a row, before validation
type SummaryRow = (String, String, String, String, String, u32, u32, i64, i64, bool);

fn read_summary_row(row: &Row<'_>) -> rusqlite::Result<SummaryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .context("Invalid timestamp in database")?
        .with_timezone(&Utc))
}

fn parse_summary(row: SummaryRow) -> Result<SessionSummary> {
    let (id, fs_type, mode, device_path, created_at, files_found, recoverable_files, device_size, duration, cancelled) =
        row;
    Ok(SessionSummary {
        id: Uuid::parse_str(&id).context("Invalid UUID in database")?,
        fs_type: fs_type.parse().map_err(anyhow::Error::msg)?,
        mode: mode.parse().map_err(anyhow::Error::msg)?,
        device_path: PathBuf::from(device_path),
        created_at: parse_timestamp(&created_at)?,
        files_found,
        recoverable_files,
        device_size: device_size as u64,
        scan_duration_ms: duration as u64,
        cancelled,
    })
}

impl SessionDatabase {
    /// Open or create a session database at the specified path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

        let db = Self { conn, db_path };
        db.initialize_schema()?;

        Ok(db)
    }

    /// Default database path (~/.revenant/sessions.db)
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".revenant").join("sessions.db"))
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                fs_type TEXT NOT NULL,
                scan_mode TEXT NOT NULL,
                device_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                device_size INTEGER NOT NULL,
                partition_offset INTEGER NOT NULL,
                filesystem_size INTEGER NOT NULL,
                cluster_size INTEGER NOT NULL,
                scan_duration_ms INTEGER NOT NULL,
                files_found INTEGER NOT NULL,
                recoverable_files INTEGER NOT NULL,
                skipped_units INTEGER NOT NULL,
                cancelled INTEGER NOT NULL,
                entries_json TEXT NOT NULL,
                bad_sectors_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_created_at
                ON sessions(created_at DESC);

            CREATE INDEX IF NOT EXISTS idx_sessions_fs_type
                ON sessions(fs_type);

            CREATE INDEX IF NOT EXISTS idx_sessions_device
                ON sessions(device_path);
            "#,
            )
            .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Save a recovery session, replacing any earlier copy with the same id
    pub fn save_session(&self, session: &RecoverySession) -> Result<()> {
        let entries_json = serde_json::to_string(&session.entries).context("Failed to serialize entries")?;
        let bad_sectors_json =
            serde_json::to_string(&session.bad_sectors).context("Failed to serialize bad sectors")?;
        let meta = &session.metadata;

        self.conn
            .execute(
                r#"
            INSERT OR REPLACE INTO sessions (
                id, fs_type, scan_mode, device_path, created_at,
                device_size, partition_offset, filesystem_size, cluster_size,
                scan_duration_ms, files_found, recoverable_files,
                skipped_units, cancelled, entries_json, bad_sectors_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
                params![
                    session.id.to_string(),
                    session.fs_type.as_str(),
                    session.mode.to_string(),
                    session.device_path.display().to_string(),
                    session.created_at.to_rfc3339(),
                    meta.device_size as i64,
                    meta.partition_offset as i64,
                    meta.filesystem_size as i64,
                    meta.cluster_size,
                    meta.scan_duration_ms as i64,
                    meta.files_found,
                    meta.recoverable_files,
                    session.skipped_units as i64,
                    session.cancelled,
                    entries_json,
                    bad_sectors_json,
                ],
            )
            .context("Failed to save session to database")?;

        tracing::info!("Saved session {} to database", session.id);
        Ok(())
    }

    /// Load a session by ID (supports full UUID or short prefix)
    pub fn load_session(&self, id: &str) -> Result<RecoverySession> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT
                id, fs_type, scan_mode, device_path, created_at,
                device_size, partition_offset, filesystem_size, cluster_size,
                scan_duration_ms, files_found, recoverable_files,
                skipped_units, cancelled, entries_json, bad_sectors_json
            FROM sessions
            WHERE id = ?1 OR id LIKE ?2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )?;

        let (head, sizes, counts, entries_json, bad_sectors_json) = stmt
            .query_row(params![id, format!("{}%", id)], |row| {
                let head: (String, String, String, String, String) =
                    (row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?);
                let sizes: (i64, i64, i64, u32, i64) =
                    (row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?);
                let counts: (u32, u32, i64, bool) = (row.get(10)?, row.get(11)?, row.get(12)?, row.get(13)?);
                let entries_json: String = row.get(14)?;
                let bad_sectors_json: String = row.get(15)?;
                Ok((head, sizes, counts, entries_json, bad_sectors_json))
            })
            .optional()
            .context("Failed to query session from database")?
            .with_context(|| format!("Session not found: {}", id))?;

        let (id_str, fs_type, mode, device_path, created_at) = head;
        let (device_size, partition_offset, filesystem_size, cluster_size, scan_duration_ms) = sizes;
        let (files_found, recoverable_files, skipped_units, cancelled) = counts;

        Ok(RecoverySession {
            id: Uuid::parse_str(&id_str).context("Invalid UUID in database")?,
            fs_type: fs_type.parse().map_err(anyhow::Error::msg)?,
            device_path: PathBuf::from(device_path),
            created_at: parse_timestamp(&created_at)?,
            mode: mode.parse().map_err(anyhow::Error::msg)?,
            entries: serde_json::from_str(&entries_json).context("Failed to deserialize entries")?,
            bad_sectors: serde_json::from_str(&bad_sectors_json).context("Failed to deserialize bad sectors")?,
            skipped_units: skipped_units as u64,
            cancelled,
            metadata: SessionMetadata {
                device_size: device_size as u64,
                partition_offset: partition_offset as u64,
                filesystem_size: filesystem_size as u64,
                cluster_size,
                scan_duration_ms: scan_duration_ms as u64,
                files_found,
                recoverable_files,
            },
        })
    }

    fn query_summaries(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<SessionSummary>> {
        let sql = format!(
            "SELECT {} FROM sessions {} ORDER BY created_at DESC",
            SUMMARY_COLUMNS, filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, read_summary_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query sessions")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.0.clone();
            match parse_summary(row) {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::warn!("Skipping unreadable session row {}: {:#}", id, e),
            }
        }
        Ok(summaries)
    }

    /// List all sessions, newest first
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.query_summaries("", &[])
    }

    /// List sessions filtered by filesystem type
    pub fn list_sessions_by_fs(&self, fs_type: FileSystemType) -> Result<Vec<SessionSummary>> {
        self.query_summaries("WHERE fs_type = ?1", &[&fs_type.as_str()])
    }

    /// List sessions for a device path
    pub fn list_sessions_by_device(&self, device: &str) -> Result<Vec<SessionSummary>> {
        self.query_summaries("WHERE device_path = ?1", &[&device])
    }

    /// Delete a session by ID (supports full UUID or short prefix)
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let rows_affected = self.conn.execute(
            "DELETE FROM sessions WHERE id = ?1 OR id LIKE ?2",
            params![id, format!("{}%", id)],
        )?;

        if rows_affected == 0 {
            anyhow::bail!("Session not found: {}", id);
        }

        tracing::info!("Deleted {} session(s) matching: {}", rows_affected, id);
        Ok(())
    }

    /// Delete sessions older than `days` days
    pub fn cleanup_old_sessions(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let rows_affected = self.conn.execute(
            "DELETE FROM sessions WHERE created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        tracing::info!("Cleaned up {} sessions older than {} days", rows_affected, days);
        Ok(rows_affected)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BadSectorInfo, DeletedFileEntry, EntrySource, FileEntry, RecoveryStatus};
    use tempfile::TempDir;

    fn entry(id: u64) -> DeletedFileEntry {
        DeletedFileEntry {
            id,
            file: FileEntry {
                name: format!("file{}.jpg", id),
                path: format!("/photos/file{}.jpg", id),
                size: 8192,
                ..Default::default()
            },
            is_deleted: true,
            recovery_status: RecoveryStatus::Recoverable,
            recovery_probability: 0.9,
            fragmented_clusters: vec![100, 101],
            sparse_gaps: Vec::new(),
            resident_data: None,
            signature_type: Some("JPEG".into()),
            source: EntrySource::Metadata { record_number: 40 + id },
            run_count: 1,
        }
    }

    fn session(fs_type: FileSystemType, device: &str) -> RecoverySession {
        RecoverySession {
            id: Uuid::new_v4(),
            fs_type,
            device_path: PathBuf::from(device),
            created_at: Utc::now(),
            mode: ScanMode::Combined,
            entries: vec![entry(1), entry(2)],
            bad_sectors: vec![BadSectorInfo::unreadable(4096 * 12, 4096, 12, 3)],
            skipped_units: 1,
            cancelled: false,
            metadata: SessionMetadata {
                device_size: 1 << 20,
                partition_offset: 0,
                filesystem_size: 1 << 20,
                cluster_size: 4096,
                scan_duration_ms: 120,
                files_found: 2,
                recoverable_files: 2,
            },
        }
    }

    fn open_temp() -> (TempDir, SessionDatabase) {
        let dir = TempDir::new().unwrap();
        let db = SessionDatabase::open(dir.path().join("nested").join("sessions.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_save_and_load_session() {
        let (_dir, db) = open_temp();
        let original = session(FileSystemType::Ntfs, "/images/disk.img");
        db.save_session(&original).unwrap();

        let loaded = db.load_session(&original.id.to_string()).unwrap();
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.fs_type, FileSystemType::Ntfs);
        assert_eq!(loaded.mode, ScanMode::Combined);
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[1].file.path, "/photos/file2.jpg");
        assert_eq!(loaded.entries[0].fragmented_clusters, vec![100, 101]);
        assert_eq!(loaded.bad_sectors, original.bad_sectors);
        assert_eq!(loaded.skipped_units, 1);
        assert_eq!(loaded.metadata.cluster_size, 4096);
    }

    #[test]
    fn test_load_by_short_id() {
        let (_dir, db) = open_temp();
        let original = session(FileSystemType::Fat, "/dev/sdb1");
        db.save_session(&original).unwrap();

        let short = &original.id.to_string()[..8];
        assert_eq!(db.load_session(short).unwrap().id, original.id);
        assert!(db.load_session("ffffffff-none").is_err());
    }

    #[test]
    fn test_save_replaces_existing() {
        let (_dir, db) = open_temp();
        let mut original = session(FileSystemType::Raw, "/images/card.img");
        db.save_session(&original).unwrap();
        original.entries.truncate(1);
        db.save_session(&original).unwrap();

        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.load_session(&original.id.to_string()).unwrap().entries.len(), 1);
    }

    #[test]
    fn test_list_and_filter() {
        let (_dir, db) = open_temp();
        db.save_session(&session(FileSystemType::Ntfs, "/dev/sda1")).unwrap();
        db.save_session(&session(FileSystemType::Fat, "/dev/sdb1")).unwrap();
        db.save_session(&session(FileSystemType::Fat, "/dev/sdb1")).unwrap();

        assert_eq!(db.list_sessions().unwrap().len(), 3);
        assert_eq!(db.list_sessions_by_fs(FileSystemType::Fat).unwrap().len(), 2);
        assert_eq!(db.list_sessions_by_fs(FileSystemType::Raw).unwrap().len(), 0);
        let by_device = db.list_sessions_by_device("/dev/sda1").unwrap();
        assert_eq!(by_device.len(), 1);
        assert_eq!(by_device[0].fs_type, FileSystemType::Ntfs);
    }

    #[test]
    fn test_delete_and_cleanup() {
        let (_dir, db) = open_temp();
        let kept = session(FileSystemType::Ntfs, "/dev/sda1");
        let deleted = session(FileSystemType::Ntfs, "/dev/sda1");
        let mut old = session(FileSystemType::Ntfs, "/dev/sda1");
        old.created_at = Utc::now() - chrono::Duration::days(90);
        for s in [&kept, &deleted, &old] {
            db.save_session(s).unwrap();
        }

        db.delete_session(&deleted.id.to_string()).unwrap();
        assert!(db.delete_session(&deleted.id.to_string()).is_err());
        assert_eq!(db.cleanup_old_sessions(30).unwrap(), 1);
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.list_sessions().unwrap()[0].id, kept.id);
    }
}
