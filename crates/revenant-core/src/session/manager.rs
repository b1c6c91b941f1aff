//! High-level session management functionality

use anyhow::{Context, Result};
use std::path::Path;
use uuid::Uuid;

use crate::RecoverySession;

use super::database::{SessionDatabase, SessionSummary};

/// High-level session manager
pub struct SessionManager {
    db: SessionDatabase,
}

impl SessionManager {
    /// Create a new session manager with the default database
    pub fn new() -> Result<Self> {
        let db_path = SessionDatabase::default_path()?;
        let db = SessionDatabase::open(db_path)?;
        Ok(Self { db })
    }

    /// Create a session manager with a custom database path
    pub fn with_path(path: impl AsRef<Path>) -> Result<Self> {
        let db = SessionDatabase::open(path)?;
        Ok(Self { db })
    }

    pub fn database(&self) -> &SessionDatabase {
        &self.db
    }

    pub fn save(&self, session: &RecoverySession) -> Result<()> {
        self.db.save_session(session)
    }

    /// Load a session by ID (supports short IDs)
    pub fn load(&self, id: &str) -> Result<RecoverySession> {
        self.db.load_session(id)
    }

    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        self.db.list_sessions()
    }

    pub fn list_sessions_by_fs(&self, fs_type: crate::FileSystemType) -> Result<Vec<SessionSummary>> {
        self.db.list_sessions_by_fs(fs_type)
    }

    pub fn list_sessions_by_device(&self, device: &str) -> Result<Vec<SessionSummary>> {
        self.db.list_sessions_by_device(device)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.db.delete_session(id)
    }

    /// Most recent session for a device, if any
    pub fn find_recent_for_device(&self, device: impl AsRef<Path>) -> Result<Option<RecoverySession>> {
        let device_str = device.as_ref().display().to_string();
        let sessions = self.db.list_sessions_by_device(&device_str)?;

        match sessions.first() {
            Some(summary) => Ok(Some(self.db.load_session(&summary.id.to_string())?)),
            None => Ok(None),
        }
    }

    /// Write a stored session to a standalone JSON file
    pub fn export_json(&self, id: &str, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let session = self.db.load_session(id)?;
        let json = serde_json::to_string_pretty(&session).context("Failed to serialize session")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Exported session {} to {}", session.id, path.display());
        Ok(())
    }

    /// Store a session read from a JSON export
    pub fn import_json(&self, path: impl AsRef<Path>) -> Result<Uuid> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let session: RecoverySession =
            serde_json::from_str(&json).with_context(|| format!("{} is not a session export", path.display()))?;
        self.db.save_session(&session)?;
        Ok(session.id)
    }

    /// Remove sessions older than `days` days
    pub fn cleanup(&self, days: u32) -> Result<usize> {
        self.db.cleanup_old_sessions(days)
    }

    pub fn count(&self) -> Result<usize> {
        self.db.count()
    }
}
