//! Scan sessions and their persistence
//!
//! A `ScanSession` drives one scan of one target. Its result, a
//! `RecoverySession`, can be stored in SQLite so extraction can happen
//! later without rescanning the source.

pub mod database;
pub mod manager;
pub mod scan;

pub use database::{SessionDatabase, SessionSummary};
pub use manager::SessionManager;
pub use scan::ScanSession;
