//! SQLite persistence: company-scoped feature flags and the record of every
//! review comment the bot has posted.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and add a
//! migration step in `run_migrations`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::warn;

use panoptes_core::RepoRef;

use crate::flags::{FeatureFlag, FeatureFlags};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Record of a comment that was successfully posted.
#[derive(Debug, Clone)]
pub struct PostedCommentRecord {
    pub company_id: u64,
    pub repo: RepoRef,
    pub pr_number: u64,
    pub comment_id: u64,
    pub author: String,
    pub body: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

/// Best-effort persistence for posted comments. A failed write is logged by
/// the caller and never blocks posting.
pub trait CommentStore: Send + Sync {
    fn record_posted(&self, record: &PostedCommentRecord) -> Result<()>;
}

/// SQLite database behind a `Mutex<Connection>`.
///
/// `rusqlite::Connection` is not `Sync`, so the mutex provides the required
/// synchronization. All queries here are short single-row operations, cheap
/// enough to run on the request path.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .context("failed to read schema version")?;

        if version == 0 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS feature_flags (
                    flag TEXT NOT NULL,
                    company_id INTEGER NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    PRIMARY KEY (flag, company_id)
                );
                CREATE TABLE IF NOT EXISTS posted_comments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL,
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    comment_id INTEGER NOT NULL,
                    author TEXT NOT NULL,
                    body TEXT NOT NULL,
                    category TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_posted_comments_pr
                    ON posted_comments (repo_owner, repo_name, pr_number);",
            )
            .context("failed to create schema")?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("failed to set schema version")?;
        } else if version != SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}, expected {SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))
    }

    pub fn set_flag(&self, flag: FeatureFlag, company_id: u64, enabled: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO feature_flags (flag, company_id, enabled) VALUES (?1, ?2, ?3)
             ON CONFLICT (flag, company_id) DO UPDATE SET enabled = ?3",
            params![flag.key(), company_id as i64, enabled as i64],
        )
        .context("failed to upsert feature flag")?;
        Ok(())
    }

    pub fn flag_enabled(&self, flag: FeatureFlag, company_id: u64) -> Result<bool> {
        let conn = self.lock()?;
        let enabled: Option<i64> = conn
            .query_row(
                "SELECT enabled FROM feature_flags WHERE flag = ?1 AND company_id = ?2",
                params![flag.key(), company_id as i64],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("failed to query feature flag")?;
        Ok(enabled == Some(1))
    }

    pub fn posted_comment_count(&self, repo: &RepoRef, pr_number: u64) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM posted_comments
                 WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
                params![repo.owner, repo.name, pr_number as i64],
                |row| row.get(0),
            )
            .context("failed to count posted comments")?;
        Ok(count as u64)
    }
}

impl FeatureFlags for SqliteDb {
    fn is_enabled(&self, flag: FeatureFlag, company_id: u64) -> bool {
        match self.flag_enabled(flag, company_id) {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(flag = flag.key(), error = %e, "feature flag lookup failed; treating as disabled");
                false
            }
        }
    }
}

impl CommentStore for SqliteDb {
    fn record_posted(&self, record: &PostedCommentRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO posted_comments
                (company_id, repo_owner, repo_name, pr_number, comment_id, author, body, category, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.company_id as i64,
                record.repo.owner,
                record.repo.name,
                record.pr_number as i64,
                record.comment_id as i64,
                record.author,
                record.body,
                record.category,
                record.created_at.to_rfc3339(),
            ],
        )
        .context("failed to record posted comment")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_to_disabled() {
        let db = SqliteDb::in_memory().unwrap();
        assert!(!db.is_enabled(FeatureFlag::ValidateReviews, 1));
    }

    #[test]
    fn flags_are_company_scoped() {
        let db = SqliteDb::in_memory().unwrap();
        db.set_flag(FeatureFlag::AddGeminiResults, 1, true).unwrap();
        assert!(db.is_enabled(FeatureFlag::AddGeminiResults, 1));
        assert!(!db.is_enabled(FeatureFlag::AddGeminiResults, 2));
    }

    #[test]
    fn flags_can_be_disabled_again() {
        let db = SqliteDb::in_memory().unwrap();
        db.set_flag(FeatureFlag::ValidateReviews, 1, true).unwrap();
        db.set_flag(FeatureFlag::ValidateReviews, 1, false).unwrap();
        assert!(!db.is_enabled(FeatureFlag::ValidateReviews, 1));
    }

    #[test]
    fn records_posted_comments() {
        let db = SqliteDb::in_memory().unwrap();
        let repo = RepoRef::new("acme", "widgets");
        let record = PostedCommentRecord {
            company_id: 1,
            repo: repo.clone(),
            pr_number: 42,
            comment_id: 1001,
            author: "panoptes[bot]".to_string(),
            body: "[**BugRisk**]\n\nUnchecked error.".to_string(),
            category: "bug_risk".to_string(),
            created_at: Utc::now(),
        };
        db.record_posted(&record).unwrap();
        db.record_posted(&record).unwrap();
        assert_eq!(db.posted_comment_count(&repo, 42).unwrap(), 2);
        assert_eq!(db.posted_comment_count(&repo, 43).unwrap(), 0);
    }
}
