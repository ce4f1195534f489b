use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage errors, classified by cause rather than by message.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write (feed URL or folder name
    /// already exists for this user)
    #[error("already exists: {0}")]
    Conflict(String),

    /// The referenced row does not exist
    #[error("not found: {0}")]
    NotFound(i64),

    /// A name was empty after sanitizing
    #[error("name is empty")]
    InvalidName,

    /// Another process holds the database lock
    #[error("database is locked by another process")]
    InstanceLocked,

    /// Migration failed
    #[error("database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("database error: {0}")]
    Other(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StoreError::Conflict(db_err.message().to_owned());
            }
        }

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        let error_string = err.to_string().to_lowercase();
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("unable to open database file")
        {
            return StoreError::InstanceLocked;
        }

        StoreError::Other(err)
    }
}

// ============================================================================
// Records
// ============================================================================

/// A feed subscription as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedRecord {
    pub id: i64,
    pub user_id: i64,
    /// Normalized feed URL
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    /// Unix timestamp of the last fetch attempt
    pub last_fetched: Option<i64>,
    /// `ok`, `not_modified` or `error`
    pub last_status: Option<String>,
    pub error: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Folders the feed belongs to, ascending
    pub folder_ids: Vec<i64>,
}

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub last_fetched: Option<i64>,
    pub last_status: Option<String>,
    pub error: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl FeedDbRow {
    pub(crate) fn into_record(self, folder_ids: Vec<i64>) -> FeedRecord {
        FeedRecord {
            id: self.id,
            user_id: self.user_id,
            url: self.url,
            title: self.title,
            description: self.description,
            site_url: self.site_url,
            last_fetched: self.last_fetched,
            last_status: self.last_status,
            error: self.error,
            etag: self.etag,
            last_modified: self.last_modified,
            folder_ids,
        }
    }
}

/// A feed about to be inserted.
#[derive(Debug, Clone, Default)]
pub struct NewFeed {
    pub user_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// A user's folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct FolderRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
}

/// Result of the last fetch of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Ok,
    NotModified,
    Error,
}

impl FetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::NotModified => "not_modified",
            FetchStatus::Error => "error",
        }
    }
}
