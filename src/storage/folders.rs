use super::schema::Database;
use super::types::{FolderRecord, StoreError};
use crate::util::{clean_label, folder_key, MAX_FOLDER_NAME_CHARS};

impl Database {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    /// Create a folder for a user, returning the stored record.
    ///
    /// The name is sanitized (control chars stripped, whitespace collapsed)
    /// before insertion. Names are unique per user ignoring case.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the user already has a folder with this name
    /// - [`StoreError::InvalidName`] if nothing printable remains after cleaning
    pub async fn create_folder(&self, user_id: i64, name: &str) -> Result<FolderRecord, StoreError> {
        let clean_name = clean_label(name, MAX_FOLDER_NAME_CHARS).ok_or(StoreError::InvalidName)?;
        let key = folder_key(&clean_name);
        let now = chrono::Utc::now().timestamp();

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO folders (user_id, name, name_key, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(&clean_name)
        .bind(&key)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(folder_id = id, user_id = user_id, name = %clean_name, "Created folder");

        Ok(FolderRecord {
            id,
            user_id,
            name: clean_name,
        })
    }

    /// All of a user's folders, ordered by name.
    pub async fn list_folders_for_user(&self, user_id: i64) -> Result<Vec<FolderRecord>, StoreError> {
        let folders: Vec<FolderRecord> = sqlx::query_as(
            "SELECT id, user_id, name FROM folders WHERE user_id = ? ORDER BY name_key",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }

    pub(crate) async fn folder_ids_for_feed(&self, feed_id: i64) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT folder_id FROM feed_folders WHERE feed_id = ? ORDER BY folder_id",
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
