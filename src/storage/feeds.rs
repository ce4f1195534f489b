use sqlx::QueryBuilder;

use super::items::insert_items;
use super::schema::Database;
use super::types::{FeedDbRow, FeedRecord, FetchStatus, NewFeed, StoreError};
use crate::feed::{ParsedItem, Validators};

const FEED_COLUMNS: &str = "id, user_id, url, title, description, site_url, last_fetched, \
                            last_status, error, etag, last_modified";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Look up a user's feed by its normalized URL.
    pub async fn find_feed_by_user_and_url(
        &self,
        user_id: i64,
        url: &str,
    ) -> Result<Option<FeedRecord>, StoreError> {
        let row: Option<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE user_id = ? AND url = ?"
        ))
        .bind(user_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        self.with_folders(row).await
    }

    /// Load one of a user's feeds by id.
    pub async fn get_feed(
        &self,
        user_id: i64,
        feed_id: i64,
    ) -> Result<Option<FeedRecord>, StoreError> {
        let row: Option<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE user_id = ? AND id = ?"
        ))
        .bind(user_id)
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        self.with_folders(row).await
    }

    async fn with_folders(&self, row: Option<FeedDbRow>) -> Result<Option<FeedRecord>, StoreError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let folder_ids = self.folder_ids_for_feed(row.id).await?;
        Ok(Some(row.into_record(folder_ids)))
    }

    /// Insert a feed and its initial items in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the user already has a feed with
    /// this URL; nothing is written in that case.
    pub async fn create_feed_with_items(
        &self,
        feed: &NewFeed,
        items: &[ParsedItem],
    ) -> Result<FeedRecord, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds
                (user_id, url, title, description, site_url, last_fetched, last_status,
                 etag, last_modified, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'ok', ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(feed.user_id)
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.description)
        .bind(&feed.site_url)
        .bind(now)
        .bind(&feed.etag)
        .bind(&feed.last_modified)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        insert_items(&mut *tx, id, items, now).await?;
        tx.commit().await?;

        tracing::debug!(feed_id = id, user_id = feed.user_id, items = items.len(), "Created feed");

        Ok(FeedRecord {
            id,
            user_id: feed.user_id,
            url: feed.url.clone(),
            title: feed.title.clone(),
            description: feed.description.clone(),
            site_url: feed.site_url.clone(),
            last_fetched: Some(now),
            last_status: Some(FetchStatus::Ok.as_str().to_owned()),
            error: None,
            etag: feed.etag.clone(),
            last_modified: feed.last_modified.clone(),
            folder_ids: Vec::new(),
        })
    }

    /// Set a feed's display title.
    pub async fn rename_feed(&self, feed_id: i64, title: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
            .bind(title)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(feed_id));
        }
        Ok(())
    }

    /// Add a feed to folders. Memberships that already exist are left alone.
    pub async fn add_folder_memberships(
        &self,
        feed_id: i64,
        folder_ids: &[i64],
    ) -> Result<(), StoreError> {
        if folder_ids.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("INSERT OR IGNORE INTO feed_folders (feed_id, folder_id) ");
        builder.push_values(folder_ids, |mut b, folder_id| {
            b.push_bind(feed_id).push_bind(*folder_id);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Record a successful fetch (`Ok` or `NotModified`).
    ///
    /// Validators missing from the response keep their stored values, since
    /// servers often omit them on a 304.
    pub async fn record_fetch_success(
        &self,
        feed_id: i64,
        status: FetchStatus,
        validators: &Validators,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE feeds SET
                last_fetched = ?,
                last_status = ?,
                error = NULL,
                etag = COALESCE(?, etag),
                last_modified = COALESCE(?, last_modified)
            WHERE id = ?
        "#,
        )
        .bind(now)
        .bind(status.as_str())
        .bind(&validators.etag)
        .bind(&validators.last_modified)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed fetch with its error message.
    pub async fn record_fetch_failure(&self, feed_id: i64, error: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE feeds SET last_fetched = ?, last_status = ?, error = ? WHERE id = ?")
            .bind(now)
            .bind(FetchStatus::Error.as_str())
            .bind(error)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
