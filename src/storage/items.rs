use sqlx::{QueryBuilder, SqliteConnection};

use super::schema::Database;
use super::types::StoreError;
use crate::feed::ParsedItem;

const BATCH_SIZE: usize = 50;

/// Inserts items that are not stored yet. Returns how many were new.
pub(crate) async fn insert_items(
    conn: &mut SqliteConnection,
    feed_id: i64,
    items: &[ParsedItem],
    now: i64,
) -> Result<usize, sqlx::Error> {
    let mut total_inserted = 0usize;

    for chunk in items.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO items (feed_id, guid, title, link, content, author, published, fetched_at) ",
        );
        builder.push_values(chunk, |mut b, item| {
            b.push_bind(feed_id)
                .push_bind(&item.guid)
                .push_bind(&item.title)
                .push_bind(&item.link)
                .push_bind(&item.content)
                .push_bind(&item.author)
                .push_bind(item.published_at)
                .push_bind(now);
        });
        let result = builder.build().execute(&mut *conn).await?;
        total_inserted += result.rows_affected() as usize;
    }

    Ok(total_inserted)
}

impl Database {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Insert new items and refresh the metadata of ones already stored.
    ///
    /// Two-phase: `INSERT OR IGNORE` for new guids, then an `UPDATE` per
    /// guid, all in one transaction.
    ///
    /// # Returns
    ///
    /// The number of newly inserted items (not updated).
    pub async fn upsert_items(
        &self,
        feed_id: i64,
        items: &[ParsedItem],
    ) -> Result<usize, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let inserted = insert_items(&mut *tx, feed_id, items, now).await?;

        for item in items {
            sqlx::query(
                r#"
                UPDATE items SET title = ?, link = ?, content = ?, author = ?, published = ?
                WHERE feed_id = ? AND guid = ?
            "#,
            )
            .bind(&item.title)
            .bind(&item.link)
            .bind(&item.content)
            .bind(&item.author)
            .bind(item.published_at)
            .bind(feed_id)
            .bind(&item.guid)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Number of items stored for a feed.
    pub async fn count_items(&self, feed_id: i64) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
