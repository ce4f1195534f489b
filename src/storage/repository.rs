use async_trait::async_trait;

use super::schema::Database;
use super::types::{FeedRecord, FetchStatus, FolderRecord, NewFeed, StoreError};
use crate::feed::{ParsedItem, Validators};

/// Persistence operations the import pipeline and refresh depend on.
///
/// [`Database`] is the production implementation. Every method is scoped to
/// a single user's data; callers pass ids they obtained from the same user.
#[async_trait]
pub trait FeedRepository: Send + Sync {
    async fn find_feed_by_user_and_url(
        &self,
        user_id: i64,
        url: &str,
    ) -> Result<Option<FeedRecord>, StoreError>;

    /// Must fail with [`StoreError::Conflict`] when the URL is already taken.
    async fn create_feed_with_items(
        &self,
        feed: &NewFeed,
        items: &[ParsedItem],
    ) -> Result<FeedRecord, StoreError>;

    async fn add_folder_memberships(&self, feed_id: i64, folder_ids: &[i64])
        -> Result<(), StoreError>;

    /// Must fail with [`StoreError::Conflict`] when the name is already taken.
    async fn create_folder(&self, user_id: i64, name: &str) -> Result<FolderRecord, StoreError>;

    async fn list_folders_for_user(&self, user_id: i64) -> Result<Vec<FolderRecord>, StoreError>;

    async fn rename_feed(&self, feed_id: i64, title: &str) -> Result<(), StoreError>;

    async fn get_feed(&self, user_id: i64, feed_id: i64) -> Result<Option<FeedRecord>, StoreError>;

    async fn record_fetch_success(
        &self,
        feed_id: i64,
        status: FetchStatus,
        validators: &Validators,
    ) -> Result<(), StoreError>;

    async fn record_fetch_failure(&self, feed_id: i64, error: &str) -> Result<(), StoreError>;

    /// Returns the number of new items.
    async fn upsert_items(&self, feed_id: i64, items: &[ParsedItem]) -> Result<usize, StoreError>;
}

#[async_trait]
impl FeedRepository for Database {
    async fn find_feed_by_user_and_url(
        &self,
        user_id: i64,
        url: &str,
    ) -> Result<Option<FeedRecord>, StoreError> {
        Database::find_feed_by_user_and_url(self, user_id, url).await
    }

    async fn create_feed_with_items(
        &self,
        feed: &NewFeed,
        items: &[ParsedItem],
    ) -> Result<FeedRecord, StoreError> {
        Database::create_feed_with_items(self, feed, items).await
    }

    async fn add_folder_memberships(
        &self,
        feed_id: i64,
        folder_ids: &[i64],
    ) -> Result<(), StoreError> {
        Database::add_folder_memberships(self, feed_id, folder_ids).await
    }

    async fn create_folder(&self, user_id: i64, name: &str) -> Result<FolderRecord, StoreError> {
        Database::create_folder(self, user_id, name).await
    }

    async fn list_folders_for_user(&self, user_id: i64) -> Result<Vec<FolderRecord>, StoreError> {
        Database::list_folders_for_user(self, user_id).await
    }

    async fn rename_feed(&self, feed_id: i64, title: &str) -> Result<(), StoreError> {
        Database::rename_feed(self, feed_id, title).await
    }

    async fn get_feed(&self, user_id: i64, feed_id: i64) -> Result<Option<FeedRecord>, StoreError> {
        Database::get_feed(self, user_id, feed_id).await
    }

    async fn record_fetch_success(
        &self,
        feed_id: i64,
        status: FetchStatus,
        validators: &Validators,
    ) -> Result<(), StoreError> {
        Database::record_fetch_success(self, feed_id, status, validators).await
    }

    async fn record_fetch_failure(&self, feed_id: i64, error: &str) -> Result<(), StoreError> {
        Database::record_fetch_failure(self, feed_id, error).await
    }

    async fn upsert_items(&self, feed_id: i64, items: &[ParsedItem]) -> Result<usize, StoreError> {
        Database::upsert_items(self, feed_id, items).await
    }
}
