//! Integration tests for the subscription store: create, file into folders,
//! rename, refresh bookkeeping.
//!
//! Each test creates its own in-memory SQLite database for isolation.

use feedgate::feed::{ParsedItem, Validators};
use feedgate::storage::{Database, FeedRepository, FetchStatus, NewFeed, StoreError};

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn item(guid: &str, title: &str) -> ParsedItem {
    ParsedItem {
        guid: guid.to_string(),
        title: title.to_string(),
        link: Some(format!("https://example.com/{guid}")),
        content: Some("Body".to_string()),
        author: None,
        published_at: Some(1_700_000_000),
    }
}

fn new_feed(user_id: i64, url: &str) -> NewFeed {
    NewFeed {
        user_id,
        url: url.to_string(),
        title: "Example Feed".to_string(),
        ..NewFeed::default()
    }
}

#[tokio::test]
async fn test_subscribe_then_file_into_folders() {
    let db = test_db().await;
    let feed = db
        .create_feed_with_items(&new_feed(1, "https://example.com/feed.xml"), &[item("a", "A"), item("b", "B")])
        .await
        .unwrap();
    assert_eq!(db.count_items(feed.id).await.unwrap(), 2);

    let tech = db.create_folder(1, "Tech").await.unwrap();
    let news = db.create_folder(1, "News").await.unwrap();
    db.add_folder_memberships(feed.id, &[tech.id, news.id]).await.unwrap();
    // Adding again is a no-op
    db.add_folder_memberships(feed.id, &[tech.id]).await.unwrap();

    let stored = db
        .find_feed_by_user_and_url(1, "https://example.com/feed.xml")
        .await
        .unwrap()
        .unwrap();
    let mut expected = vec![tech.id, news.id];
    expected.sort_unstable();
    assert_eq!(stored.folder_ids, expected);
}

#[tokio::test]
async fn test_urls_are_unique_per_user_only() {
    let db = test_db().await;
    let url = "https://example.com/feed.xml";
    db.create_feed_with_items(&new_feed(1, url), &[]).await.unwrap();

    let err = db.create_feed_with_items(&new_feed(1, url), &[]).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let other = db.create_feed_with_items(&new_feed(2, url), &[]).await.unwrap();
    assert_eq!(other.user_id, 2);
    assert!(db.get_feed(1, other.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_folder_names_unique_ignoring_case() {
    let db = test_db().await;
    db.create_folder(1, "Reading List").await.unwrap();

    let err = db.create_folder(1, "  reading   LIST ").await.unwrap_err();
    assert!(err.is_conflict());

    // Another user may use the same name
    db.create_folder(2, "Reading List").await.unwrap();
    assert_eq!(db.list_folders_for_user(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rename_missing_feed_is_not_found() {
    let db = test_db().await;
    let feed = db
        .create_feed_with_items(&new_feed(1, "https://example.com/rss"), &[])
        .await
        .unwrap();
    db.rename_feed(feed.id, "Renamed").await.unwrap();
    assert_eq!(db.get_feed(1, feed.id).await.unwrap().unwrap().title, "Renamed");

    assert!(matches!(
        db.rename_feed(feed.id + 100, "Nope").await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_refresh_bookkeeping_through_trait_object() {
    let db = test_db().await;
    let feed = db
        .create_feed_with_items(&new_feed(1, "https://example.com/atom"), &[item("a", "A")])
        .await
        .unwrap();
    let repo: &dyn FeedRepository = &db;

    let validators = Validators {
        etag: Some("\"v1\"".to_string()),
        last_modified: None,
    };
    repo.record_fetch_success(feed.id, FetchStatus::Ok, &validators).await.unwrap();
    let new = repo
        .upsert_items(feed.id, &[item("a", "A (edited)"), item("b", "B")])
        .await
        .unwrap();
    assert_eq!(new, 1);

    repo.record_fetch_failure(feed.id, "HTTP error: 503").await.unwrap();
    let stored = repo.get_feed(1, feed.id).await.unwrap().unwrap();
    assert_eq!(stored.last_status.as_deref(), Some("error"));
    assert_eq!(stored.error.as_deref(), Some("HTTP error: 503"));
    // Failures keep the validators for the next conditional request
    assert_eq!(stored.etag.as_deref(), Some("\"v1\""));

    repo.record_fetch_success(feed.id, FetchStatus::NotModified, &Validators::default())
        .await
        .unwrap();
    let stored = repo.get_feed(1, feed.id).await.unwrap().unwrap();
    assert_eq!(stored.last_status.as_deref(), Some("not_modified"));
    assert_eq!(stored.error, None);
    assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
}
