use serde::Serialize;
use thiserror::Error;

use super::fetcher::{FetchError, FetchOutcome, RemoteFetchRequest, SafeFetcher, Validators};
use super::parser::{parse_feed, ParseError};
use crate::storage::{FeedRepository, FetchStatus, StoreError};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("feed {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Updated { new_items: usize },
    NotModified,
}

/// Re-fetches one of a user's feeds with a conditional GET.
///
/// The stored ETag / Last-Modified are sent; a 304 only updates the fetch
/// status. Otherwise the feed is parsed and new items are stored. The outcome
/// (including failures) is recorded on the feed row.
pub async fn refresh_feed(
    repo: &dyn FeedRepository,
    fetcher: &SafeFetcher,
    user_id: i64,
    feed_id: i64,
) -> Result<RefreshOutcome, RefreshError> {
    let feed = repo
        .get_feed(user_id, feed_id)
        .await?
        .ok_or(RefreshError::NotFound(feed_id))?;

    let request = RemoteFetchRequest::new(feed.url.as_str()).with_validators(Validators {
        etag: feed.etag.clone(),
        last_modified: feed.last_modified.clone(),
    });

    let outcome = match fetch_and_store(repo, fetcher, feed_id, &request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(db_err) = repo.record_fetch_failure(feed_id, &e.to_string()).await {
                tracing::warn!(feed_id = feed_id, error = %db_err, "Failed to record fetch failure");
            }
            tracing::warn!(feed_id = feed_id, url = %feed.url, error = %e, "Feed refresh failed");
            return Err(e);
        }
    };

    tracing::info!(feed_id = feed_id, outcome = ?outcome, "Feed refreshed");
    Ok(outcome)
}

async fn fetch_and_store(
    repo: &dyn FeedRepository,
    fetcher: &SafeFetcher,
    feed_id: i64,
    request: &RemoteFetchRequest,
) -> Result<RefreshOutcome, RefreshError> {
    let result = fetcher.fetch_remote_text(request).await?;

    match &result.outcome {
        FetchOutcome::NotModified => {
            repo.record_fetch_success(feed_id, FetchStatus::NotModified, &result.validators)
                .await?;
            Ok(RefreshOutcome::NotModified)
        }
        FetchOutcome::Ok { body } => {
            let parsed = parse_feed(body.as_bytes())?;
            let new_items = repo.upsert_items(feed_id, &parsed.items).await?;
            repo.record_fetch_success(feed_id, FetchStatus::Ok, &result.validators)
                .await?;
            Ok(RefreshOutcome::Updated { new_items })
        }
    }
}
