use futures::future::join_all;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use super::folders::FolderResolver;
use super::merge::{merge_folder_ids, normalize_feed_url, select_candidate, CandidateKind, Selection};
use super::{ErrorCode, ImportEntry, ImportError, ImportRowResult, ImportSettings, ImportStatus};
use crate::feed::{
    discover_feed_candidates, parse_feed, FetchError, FetchOutcome, ParseError, ParsedFeed,
    RemoteFetchRequest, SafeFetcher, Validators,
};
use crate::storage::{FeedRecord, FeedRepository, NewFeed, StoreError};
use crate::util::{clean_label, MAX_TITLE_CHARS};

/// Turns user-supplied URLs into subscriptions.
pub struct Importer {
    repo: Arc<dyn FeedRepository>,
    fetcher: SafeFetcher,
    settings: ImportSettings,
}

impl Importer {
    pub fn new(repo: Arc<dyn FeedRepository>, fetcher: SafeFetcher, settings: ImportSettings) -> Self {
        Self {
            repo,
            fetcher,
            settings,
        }
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    /// Subscribes a user to a single URL.
    ///
    /// Same pipeline as a one-entry batch, except that when a site offers
    /// several feeds the first valid one is taken instead of skipping.
    pub async fn add_feed_for_user(
        &self,
        user_id: i64,
        entry: ImportEntry,
    ) -> Result<ImportRowResult, ImportError> {
        let url = entry.url.clone();
        let mut rows = self
            .import_feed_entries_for_user(user_id, vec![entry], false, self.settings.deadline)
            .await?;
        Ok(rows
            .pop()
            .unwrap_or_else(|| ImportRowResult::failed(&url, ErrorCode::Unknown)))
    }

    /// Imports a batch of entries concurrently.
    ///
    /// Returns exactly one row per entry, in input order. A failing entry
    /// produces a `failed` row; it never aborts the batch. Once `deadline`
    /// has passed, entries that have not finished fail with
    /// `timeout_budget_exceeded`.
    ///
    /// # Errors
    ///
    /// - [`ImportError::TooManyEntries`] when the batch exceeds `max_entries`
    /// - [`ImportError::Store`] when the user's folders cannot be loaded
    pub async fn import_feed_entries_for_user(
        &self,
        user_id: i64,
        entries: Vec<ImportEntry>,
        skip_multi_candidate: bool,
        deadline: Duration,
    ) -> Result<Vec<ImportRowResult>, ImportError> {
        let deadline = Instant::now() + deadline;

        if entries.len() > self.settings.max_entries {
            return Err(ImportError::TooManyEntries {
                count: entries.len(),
                max: self.settings.max_entries,
            });
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let batch = Batch {
            repo: self.repo.as_ref(),
            fetcher: &self.fetcher,
            user_id,
            skip_multi_candidate,
            deadline,
            discovery_budget: AtomicUsize::new(self.settings.discovery_budget),
            folders: FolderResolver::load(self.repo.as_ref(), user_id).await?,
        };

        let total = entries.len();
        let cursor = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<ImportRowResult>>> = Mutex::new(vec![None; total]);
        let workers = self.settings.workers.clamp(1, total);

        tracing::info!(user_id = user_id, entries = total, workers = workers, "Starting import");

        let (cursor, slots_ref, entries_ref, batch_ref) = (&cursor, &slots, &entries, &batch);
        join_all((0..workers).map(|_| async move {
            loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(entry) = entries_ref.get(index) else {
                    break;
                };
                let row = AssertUnwindSafe(batch_ref.import_entry(entry))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!(url = %entry.url, "Import of entry panicked");
                        ImportRowResult::failed(&entry.url, ErrorCode::Unknown)
                    });
                slots_ref.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(row);
            }
        }))
        .await;

        let rows: Vec<ImportRowResult> = slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .zip(&entries)
            .map(|(slot, entry)| {
                slot.unwrap_or_else(|| ImportRowResult::failed(&entry.url, ErrorCode::Unknown))
            })
            .collect();

        let imported = rows
            .iter()
            .filter(|r| r.status == ImportStatus::Imported)
            .count();
        let failed = rows
            .iter()
            .filter(|r| r.status == ImportStatus::Failed)
            .count();
        tracing::info!(
            user_id = user_id,
            entries = total,
            imported = imported,
            failed = failed,
            discovery_left = batch.discovery_budget.load(Ordering::Relaxed),
            "Import finished"
        );

        Ok(rows)
    }
}

/// Why an entry stopped early. Always ends up as a `failed` row.
#[derive(Debug, Clone, Copy)]
struct Failure(ErrorCode);

impl From<FetchError> for Failure {
    fn from(err: FetchError) -> Self {
        Failure(ErrorCode::from_fetch(&err))
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        tracing::warn!(error = %err, "Repository error during import");
        Failure(ErrorCode::from_store(&err))
    }
}

/// A fetched URL that parsed as a feed.
struct ValidatedFeed {
    url: String,
    parsed: ParsedFeed,
    validators: Validators,
}

enum Probe {
    Feed(ValidatedFeed),
    NotAFeed,
    /// DNS had no answer; carries the code to report if discovery fails too
    Unresolvable(ErrorCode),
}

/// Where an entry ended up before writing.
enum Resolved {
    Create(ValidatedFeed),
    Merge(FeedRecord),
    Ambiguous,
}

/// State shared by the workers of one batch.
struct Batch<'a> {
    repo: &'a dyn FeedRepository,
    fetcher: &'a SafeFetcher,
    user_id: i64,
    skip_multi_candidate: bool,
    deadline: Instant,
    discovery_budget: AtomicUsize,
    folders: FolderResolver<'a>,
}

impl Batch<'_> {
    async fn import_entry(&self, entry: &ImportEntry) -> ImportRowResult {
        let result = match self.check_deadline() {
            Ok(()) => self.run_entry(entry).await,
            Err(f) => Err(f),
        };
        match result {
            Ok(row) => row,
            Err(Failure(code)) => {
                tracing::debug!(url = %entry.url, code = ?code, "Import entry failed");
                ImportRowResult::failed(&entry.url, code)
            }
        }
    }

    async fn run_entry(&self, entry: &ImportEntry) -> Result<ImportRowResult, Failure> {
        let url = normalize_feed_url(&entry.url).map_err(|_| Failure(ErrorCode::InvalidUrl))?;

        if let Some(existing) = self.repo.find_feed_by_user_and_url(self.user_id, &url).await? {
            return self.merge(entry, existing).await;
        }

        self.check_deadline()?;
        let resolved = match self.probe(&url).await? {
            Probe::Feed(feed) => Resolved::Create(feed),
            Probe::NotAFeed => self.discover(&url).await?,
            // Discovery retries under the www host
            Probe::Unresolvable(code) => self.discover(&url).await.map_err(|f| match f {
                Failure(ErrorCode::InvalidXml) => Failure(code),
                other => other,
            })?,
        };

        match resolved {
            Resolved::Create(feed) => self.create(entry, feed).await,
            Resolved::Merge(existing) => self.merge(entry, existing).await,
            Resolved::Ambiguous => Ok(ImportRowResult::skipped(&entry.url)),
        }
    }

    /// Fetches a URL and tries to parse it as a feed.
    async fn probe(&self, url: &str) -> Result<Probe, Failure> {
        let result = match self
            .within_deadline(self.fetcher.fetch_remote_text(&RemoteFetchRequest::new(url)))
            .await?
        {
            Ok(result) => result,
            Err(e) if matches!(e.root(), FetchError::Unresolvable { .. }) => {
                return Ok(Probe::Unresolvable(ErrorCode::from_fetch(&e)));
            }
            Err(e) => return Err(e.into()),
        };
        let FetchOutcome::Ok { body } = result.outcome else {
            return Ok(Probe::NotAFeed);
        };
        match parse_feed(body.as_bytes()) {
            Ok(parsed) => Ok(Probe::Feed(ValidatedFeed {
                url: url.to_owned(),
                parsed,
                validators: result.validators,
            })),
            Err(ParseError::NotAFeed(reason)) => {
                tracing::debug!(url = %url, reason = %reason, "Not a feed");
                Ok(Probe::NotAFeed)
            }
        }
    }

    /// Discovery fallback for a URL that is not itself a feed.
    async fn discover(&self, url: &str) -> Result<Resolved, Failure> {
        let took_budget = self
            .discovery_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok();
        if !took_budget {
            tracing::debug!(url = %url, "Discovery budget exhausted");
            return Err(Failure(ErrorCode::InvalidXml));
        }

        self.check_deadline()?;
        let found = self
            .within_deadline(discover_feed_candidates(self.fetcher, url))
            .await??;

        let mut kinds = Vec::new();
        let mut addable = Vec::new();
        let mut duplicates: Vec<FeedRecord> = Vec::new();

        for candidate in &found.candidates {
            self.check_deadline()?;
            let Ok(candidate_url) = normalize_feed_url(candidate) else {
                continue;
            };

            if let Some(existing) = self
                .repo
                .find_feed_by_user_and_url(self.user_id, &candidate_url)
                .await?
            {
                if !duplicates.iter().any(|d| d.id == existing.id) {
                    kinds.push(CandidateKind::Duplicate);
                    duplicates.push(existing);
                }
                continue;
            }

            match self.probe(&candidate_url).await {
                Ok(Probe::Feed(feed)) => {
                    kinds.push(CandidateKind::Addable);
                    addable.push(feed);
                    // Without skip-ambiguous the first valid feed wins anyway
                    if !self.skip_multi_candidate {
                        break;
                    }
                }
                Ok(Probe::NotAFeed | Probe::Unresolvable(_)) => {}
                Err(Failure(ErrorCode::TimeoutBudgetExceeded)) => {
                    return Err(Failure(ErrorCode::TimeoutBudgetExceeded))
                }
                Err(Failure(code)) => {
                    tracing::debug!(url = %candidate_url, code = ?code, "Candidate rejected");
                }
            }
        }

        let selection = select_candidate(&kinds, self.skip_multi_candidate);
        tracing::debug!(url = %url, candidates = kinds.len(), selection = ?selection, "Discovery resolved");

        // Map an index over all candidates back to its typed list
        let rank = |index: usize, kind: CandidateKind| {
            kinds[..index].iter().filter(|k| **k == kind).count()
        };
        match selection {
            Selection::Addable(i) => {
                let feed = addable.swap_remove(rank(i, CandidateKind::Addable));
                Ok(Resolved::Create(feed))
            }
            Selection::Duplicate(i) => {
                let existing = duplicates.swap_remove(rank(i, CandidateKind::Duplicate));
                Ok(Resolved::Merge(existing))
            }
            Selection::Ambiguous => Ok(Resolved::Ambiguous),
            Selection::None => Err(Failure(ErrorCode::InvalidXml)),
        }
    }

    async fn create(&self, entry: &ImportEntry, feed: ValidatedFeed) -> Result<ImportRowResult, Failure> {
        self.check_deadline()?;
        let (folder_ids, warnings) = self.folders.resolve(&entry.folders).await;

        self.check_deadline()?;
        let ValidatedFeed {
            url,
            parsed,
            validators,
        } = feed;
        let new_feed = NewFeed {
            user_id: self.user_id,
            title: parsed.title.clone().unwrap_or_else(|| fallback_title(&url)),
            url,
            description: parsed.description.clone(),
            site_url: parsed.site_url.clone(),
            etag: validators.etag,
            last_modified: validators.last_modified,
        };

        let created = match self.repo.create_feed_with_items(&new_feed, &parsed.items).await {
            Ok(created) => created,
            // Another worker or request subscribed the same URL first
            Err(StoreError::Conflict(_)) => {
                let existing = self
                    .repo
                    .find_feed_by_user_and_url(self.user_id, &new_feed.url)
                    .await?
                    .ok_or(Failure(ErrorCode::Duplicate))?;
                tracing::debug!(url = %new_feed.url, feed_id = existing.id, "Lost create race, merging");
                let mut row = self.merge_resolved(entry, existing, folder_ids).await?;
                row.warnings.extend(warnings);
                return Ok(row);
            }
            Err(e) => return Err(e.into()),
        };

        let mut row = ImportRowResult::with_feed(&entry.url, ImportStatus::Imported, created.id);
        row.warnings = warnings;

        if let Some(title) = entry
            .title
            .as_deref()
            .and_then(|t| clean_label(t, MAX_TITLE_CHARS))
        {
            if let Err(e) = self.repo.rename_feed(created.id, &title).await {
                tracing::warn!(feed_id = created.id, error = %e, "Could not apply custom title");
                row.warnings.push(format!("custom title not applied: {e}"));
            }
        }

        if let Err(e) = self.repo.add_folder_memberships(created.id, &folder_ids).await {
            tracing::warn!(feed_id = created.id, error = %e, "Could not add folder memberships");
            row.warnings.push(format!("folders not applied: {e}"));
        }

        tracing::debug!(url = %entry.url, feed_id = created.id, "Imported feed");
        Ok(row)
    }

    async fn merge(&self, entry: &ImportEntry, existing: FeedRecord) -> Result<ImportRowResult, Failure> {
        self.check_deadline()?;
        let (folder_ids, warnings) = self.folders.resolve(&entry.folders).await;
        let mut row = self.merge_resolved(entry, existing, folder_ids).await?;
        row.warnings.extend(warnings);
        Ok(row)
    }

    async fn merge_resolved(
        &self,
        entry: &ImportEntry,
        existing: FeedRecord,
        folder_ids: Vec<i64>,
    ) -> Result<ImportRowResult, Failure> {
        let Some(union) = merge_folder_ids(&existing.folder_ids, &folder_ids) else {
            return Ok(ImportRowResult::with_feed(
                &entry.url,
                ImportStatus::DuplicateUnchanged,
                existing.id,
            ));
        };

        self.repo.add_folder_memberships(existing.id, &union).await?;
        Ok(ImportRowResult::with_feed(
            &entry.url,
            ImportStatus::DuplicateMerged,
            existing.id,
        ))
    }

    fn check_deadline(&self) -> Result<(), Failure> {
        if Instant::now() >= self.deadline {
            return Err(Failure(ErrorCode::TimeoutBudgetExceeded));
        }
        Ok(())
    }

    async fn within_deadline<F: Future>(&self, fut: F) -> Result<F::Output, Failure> {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .map_err(|_| Failure(ErrorCode::TimeoutBudgetExceeded))
    }
}

fn fallback_title(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_else(|| url.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fetcher::tests::test_fetcher;
    use crate::feed::guard::tests::StaticResolver;
    use crate::feed::{FetchSettings, TargetGuard};
    use crate::import::test_support::InstrumentedRepo;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss(title: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>{title}</title><link>https://example.com/</link>
  <item><guid>1</guid><title>First</title></item>
  <item><guid>2</guid><title>Second</title></item>
</channel></rss>"#
        )
    }

    fn html_with_links(hrefs: &[&str]) -> String {
        let links: String = hrefs
            .iter()
            .map(|h| format!(r#"<link rel="alternate" type="application/rss+xml" href="{h}">"#))
            .collect();
        format!("<!DOCTYPE html><html><head>{links}</head><body>Blog</body></html>")
    }

    async fn mount_feed(server: &MockServer, at: &str, title: &str) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss(title))
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .mount(server)
            .await;
    }

    async fn mount_html(server: &MockServer, at: &str, body: String) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(server)
            .await;
    }

    fn build_importer(repo: Arc<InstrumentedRepo>, settings: ImportSettings) -> Importer {
        Importer::new(repo, test_fetcher(), settings)
    }

    fn entry(url: String) -> ImportEntry {
        ImportEntry::new(url)
    }

    async fn run(
        importer: &Importer,
        entries: Vec<ImportEntry>,
        skip_multi: bool,
    ) -> Vec<ImportRowResult> {
        importer
            .import_feed_entries_for_user(1, entries, skip_multi, Duration::from_secs(20))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_direct_feed_imported_with_title_and_folders() {
        let server = MockServer::start().await;
        mount_feed(&server, "/feed.xml", "Example").await;
        let repo = Arc::new(InstrumentedRepo::new().await);
        let importer = build_importer(repo.clone(), ImportSettings::default());

        let rows = run(
            &importer,
            vec![ImportEntry {
                url: format!("{}/feed.xml", server.uri()),
                folders: vec!["Tech".into(), "tech".into(), "News".into()],
                title: Some("  My  Title ".into()),
            }],
            true,
        )
        .await;

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ImportStatus::Imported);
        assert_eq!(rows[0].code, None);
        let feed = repo.inner.get_feed(1, rows[0].feed_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(feed.title, "My Title");
        assert_eq!(feed.folder_ids.len(), 2);
        assert_eq!(repo.inner.count_items(feed.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_same_url_twice_in_one_batch_creates_one_feed() {
        let server = MockServer::start().await;
        mount_feed(&server, "/feed", "Example").await;
        let repo = Arc::new(InstrumentedRepo::new().await);
        let importer = build_importer(repo.clone(), ImportSettings::default());

        let url = format!("{}/feed", server.uri());
        let rows = run(&importer, vec![entry(url.clone()), entry(url.clone())], true).await;

        let statuses: Vec<ImportStatus> = rows.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == ImportStatus::Imported)
                .count(),
            1,
            "{statuses:?}"
        );
        assert!(statuses.iter().any(|s| matches!(
            s,
            ImportStatus::DuplicateUnchanged | ImportStatus::DuplicateMerged
        )));
        assert_eq!(rows[0].feed_id, rows[1].feed_id);
        assert_eq!(rows[0].url, url);
        assert_eq!(rows[1].url, url);
    }

    #[tokio::test]
    async fn test_reimport_merges_folders_then_is_unchanged() {
        let server = MockServer::start().await;
        mount_feed(&server, "/feed", "Example").await;
        let repo = Arc::new(InstrumentedRepo::new().await);
        let importer = build_importer(repo.clone(), ImportSettings::default());
        let url = format!("{}/feed", server.uri());

        let first = run(&importer, vec![entry(url.clone())], true).await;
        assert_eq!(first[0].status, ImportStatus::Imported);

        let with_folder = ImportEntry {
            url: url.clone(),
            folders: vec!["Later".into()],
            title: None,
        };
        let second = run(&importer, vec![with_folder.clone()], true).await;
        assert_eq!(second[0].status, ImportStatus::DuplicateMerged);
        assert_eq!(second[0].code, Some(ErrorCode::Duplicate));

        let third = run(&importer, vec![with_folder], true).await;
        assert_eq!(third[0].status, ImportStatus::DuplicateUnchanged);
        assert_eq!(third[0].feed_id, first[0].feed_id);
    }

    #[tokio::test]
    async fn test_site_url_resolved_through_discovery() {
        let server = MockServer::start().await;
        mount_html(&server, "/", html_with_links(&["/comments/feed", "/blog/rss"])).await;
        mount_feed(&server, "/blog/rss", "Blog").await;
        let repo = Arc::new(InstrumentedRepo::new().await);
        let importer = build_importer(repo.clone(), ImportSettings::default());

        let site = server.uri();
        let rows = run(&importer, vec![entry(site.clone())], true).await;
        assert_eq!(rows[0].status, ImportStatus::Imported, "{:?}", rows[0]);
        assert_eq!(rows[0].url, site);

        let feed = repo
            .inner
            .find_feed_by_user_and_url(1, &format!("{}/blog/rss", server.uri()))
            .await
            .unwrap();
        assert!(feed.is_some());
    }

    #[tokio::test]
    async fn test_unresolvable_site_found_under_www_host() {
        let server = MockServer::start().await;
        mount_html(&server, "/", html_with_links(&["/rss"])).await;
        mount_feed(&server, "/rss", "Blog").await;
        let port = server.address().port();

        let resolver = StaticResolver::default().with("www.blog.test", &["127.0.0.1"]);
        let guard = TargetGuard::new(Arc::new(resolver)).allowing_loopback();
        let fetcher = SafeFetcher::with_guard(FetchSettings::default(), guard).unwrap();
        let repo = Arc::new(InstrumentedRepo::new().await);
        let importer = Importer::new(repo.clone(), fetcher, ImportSettings::default());

        let rows = run(&importer, vec![entry(format!("http://blog.test:{port}/"))], true).await;
        assert_eq!(rows[0].status, ImportStatus::Imported, "{:?}", rows[0]);
        let feed = repo
            .inner
            .get_feed(1, rows[0].feed_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(feed.url, format!("http://www.blog.test:{port}/rss"));

        // Neither host resolves
        let rows = run(&importer, vec![entry("http://nowhere.test/".into())], true).await;
        assert_eq!(rows[0].code, Some(ErrorCode::Network));
    }

    #[tokio::test]
    async fn test_multiple_feeds_skipped_when_ambiguous() {
        let server = MockServer::start().await;
        mount_html(&server, "/", html_with_links(&["/posts.xml", "/podcast.xml"])).await;
        mount_feed(&server, "/posts.xml", "Posts").await;
        mount_feed(&server, "/podcast.xml", "Podcast").await;
        let repo = Arc::new(InstrumentedRepo::new().await);
        let importer = build_importer(repo.clone(), ImportSettings::default());

        let rows = run(&importer, vec![entry(server.uri())], true).await;
        assert_eq!(rows[0].status, ImportStatus::SkippedMultipleCandidates);
        assert_eq!(rows[0].code, Some(ErrorCode::MultipleCandidates));

        // Single subscribe takes the first one instead
        let row = importer
            .add_feed_for_user(1, entry(server.uri()))
            .await
            .unwrap();
        assert_eq!(row.status, ImportStatus::Imported);
        let feed = repo
            .inner
            .get_feed(1, row.feed_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(feed.url, format!("{}/posts.xml", server.uri()));
    }

    #[tokio::test]
    async fn test_discovery_budget_exhaustion_degrades_to_invalid_xml() {
        let server = MockServer::start().await;
        mount_html(&server, "/", html_with_links(&[])).await;
        for i in 0..4 {
            mount_html(&server, &format!("/site{i}"), html_with_links(&[])).await;
        }
        mount_feed(&server, "/feed", "Heuristic").await;
        let repo = Arc::new(InstrumentedRepo::new().await);
        let settings = ImportSettings {
            discovery_budget: 1,
            workers: 1,
            ..ImportSettings::default()
        };
        let importer = build_importer(repo.clone(), settings);

        let urls: Vec<String> = (0..4).map(|i| format!("{}/site{i}", server.uri())).collect();
        let rows = run(&importer, urls.iter().cloned().map(entry).collect(), true).await;

        assert_eq!(rows.len(), 4);
        for (row, url) in rows.iter().zip(&urls) {
            assert_eq!(&row.url, url);
        }
        // The first entry spends the budget and finds /feed by heuristics
        assert_eq!(rows[0].status, ImportStatus::Imported, "{:?}", rows[0]);
        for row in &rows[1..] {
            assert_eq!(row.status, ImportStatus::Failed);
            assert_eq!(row.code, Some(ErrorCode::InvalidXml));
        }
    }

    #[tokio::test]
    async fn test_tiny_deadline_fails_every_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss("Slow"))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let repo = Arc::new(InstrumentedRepo::new().await);
        let importer = build_importer(repo.clone(), ImportSettings::default());

        let entries: Vec<ImportEntry> = (0..10)
            .map(|i| entry(format!("{}/feed/{i}", server.uri())))
            .collect();
        let started = std::time::Instant::now();
        let rows = importer
            .import_feed_entries_for_user(1, entries, true, Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(rows.len(), 10);
        assert!(rows
            .iter()
            .all(|r| r.code == Some(ErrorCode::TimeoutBudgetExceeded)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_failures_are_per_entry_and_order_preserved() {
        let server = MockServer::start().await;
        mount_feed(&server, "/good", "Good").await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss("Slow"))
                    .set_delay(Duration::from_millis(150)),
            )
            .mount(&server)
            .await;
        let repo = Arc::new(InstrumentedRepo::new().await);
        let importer = build_importer(repo.clone(), ImportSettings::default());

        let inputs = vec![
            format!("{}/slow", server.uri()),
            "ftp://example.com/feed".to_string(),
            format!("{}/gone", server.uri()),
            "http://169.254.169.254/latest".to_string(),
            format!("{}/good", server.uri()),
        ];
        let rows = run(&importer, inputs.iter().cloned().map(entry).collect(), true).await;

        let got: Vec<(&str, ImportStatus, Option<ErrorCode>)> = rows
            .iter()
            .map(|r| (r.url.as_str(), r.status, r.code))
            .collect();
        assert_eq!(
            got,
            vec![
                (inputs[0].as_str(), ImportStatus::Imported, None),
                (inputs[1].as_str(), ImportStatus::Failed, Some(ErrorCode::InvalidUrl)),
                (inputs[2].as_str(), ImportStatus::Failed, Some(ErrorCode::Http404)),
                (inputs[3].as_str(), ImportStatus::Failed, Some(ErrorCode::InvalidUrl)),
                (inputs[4].as_str(), ImportStatus::Imported, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_shared_new_folder_created_once_across_workers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss("Any")))
            .mount(&server)
            .await;
        let repo = Arc::new(InstrumentedRepo::new().await);
        let importer = build_importer(repo.clone(), ImportSettings::default());

        let entries: Vec<ImportEntry> = (0..8)
            .map(|i| ImportEntry {
                url: format!("{}/feed/{i}", server.uri()),
                folders: vec![if i % 2 == 0 { "Shared" } else { "SHARED" }.to_string()],
                title: None,
            })
            .collect();
        let rows = run(&importer, entries, true).await;

        assert!(rows.iter().all(|r| r.status == ImportStatus::Imported));
        assert!(rows.iter().all(|r| r.warnings.is_empty()));
        assert_eq!(repo.folder_creates(), 1);
        assert_eq!(repo.inner.list_folders_for_user(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repository_failure_becomes_unknown_row() {
        let server = MockServer::start().await;
        mount_feed(&server, "/feed", "Example").await;
        let mut repo = InstrumentedRepo::new().await;
        repo.fail_feed_creates = true;
        let importer = build_importer(Arc::new(repo), ImportSettings::default());

        let rows = run(&importer, vec![entry(format!("{}/feed", server.uri()))], true).await;
        assert_eq!(rows[0].status, ImportStatus::Failed);
        assert_eq!(rows[0].code, Some(ErrorCode::Unknown));
    }

    #[tokio::test]
    async fn test_setup_failures_abort_the_batch() {
        let mut repo = InstrumentedRepo::new().await;
        repo.fail_folder_listing = true;
        let importer = build_importer(Arc::new(repo), ImportSettings::default());
        let err = importer
            .import_feed_entries_for_user(1, vec![entry("https://example.com".into())], true, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Store(_)));

        let repo = Arc::new(InstrumentedRepo::new().await);
        let settings = ImportSettings {
            max_entries: 2,
            ..ImportSettings::default()
        };
        let importer = build_importer(repo, settings);
        let entries = (0..3).map(|i| entry(format!("https://example.com/{i}"))).collect();
        let err = importer
            .import_feed_entries_for_user(1, entries, true, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::TooManyEntries { count: 3, max: 2 }));
    }
}
