//! Bulk and single-URL subscription import.
//!
//! - [`orchestrator`] - Concurrent per-entry pipeline under a batch deadline
//! - [`merge`] - URL normalization and the duplicate / ambiguity policy
//! - [`folders`] - Per-batch folder name resolution
//! - [`source`] - Reading entries from OPML or plain-text import files

pub mod folders;
pub mod merge;
pub mod orchestrator;
pub mod source;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{FetchError, ParseError};
use crate::storage::StoreError;

pub use merge::{merge_folder_ids, normalize_feed_url, select_candidate, CandidateKind, Selection};
pub use orchestrator::Importer;
pub use source::{parse_import_file, parse_import_text, SourceError};

/// One line of an import: a URL plus where to file it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEntry {
    pub url: String,
    /// Folder names, matched case-insensitively against existing folders
    #[serde(default)]
    pub folders: Vec<String>,
    /// Custom title that replaces the feed's own
    #[serde(default)]
    pub title: Option<String>,
}

impl ImportEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Imported,
    DuplicateMerged,
    DuplicateUnchanged,
    SkippedMultipleCandidates,
    Failed,
}

/// Stable machine-readable outcome codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidUrl,
    #[serde(rename = "http_404")]
    Http404,
    Timeout,
    InvalidXml,
    Network,
    MultipleCandidates,
    TimeoutBudgetExceeded,
    Duplicate,
    Unknown,
}

impl ErrorCode {
    pub fn from_fetch(err: &FetchError) -> Self {
        match err {
            FetchError::InvalidUrl(_) | FetchError::Blocked { .. } => ErrorCode::InvalidUrl,
            FetchError::HttpStatus(404) | FetchError::HttpStatus(410) => ErrorCode::Http404,
            FetchError::Timeout => ErrorCode::Timeout,
            FetchError::Network(e) if e.is_timeout() => ErrorCode::Timeout,
            FetchError::ResponseTooLarge => ErrorCode::InvalidXml,
            FetchError::Exhausted { last, .. } => Self::from_fetch(last),
            FetchError::HttpStatus(_)
            | FetchError::Unresolvable { .. }
            | FetchError::Network(_)
            | FetchError::TooManyRedirects(_)
            | FetchError::IncompleteResponse { .. } => ErrorCode::Network,
        }
    }

    pub fn from_parse(_err: &ParseError) -> Self {
        ErrorCode::InvalidXml
    }

    pub fn from_store(err: &StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => ErrorCode::Duplicate,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Outcome of one [`ImportEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRowResult {
    /// The URL exactly as the caller supplied it
    pub url: String,
    pub status: ImportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<i64>,
    /// Non-fatal problems, e.g. a folder that could not be created
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ImportRowResult {
    pub fn failed(url: &str, code: ErrorCode) -> Self {
        Self {
            url: url.to_owned(),
            status: ImportStatus::Failed,
            code: Some(code),
            feed_id: None,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn with_feed(url: &str, status: ImportStatus, feed_id: i64) -> Self {
        let code = match status {
            ImportStatus::DuplicateMerged | ImportStatus::DuplicateUnchanged => {
                Some(ErrorCode::Duplicate)
            }
            _ => None,
        };
        Self {
            url: url.to_owned(),
            status,
            code,
            feed_id: Some(feed_id),
            warnings: Vec::new(),
        }
    }

    pub(crate) fn skipped(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            status: ImportStatus::SkippedMultipleCandidates,
            code: Some(ErrorCode::MultipleCandidates),
            feed_id: None,
            warnings: Vec::new(),
        }
    }
}

/// Errors that abort a whole batch. Per-entry problems never surface here.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("too many entries: {count} (limit {max})")]
    TooManyEntries { count: usize, max: usize },
    #[error("storage unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Batch limits.
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub workers: usize,
    pub deadline: Duration,
    pub discovery_budget: usize,
    pub max_entries: usize,
    pub skip_multiple_candidates: bool,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            deadline: Duration::from_millis(25_000),
            discovery_budget: 50,
            max_entries: 500,
            skip_multiple_candidates: true,
        }
    }
}
