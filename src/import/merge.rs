use std::collections::BTreeSet;
use url::{Host, Url};

use crate::util::UrlValidationError;

/// Canonical form used for duplicate detection.
///
/// Trims whitespace, assumes `https://` when no scheme is given, lowercases
/// scheme and host, and drops the default port, a trailing host dot and the
/// fragment. Path and query are kept verbatim.
///
/// Only syntax is checked here; the fetch guard applies the address policy.
///
/// # Examples
///
/// ```
/// use feedgate::import::normalize_feed_url;
///
/// assert_eq!(
///     normalize_feed_url(" Example.COM.:443/Feed?x=1#top").unwrap(),
///     "https://example.com/Feed?x=1"
/// );
/// ```
pub fn normalize_feed_url(raw: &str) -> Result<String, UrlValidationError> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };

    let mut url = Url::parse(&with_scheme)?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlValidationError::UnsupportedScheme(other.to_owned())),
    }

    if let Some(Host::Domain(host)) = url.host() {
        let host = host.trim_end_matches('.').to_owned();
        if host.is_empty() {
            return Err(UrlValidationError::MissingHost);
        }
        url.set_host(Some(&host))?;
    } else if url.host().is_none() {
        return Err(UrlValidationError::MissingHost);
    }

    url.set_fragment(None);
    Ok(url.into())
}

/// Whether a validated candidate would create a new feed or matches one the
/// user already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Addable,
    Duplicate,
}

/// Which candidate, if any, an entry resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Addable(usize),
    Duplicate(usize),
    /// Several plausible feeds and the caller asked not to guess
    Ambiguous,
    None,
}

/// Picks a candidate from validated candidates in discovery order.
///
/// - exactly one addable: that one, whatever the duplicates
/// - several addable with `skip_ambiguous`: [`Selection::Ambiguous`]
/// - no addable, several duplicates with `skip_ambiguous`: [`Selection::Ambiguous`]
/// - otherwise the first addable, else the first duplicate
pub fn select_candidate(candidates: &[CandidateKind], skip_ambiguous: bool) -> Selection {
    let addable: Vec<usize> = positions(candidates, CandidateKind::Addable);
    let duplicates: Vec<usize> = positions(candidates, CandidateKind::Duplicate);

    if let [only] = addable.as_slice() {
        return Selection::Addable(*only);
    }
    if skip_ambiguous && (addable.len() > 1 || (addable.is_empty() && duplicates.len() > 1)) {
        return Selection::Ambiguous;
    }
    if let Some(&first) = addable.first() {
        return Selection::Addable(first);
    }
    if let Some(&first) = duplicates.first() {
        return Selection::Duplicate(first);
    }
    Selection::None
}

fn positions(candidates: &[CandidateKind], kind: CandidateKind) -> Vec<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, k)| **k == kind)
        .map(|(i, _)| i)
        .collect()
}

/// Union of current and requested folder ids, or `None` when the union adds
/// nothing (no write needed).
pub fn merge_folder_ids(current: &[i64], requested: &[i64]) -> Option<Vec<i64>> {
    let existing: BTreeSet<i64> = current.iter().copied().collect();
    let union: BTreeSet<i64> = existing.iter().chain(requested).copied().collect();
    if union.len() == existing.len() {
        return None;
    }
    Some(union.into_iter().collect())
}
