use serde::Serialize;
use std::collections::HashMap;
use url::{Host, Url};

use super::fetcher::{parse_target, FetchError, RemoteFetchRequest, SafeFetcher};

/// Maximum number of candidates returned for one site.
pub const MAX_CANDIDATES: usize = 5;

/// Conventional feed paths tried when a page advertises no feed.
const HEURISTIC_PATHS: &[&str] = &["/feed", "/feed.xml", "/rss", "/rss.xml", "/atom.xml"];

/// How a candidate URL was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    HtmlAlternate,
    HeuristicPath,
}

/// Ordered feed candidates for a site, best first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryResult {
    pub candidates: Vec<String>,
    pub methods: HashMap<String, DiscoveryMethod>,
}

impl DiscoveryResult {
    fn push(&mut self, url: String, method: DiscoveryMethod) {
        if self.candidates.len() >= MAX_CANDIDATES || self.methods.contains_key(&url) {
            return;
        }
        self.methods.insert(url.clone(), method);
        self.candidates.push(url);
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Finds candidate feed URLs for a website.
///
/// Fetches the page, collects `<link rel="alternate">` RSS/Atom links and
/// falls back to conventional paths when there are none. Candidates are not
/// fetched here; the caller validates them.
///
/// If the host cannot be reached at all, the `www.` variant is tried once.
///
/// # Errors
///
/// - [`FetchError::InvalidUrl`] / [`FetchError::Blocked`] for rejected input
/// - the fetch error of the last attempt when the site is unreachable
///
/// A page that answers with an error status or with something other than
/// HTML still yields the heuristic candidates.
pub async fn discover_feed_candidates(
    fetcher: &SafeFetcher,
    site_url: &str,
) -> Result<DiscoveryResult, FetchError> {
    let start = parse_target(site_url)?;

    match discover_from(fetcher, &start).await {
        Err(e) if e.is_unreachable() => {
            let Some(www) = with_www(&start) else {
                return Err(e);
            };
            tracing::debug!(url = %start, retry = %www, error = %e, "Site unreachable, trying www host");
            discover_from(fetcher, &www).await
        }
        other => other,
    }
}

async fn discover_from(fetcher: &SafeFetcher, page: &Url) -> Result<DiscoveryResult, FetchError> {
    let (base, links) = match fetcher
        .fetch_remote_text(&RemoteFetchRequest::html(page.as_str()))
        .await
    {
        Ok(result) => {
            let links = match result.body() {
                Some(body) if result.looks_like_html() || sniff_html(body) => {
                    find_feed_links_in_html(body, &result.final_url)
                }
                _ => Vec::new(),
            };
            (result.final_url, links)
        }
        Err(e) if matches!(e.root(), FetchError::HttpStatus(_) | FetchError::ResponseTooLarge) => {
            tracing::debug!(url = %page, error = %e, "Page fetch failed, using heuristic paths");
            (page.clone(), Vec::new())
        }
        Err(e) => return Err(e),
    };

    let mut result = DiscoveryResult::default();
    for link in links.into_iter().filter(|l| !is_comment_feed(l)) {
        result.push(link.to_string(), DiscoveryMethod::HtmlAlternate);
    }
    if result.is_empty() {
        for path in HEURISTIC_PATHS {
            if let Ok(candidate) = base.join(path) {
                result.push(candidate.to_string(), DiscoveryMethod::HeuristicPath);
            }
        }
    }

    tracing::debug!(url = %base, candidates = result.candidates.len(), "Feed discovery finished");
    Ok(result)
}

/// `https://example.com/` becomes `https://www.example.com/`. `None` for IP
/// hosts and hosts that already start with `www.`.
fn with_www(url: &Url) -> Option<Url> {
    let Some(Host::Domain(host)) = url.host() else {
        return None;
    };
    if host.starts_with("www.") {
        return None;
    }
    let mut www = url.clone();
    www.set_host(Some(&format!("www.{host}"))).ok()?;
    Some(www)
}

fn sniff_html(body: &str) -> bool {
    let head: String = body.chars().take(1024).collect::<String>().to_lowercase();
    head.contains("<html") || head.contains("<!doctype html")
}

/// Comment feeds (`/comments/feed`, `/post/1/comment/rss`) are never the
/// site's main feed.
fn is_comment_feed(url: &Url) -> bool {
    url.path_segments().map_or(false, |mut segments| {
        segments.any(|s| s.eq_ignore_ascii_case("comments") || s.eq_ignore_ascii_case("comment"))
    })
}

/// Scans HTML for `<link>` tags with `rel="alternate"` and RSS/Atom type attributes.
///
/// Uses simple string scanning (no HTML parser dependency). Handles attribute
/// ordering variations, single or double quotes, and `rel` values with
/// several tokens. Relative URLs are resolved against `base`; links that do
/// not resolve to an HTTP(S) URL are skipped.
///
/// Returns links in document order.
fn find_feed_links_in_html(html: &str, base: &Url) -> Vec<Url> {
    let html_lower = html.to_ascii_lowercase();
    let mut found = Vec::new();
    let mut search_from = 0;

    while let Some(link_start) = html_lower[search_from..].find("<link") {
        let abs_start = search_from + link_start;
        let remaining = &html_lower[abs_start..];

        // Find the end of this <link> tag
        let tag_end = match remaining.find('>') {
            Some(pos) => pos,
            None => break,
        };

        let tag = &remaining[..=tag_end];

        if has_rel_token(tag, "alternate") && is_feed_type(tag) {
            // Extract href from the original HTML to preserve URL case
            let original_tag = &html[abs_start..abs_start + tag_end + 1];
            if let Some(resolved) = extract_attr_value(original_tag, "href")
                .and_then(|href| resolve_url(href.trim(), base))
            {
                found.push(resolved);
            }
        }

        search_from = abs_start + tag_end + 1;
    }

    found
}

fn has_rel_token(tag: &str, token: &str) -> bool {
    extract_attr_value(tag, "rel")
        .map_or(false, |rel| rel.split_ascii_whitespace().any(|t| t == token))
}

/// Checks if a lowercased `<link>` tag has an RSS or Atom feed type.
fn is_feed_type(tag: &str) -> bool {
    extract_attr_value(tag, "type").map_or(false, |ty| {
        let mime = ty.split(';').next().unwrap_or("").trim();
        mime == "application/rss+xml" || mime == "application/atom+xml"
    })
}

/// Extracts the value of an attribute from a tag string (case-preserving).
///
/// The attribute name must be preceded by whitespace so `data-href` does not
/// match `href`. Unquoted values run to the next whitespace or `>`.
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_ascii_lowercase();
    let bytes = tag_lower.as_bytes();
    let mut from = 0;

    let value_start = loop {
        let pos = from + tag_lower[from..].find(attr_name)?;
        let preceded_ok = pos > 0 && bytes[pos - 1].is_ascii_whitespace();
        let mut cursor = pos + attr_name.len();
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if preceded_ok && bytes.get(cursor) == Some(&b'=') {
            cursor += 1;
            while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
                cursor += 1;
            }
            break cursor;
        }
        from = pos + attr_name.len();
    };

    let rest = tag.get(value_start..)?;
    match rest.as_bytes().first()? {
        quote @ (b'"' | b'\'') => {
            let inner = &rest[1..];
            let end = inner.find(*quote as char)?;
            Some(&inner[..end])
        }
        _ => {
            let end = rest
                .find(|c: char| c.is_ascii_whitespace() || c == '>')
                .unwrap_or(rest.len());
            let value = rest[..end].trim_end_matches('/');
            (!value.is_empty()).then_some(value)
        }
    }
}

/// Resolves a potentially relative URL against the page URL.
fn resolve_url(href: &str, base: &Url) -> Option<Url> {
    if href.is_empty() {
        return None;
    }
    let resolved = base.join(href).ok()?;
    matches!(resolved.scheme(), "http" | "https").then_some(resolved)
}
