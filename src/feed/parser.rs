use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::util::{clean_label, strip_control_chars, MAX_TITLE_CHARS};

#[derive(Debug, Error)]
pub enum ParseError {
    /// The document is not an RSS, Atom or JSON feed
    #[error("not a valid feed: {0}")]
    NotAFeed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub guid: String,
    pub title: String,
    pub link: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    /// Unix timestamp (seconds)
    pub published_at: Option<i64>,
}

pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = parser::parse(bytes).map_err(|e| ParseError::NotAFeed(e.to_string()))?;

    let title = feed
        .title
        .and_then(|t| clean_label(&t.content, MAX_TITLE_CHARS));
    let description = feed
        .description
        .map(|d| strip_control_chars(d.content.trim()).into_owned())
        .filter(|d| !d.is_empty());
    let site_url = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .map(|l| l.href.clone());

    let items: Vec<ParsedItem> = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published_at = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .map(|c| strip_control_chars(&c).into_owned());
            let title = entry
                .title
                .and_then(|t| clean_label(&t.content, MAX_TITLE_CHARS))
                .unwrap_or_else(|| "Untitled".to_string());
            let author = entry
                .authors
                .first()
                .and_then(|p| clean_label(&p.name, MAX_TITLE_CHARS));

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let guid = generate_guid(existing_id, link.as_deref(), &title, published_at);

            ParsedItem {
                guid,
                title,
                link,
                content,
                author,
                published_at,
            }
        })
        .collect();

    Ok(ParsedFeed {
        title,
        description,
        site_url,
        items,
    })
}

fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
