use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;
use thiserror::Error;

use super::ImportEntry;
use crate::util::{clean_label, MAX_FOLDER_NAME_CHARS, MAX_TITLE_CHARS};

/// Maximum nesting depth of OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

/// Maximum size of an import file.
const MAX_IMPORT_FILE_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("import file is {size} bytes (limit {max})")]
    TooLarge { size: u64, max: u64 },
}

/// Reads import entries from a file on disk. See [`parse_import_text`].
pub async fn parse_import_file(path: &Path) -> Result<Vec<ImportEntry>> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat import file: {}", path.display()))?;
    if metadata.len() > MAX_IMPORT_FILE_BYTES {
        return Err(SourceError::TooLarge {
            size: metadata.len(),
            max: MAX_IMPORT_FILE_BYTES,
        }
        .into());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;
    parse_import_text(&content)
        .with_context(|| format!("Failed to parse import file: {}", path.display()))
}

/// Parses an import document.
///
/// OPML is detected by its root element. Anything else is read as a plain
/// list with one entry per line:
///
/// ```text
/// # comment
/// https://example.com/feed.xml
/// example.org | Tech, News
/// https://blog.example.net/ | Reading | My title
/// ```
///
/// URLs are passed through untouched; validation happens per entry during
/// import so that bad lines show up as failed rows.
pub fn parse_import_text(content: &str) -> Result<Vec<ImportEntry>, SourceError> {
    if looks_like_opml(content) {
        parse_opml(content)
    } else {
        Ok(parse_line_list(content))
    }
}

fn looks_like_opml(content: &str) -> bool {
    let head: String = content
        .trim_start_matches('\u{feff}')
        .trim_start()
        .chars()
        .take(512)
        .collect::<String>()
        .to_lowercase();
    head.starts_with("<?xml") || head.starts_with("<opml") || head.contains("<opml")
}

fn parse_line_list(content: &str) -> Vec<ImportEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let mut parts = line.splitn(3, '|').map(str::trim);
            let url = parts.next().unwrap_or_default().to_owned();
            let folders = parts
                .next()
                .map(|f| f.split(',').filter_map(folder_name).collect())
                .unwrap_or_default();
            let title = parts.next().and_then(|t| clean_label(t, MAX_TITLE_CHARS));
            ImportEntry {
                url,
                folders,
                title,
            }
        })
        .collect()
}

fn folder_name(raw: &str) -> Option<String> {
    clean_label(raw, MAX_FOLDER_NAME_CHARS)
}

/// Attributes of one `<outline>` relevant to import.
#[derive(Default)]
struct Outline {
    xml_url: Option<String>,
    label: Option<String>,
    categories: Vec<String>,
}

/// Walks the outline tree. Outlines with an `xmlUrl` become entries; the
/// nearest enclosing outline without one names their folder, as do the
/// entries of a `category` attribute (`/Tech/Rust` contributes `Rust`).
fn parse_opml(content: &str) -> Result<Vec<ImportEntry>, SourceError> {
    // quick-xml never expands <!ENTITY> declarations; unknown entities are
    // an unescape error rather than a file read.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    // One slot per open outline: the folder it names, if it is a category
    let mut open: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if open.len() >= MAX_OPML_DEPTH {
                    return Err(SourceError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let outline = read_outline(&e, &reader)?;
                let names_folder = if outline.xml_url.is_none() {
                    outline.label.clone()
                } else {
                    None
                };
                if let Some(entry) = into_entry(outline, &open) {
                    entries.push(entry);
                }
                open.push(names_folder);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let outline = read_outline(&e, &reader)?;
                if let Some(entry) = into_entry(outline, &open) {
                    entries.push(entry);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                open.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::XmlParse(e.to_string())),
            _ => {}
        }
    }

    Ok(entries)
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline, SourceError> {
    let mut outline = Outline::default();
    let mut title = None;
    let mut text = None;

    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || {
            attr.decode_and_unescape_value(reader.decoder())
                .map(|v| v.into_owned())
                .map_err(|e| SourceError::XmlParse(e.to_string()))
        };
        match attr.key.as_ref() {
            b"xmlUrl" => outline.xml_url = Some(value()?.trim().to_owned()),
            b"title" => title = Some(value()?),
            b"text" => text = Some(value()?),
            b"category" => {
                outline.categories = value()?
                    .split(',')
                    .filter_map(|c| c.rsplit('/').find(|s| !s.trim().is_empty()))
                    .filter_map(folder_name)
                    .collect();
            }
            _ => {}
        }
    }

    outline.label = title
        .and_then(|t| clean_label(&t, MAX_TITLE_CHARS))
        .or_else(|| text.and_then(|t| clean_label(&t, MAX_TITLE_CHARS)));
    outline.xml_url = outline.xml_url.filter(|u| !u.is_empty());
    Ok(outline)
}

fn into_entry(outline: Outline, open: &[Option<String>]) -> Option<ImportEntry> {
    let url = outline.xml_url?;
    let mut folders: Vec<String> = open
        .iter()
        .rev()
        .find_map(|slot| slot.as_deref())
        .and_then(folder_name)
        .into_iter()
        .collect();
    for category in outline.categories {
        if !folders.iter().any(|f| f.eq_ignore_ascii_case(&category)) {
            folders.push(category);
        }
    }
    Some(ImportEntry {
        url,
        folders,
        title: outline.label,
    })
}
