//! Utility functions for common operations.
//!
//! This module provides reusable utilities for:
//!
//! - **URL validation**: the DNS-independent half of the SSRF policy and the
//!   private/reserved address deny-list
//! - **Text processing**: sanitizing titles and folder names from untrusted input
//!
//! # Examples
//!
//! ```
//! use feedgate::util::{clean_label, validate_url};
//!
//! // Validate a feed URL
//! let url = validate_url("https://example.com/feed.xml").unwrap();
//!
//! // Normalize a folder name from an import file
//! assert_eq!(clean_label("  Tech \t News ", 100).as_deref(), Some("Tech News"));
//! ```

mod text;
mod url_validator;

pub use text::{
    clean_label, folder_key, strip_control_chars, MAX_FOLDER_NAME_CHARS, MAX_TITLE_CHARS,
};
pub use url_validator::{
    is_blocked_hostname, is_blocked_ip, normalize_host, validate_parsed_url, validate_url,
    UrlValidationError,
};
