//! Fetching, discovering and parsing remote feeds.
//!
//! - [`guard`] - SSRF policy applied to every fetch target and connection
//! - [`fetcher`] - HTTP client with manual redirects, retries and conditional GET
//! - [`discovery`] - Candidate feed URLs for a website
//! - [`parser`] - RSS/Atom/JSON Feed parsing using the `feed-rs` crate
//! - [`refresh`] - User-triggered re-fetch of a stored feed
//!
//! # Example
//!
//! ```no_run
//! use feedgate::feed::{discover_feed_candidates, FetchSettings, SafeFetcher};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = SafeFetcher::new(FetchSettings::default())?;
//! let found = discover_feed_candidates(&fetcher, "https://example.com").await?;
//! for url in &found.candidates {
//!     println!("{url} ({:?})", found.methods[url]);
//! }
//! # Ok(())
//! # }
//! ```

pub mod discovery;
pub mod fetcher;
pub mod guard;
pub mod parser;
pub mod refresh;

pub use discovery::{discover_feed_candidates, DiscoveryMethod, DiscoveryResult, MAX_CANDIDATES};
pub use fetcher::{
    FetchError, FetchOutcome, FetchSettings, RemoteFetchRequest, RemoteFetchResult, SafeFetcher,
    Validators,
};
pub use guard::{BlockedAddress, HostResolver, SystemResolver, TargetGuard};
pub use parser::{parse_feed, ParseError, ParsedFeed, ParsedItem};
pub use refresh::{refresh_feed, RefreshError, RefreshOutcome};
