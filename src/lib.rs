//! Safe feed acquisition.
//!
//! Turns user-supplied URLs (one at a time or a whole import file) into
//! subscriptions: SSRF-guarded fetching, feed discovery for plain website
//! URLs, a deadline-bounded concurrent importer with duplicate merging, and
//! a sliding-window rate limiter in front of it all.

pub mod config;
pub mod feed;
pub mod import;
pub mod ratelimit;
pub mod storage;
pub mod util;
