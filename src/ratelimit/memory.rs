use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use super::{RateLimitDecision, StoreUnavailable, WindowStore};

/// Calls between sweeps for keys whose window has fully drained.
const SWEEP_EVERY: u64 = 1024;

/// Stamps of one key, trimmed against the window that key was last
/// evaluated with.
#[derive(Debug)]
struct KeyWindow {
    window_ms: i64,
    stamps: VecDeque<i64>,
}

impl KeyWindow {
    fn trim(&mut self, now_ms: i64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while self.stamps.front().is_some_and(|first| *first <= cutoff) {
            self.stamps.pop_front();
        }
    }

    fn is_drained(&self, now_ms: i64) -> bool {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        self.stamps.back().map_or(true, |last| *last <= cutoff)
    }
}

#[derive(Debug, Default)]
struct Windows {
    keys: HashMap<String, KeyWindow>,
    calls: u64,
}

/// Per-process window store. Not shared between machines.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: Mutex<Windows>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every key whose own window has drained by `now_ms`.
    pub fn purge_drained(&self, now_ms: i64) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.keys.retain(|_, w| !w.is_drained(now_ms));
    }

    fn check(&self, key: &str, limit: u32, window_ms: i64, now_ms: i64) -> RateLimitDecision {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        windows.calls = windows.calls.wrapping_add(1);
        if windows.calls % SWEEP_EVERY == 0 {
            windows.keys.retain(|_, w| !w.is_drained(now_ms));
        }

        let entry = windows
            .keys
            .entry(key.to_owned())
            .or_insert_with(|| KeyWindow {
                window_ms,
                stamps: VecDeque::new(),
            });
        entry.window_ms = window_ms;
        entry.trim(now_ms);

        let count = u32::try_from(entry.stamps.len()).unwrap_or(u32::MAX);
        if count < limit {
            entry.stamps.push_back(now_ms);
            return RateLimitDecision::allow(limit - count - 1);
        }

        let retry_ms = entry
            .stamps
            .front()
            .map_or(window_ms, |oldest| oldest + window_ms - now_ms);
        if entry.stamps.is_empty() {
            windows.keys.remove(key);
        }
        RateLimitDecision::deny(retry_ms)
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<RateLimitDecision, StoreUnavailable> {
        Ok(self.check(key, limit, window_ms, now_ms))
    }
}
