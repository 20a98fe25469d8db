//! Run-scoped single-flight scrape cache.
//!
//! Keyed by canonical URL. Concurrent requests for the same key join one
//! in-flight fetch; the completed result (including a failed fetch, stored
//! as `None`) is shared with every later caller. The verifier consumes the
//! same cache so verification never re-fetches what the run already saw.

use crate::types::{canonical_url, ScrapedContent};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

type Slot = Arc<OnceCell<Option<ScrapedContent>>>;

#[derive(Default)]
pub struct ScrapeCache {
    entries: Mutex<HashMap<String, Slot>>,
}

impl ScrapeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `url`, fetching at most once per key.
    ///
    /// The fetch closure runs only for the first caller; concurrent callers
    /// for the same canonical URL await the same in-flight future.
    pub async fn get_or_fetch<F, Fut>(&self, url: &str, fetch: F) -> Option<ScrapedContent>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<ScrapedContent>>,
    {
        let key = canonical_url(url);
        let slot = {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            entries.entry(key).or_default().clone()
        };
        slot.get_or_init(fetch).await.clone()
    }

    /// Peek at a completed cache entry without triggering a fetch.
    ///
    /// Outer `None` means the URL was never attempted; `Some(None)` means
    /// it was attempted and failed.
    pub fn peek(&self, url: &str) -> Option<Option<ScrapedContent>> {
        let key = canonical_url(url);
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(&key).and_then(|slot| slot.get().cloned())
    }

    /// Number of keys ever requested.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle used by the scraper and verifier.
pub type SharedScrapeCache = Arc<ScrapeCache>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExtractorTier;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn content(url: &str) -> ScrapedContent {
        ScrapedContent {
            url: url.to_string(),
            title: "t".into(),
            markdown_body: "body".into(),
            retrieved_at: Utc::now(),
            extractor_tier: ExtractorTier::Primary,
            tables_found: 0,
            tables_converted: 0,
        }
    }

    #[tokio::test]
    async fn test_fetch_happens_once() {
        let cache = ScrapeCache::new();
        let fetches = AtomicUsize::new(0);

        for _ in 0..3 {
            let got = cache
                .get_or_fetch("https://example.com/a", || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Some(content("https://example.com/a"))
                })
                .await;
            assert!(got.is_some());
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache = Arc::new(ScrapeCache::new());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("https://example.com/shared", move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        Some(content("https://example.com/shared"))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canonical_keys_dedupe() {
        let cache = ScrapeCache::new();
        let fetches = AtomicUsize::new(0);

        let urls = [
            "https://Example.com/page",
            "https://example.com/page#frag",
            "https://example.com/page/",
        ];
        for url in urls {
            cache
                .get_or_fetch(url, || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Some(content(url))
                })
                .await;
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_cached() {
        let cache = ScrapeCache::new();
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            let got = cache
                .get_or_fetch("https://example.com/broken", || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    None
                })
                .await;
            assert!(got.is_none());
        }
        // Failure is a completed result, not retried.
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek("https://example.com/broken"), Some(None));
    }

    #[tokio::test]
    async fn test_peek_without_fetch() {
        let cache = ScrapeCache::new();
        assert_eq!(cache.peek("https://example.com/never"), None);
        assert!(cache.is_empty());
    }
}
