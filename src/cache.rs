//! Time-bounded cache of rendered pages.
//!
//! Entries expire on inactivity, not on count: a page not read for
//! `max_age` is dropped by the next [`PageCache::sweep`]. Reads refresh the
//! access time. Every removal goes through the optional [`ImageReleaser`], so
//! resources tied to an image (a texture, a temp file) are freed exactly
//! once.

use crate::protocol::{DocumentId, PageImage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Cache key for rendered pages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub document_id: DocumentId,
    /// 1-indexed
    pub page_number: usize,
}

/// Hook run for every image leaving the cache.
pub trait ImageReleaser: Send + Sync {
    fn release(&self, key: &CacheKey, image: &PageImage);
}

impl<F> ImageReleaser for F
where
    F: Fn(&CacheKey, &PageImage) + Send + Sync,
{
    fn release(&self, key: &CacheKey, image: &PageImage) {
        self(key, image)
    }
}

struct CacheEntry {
    image: PageImage,
    last_accessed: Instant,
}

pub struct PageCache {
    entries: HashMap<CacheKey, CacheEntry>,
    max_age: Duration,
    releaser: Option<Arc<dyn ImageReleaser>>,
}

impl PageCache {
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_age,
            releaser: None,
        }
    }

    #[must_use]
    pub fn with_releaser(mut self, releaser: Arc<dyn ImageReleaser>) -> Self {
        self.releaser = Some(releaser);
        self
    }

    /// Get a cached page and refresh its access time.
    pub fn get(&mut self, key: &CacheKey, now: Instant) -> Option<PageImage> {
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed = now;
        Some(entry.image.clone())
    }

    /// Check if a key is in the cache without touching it
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: CacheKey, image: PageImage, now: Instant) {
        let previous = self.entries.insert(
            key,
            CacheEntry {
                image,
                last_accessed: now,
            },
        );
        if let Some(old) = previous {
            self.release(&key, &old.image);
        }
    }

    /// Drop every entry idle for longer than `max_age`. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let max_age = self.max_age;
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_accessed) > max_age)
            .map(|(k, _)| *k)
            .collect();

        for key in &expired {
            if let Some(entry) = self.entries.remove(key) {
                self.release(key, &entry.image);
            }
        }
        expired.len()
    }

    /// Drop everything. Returns how many entries were released.
    pub fn clear(&mut self) -> usize {
        let drained: Vec<(CacheKey, CacheEntry)> = self.entries.drain().collect();
        for (key, entry) in &drained {
            self.release(key, &entry.image);
        }
        drained.len()
    }

    fn release(&self, key: &CacheKey, image: &PageImage) {
        if let Some(releaser) = &self.releaser {
            releaser.release(key, image);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}
