use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tracing::trace;

use crate::dns_message::RecordSets;
use crate::dns_question_and_answer::DnsQuestion;

/// Source of "now" for cache validity checks
pub trait Clock {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Records cached for one question. Replaced as a whole, never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub records: RecordSets,
    pub cached_at: SystemTime,
}

impl CacheEntry {
    /// An entry stays valid while every record's TTL is strictly greater than
    /// the time elapsed since it was cached.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        // a clock that went backwards counts as no time elapsed
        let elapsed = now.duration_since(self.cached_at).unwrap_or(Duration::ZERO);
        self.records
            .iter()
            .all(|record| Duration::from_secs(u64::from(record.ttl)) > elapsed)
    }
}

/// Question -> records map with TTL-bounded lookups. Expired entries are
/// dropped lazily when a lookup finds them.
#[derive(Debug)]
pub struct Cache<C: Clock = SystemClock> {
    entries: HashMap<DnsQuestion, CacheEntry>,
    clock: C,
}

impl Cache<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for Cache<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Cache<C> {
    pub fn with_clock(clock: C) -> Self {
        Cache {
            entries: HashMap::new(),
            clock,
        }
    }

    pub fn lookup(&mut self, question: &DnsQuestion) -> Option<RecordSets> {
        let now = self.clock.now();
        let entry = self.entries.get(question)?;

        if entry.is_fresh(now) {
            return Some(entry.records.clone());
        }

        trace!(question = %question.describe(), "evicting expired cache entry");
        self.entries.remove(question);
        None
    }

    pub fn insert(&mut self, question: DnsQuestion, records: RecordSets) {
        let cached_at = self.clock.now();
        self.entries.insert(question, CacheEntry { records, cached_at });
    }

    /// Drop the entry for `question`, if any
    pub fn remove(&mut self, question: &DnsQuestion) {
        self.entries.remove(question);
    }

    /// Existence check that ignores expiry
    pub fn contains(&self, question: &DnsQuestion) -> bool {
        self.entries.contains_key(question)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries still valid right now; stale ones that were never looked up
    /// again are skipped
    pub fn entries(&self) -> impl Iterator<Item = (&DnsQuestion, &CacheEntry)> {
        let now = self.clock.now();
        self.entries.iter().filter(move |(_, entry)| entry.is_fresh(now))
    }

    /// Put back an entry read from a snapshot, keeping its original timestamp
    pub fn restore(&mut self, question: DnsQuestion, entry: CacheEntry) {
        self.entries.insert(question, entry);
    }
}
