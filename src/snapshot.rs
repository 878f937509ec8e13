//! Versioned JSON snapshot of the cache, written at shutdown and read at startup.

use std::fs;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{Cache, CacheEntry, Clock};
use crate::dns_message::RecordSets;
use crate::dns_question_and_answer::{DnsQuestion, ResourceRecord};
use crate::error::SnapshotError;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    question: DnsQuestion,
    answer: Vec<ResourceRecord>,
    authority: Vec<ResourceRecord>,
    additional: Vec<ResourceRecord>,
    cached_at_ms: u64,
}

/// Only the version field, so a future format can be told apart before the
/// rest of the document is interpreted
#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Only entries that are still fresh are written
pub fn encode<C: Clock>(cache: &Cache<C>) -> Result<Vec<u8>, SnapshotError> {
    let entries = cache
        .entries()
        .map(|(question, entry)| SnapshotEntry {
            question: question.clone(),
            answer: entry.records.answer.clone(),
            authority: entry.records.authority.clone(),
            additional: entry.records.additional.clone(),
            cached_at_ms: entry
                .cached_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        })
        .collect();

    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        entries,
    };
    Ok(serde_json::to_vec_pretty(&snapshot)?)
}

/// The whole document is parsed before the first entry is restored, so a
/// failed decode leaves `cache` untouched
pub fn decode_into<C: Clock>(bytes: &[u8], cache: &mut Cache<C>) -> Result<(), SnapshotError> {
    let probe: VersionProbe = serde_json::from_slice(bytes)?;
    if probe.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(probe.version));
    }

    let snapshot: Snapshot = serde_json::from_slice(bytes)?;
    for entry in snapshot.entries {
        let records = RecordSets {
            answer: entry.answer,
            authority: entry.authority,
            additional: entry.additional,
        };
        let cached_at = UNIX_EPOCH + Duration::from_millis(entry.cached_at_ms);
        cache.restore(entry.question, CacheEntry { records, cached_at });
    }
    Ok(())
}

/// Load a snapshot into `cache`. A missing or unreadable file leaves the cache empty.
pub fn load<C: Clock>(path: &Path, mut cache: Cache<C>) -> Cache<C> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            info!("No cache snapshot loaded from {}: {}", path.display(), e);
            return cache;
        }
    };

    if let Err(e) = decode_into(&bytes, &mut cache) {
        warn!("Ignoring cache snapshot {}: {}", path.display(), e);
        return cache;
    }

    if cache.is_empty() {
        info!("Cache snapshot {} holds no entries", path.display());
    } else {
        info!("Loaded {} cache entries from {}", cache.len(), path.display());
    }
    cache
}

/// Write the snapshot, going through a temporary file so a crash mid-write
/// cannot leave a truncated snapshot behind
pub fn save<C: Clock>(path: &Path, cache: &Cache<C>) -> Result<(), SnapshotError> {
    let bytes = encode(cache)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    info!("Saved {} cache entries to {}", cache.entries().count(), path.display());
    Ok(())
}
