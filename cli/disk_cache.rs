// Copyright 2024-2026 the Bungae authors. MIT license.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

use crate::checksum;
use crate::fs_util;

/// One cached transform result. Entries are keyed on the pair of source
/// content hash and build config fingerprint, so a change to either makes
/// the old entry unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub code: String,
  pub source_map: Option<String>,
  pub dependencies: Vec<String>,
  pub content_hash: String,
  pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
  pub entries: usize,
  pub total_bytes: u64,
}

/// Content-addressed store of transform outputs, one JSON file per entry.
/// Writes go through a temp file and rename, so concurrent readers never
/// observe torn entries and no cross-process locking is needed.
#[derive(Debug, Clone)]
pub struct TransformCache {
  location: PathBuf,
  max_age_secs: u64,
}

impl TransformCache {
  pub fn new(location: PathBuf, max_age_secs: u64) -> Self {
    Self {
      location,
      max_age_secs,
    }
  }

  pub fn location(&self) -> &Path {
    &self.location
  }

  fn entry_path(&self, content_hash: &str, config_fingerprint: &str) -> PathBuf {
    let fingerprint = checksum::gen(&[content_hash, config_fingerprint]);
    self.location.join(format!("{}.json", fingerprint))
  }

  /// Returns the cached entry, or `None` on miss, corruption, staleness or
  /// content hash mismatch. Read failures are misses, never errors.
  pub fn get(
    &self,
    content_hash: &str,
    config_fingerprint: &str,
  ) -> Option<CacheEntry> {
    let path = self.entry_path(content_hash, config_fingerprint);
    let bytes = fs::read(&path).ok()?;
    let entry: CacheEntry = match serde_json::from_slice(&bytes) {
      Ok(entry) => entry,
      Err(err) => {
        log::warn!("ignoring corrupt cache entry {}: {}", path.display(), err);
        return None;
      }
    };
    if entry.content_hash != content_hash {
      return None;
    }
    let age = unix_now().saturating_sub(entry.created_at);
    if age > self.max_age_secs {
      return None;
    }
    Some(entry)
  }

  pub fn set(
    &self,
    content_hash: &str,
    config_fingerprint: &str,
    entry: &CacheEntry,
  ) -> io::Result<()> {
    self.ensure_dir_exists()?;
    let path = self.entry_path(content_hash, config_fingerprint);
    let data = serde_json::to_vec(entry)
      .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs_util::atomic_write_file(&path, data)
  }

  pub fn clear(&self) -> io::Result<()> {
    if !self.location.is_dir() {
      return Ok(());
    }
    for entry in fs::read_dir(&self.location)? {
      let entry = entry?;
      if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
        fs::remove_file(entry.path())?;
      }
    }
    Ok(())
  }

  pub fn stats(&self) -> CacheStats {
    let mut stats = CacheStats::default();
    let Ok(dir) = fs::read_dir(&self.location) else {
      return stats;
    };
    for entry in dir.filter_map(|e| e.ok()) {
      if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
        continue;
      }
      stats.entries += 1;
      if let Ok(metadata) = entry.metadata() {
        stats.total_bytes += metadata.len();
      }
    }
    stats
  }

  fn ensure_dir_exists(&self) -> io::Result<()> {
    if self.location.is_dir() {
      return Ok(());
    }
    fs::create_dir_all(&self.location)
  }
}

pub fn unix_now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn entry(content_hash: &str) -> CacheEntry {
    CacheEntry {
      code: "const a = require(dependencyMap[0]);".to_string(),
      source_map: None,
      dependencies: vec!["./a".to_string()],
      content_hash: content_hash.to_string(),
      created_at: unix_now(),
    }
  }

  #[test]
  fn test_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let cache = TransformCache::new(temp_dir.path().join("cache"), 3600);
    assert_eq!(cache.get("h1", "cfg"), None);
    cache.set("h1", "cfg", &entry("h1")).unwrap();
    assert_eq!(cache.get("h1", "cfg"), Some(entry("h1")));
    // A different config fingerprint addresses a different entry.
    assert_eq!(cache.get("h1", "cfg2"), None);
  }

  #[test]
  fn test_stale_by_age() {
    let temp_dir = TempDir::new().unwrap();
    let cache = TransformCache::new(temp_dir.path().join("cache"), 60);
    let mut old = entry("h1");
    old.created_at = unix_now() - 120;
    cache.set("h1", "cfg", &old).unwrap();
    assert_eq!(cache.get("h1", "cfg"), None);
  }

  #[test]
  fn test_content_hash_mismatch_is_a_miss() {
    let temp_dir = TempDir::new().unwrap();
    let cache = TransformCache::new(temp_dir.path().join("cache"), 3600);
    let mut bad = entry("other");
    bad.content_hash = "other".to_string();
    cache.set("h1", "cfg", &bad).unwrap();
    assert_eq!(cache.get("h1", "cfg"), None);
  }

  #[test]
  fn test_corrupt_entry_is_a_miss() {
    let temp_dir = TempDir::new().unwrap();
    let location = temp_dir.path().join("cache");
    let cache = TransformCache::new(location.clone(), 3600);
    cache.set("h1", "cfg", &entry("h1")).unwrap();
    for file in fs::read_dir(&location).unwrap() {
      fs::write(file.unwrap().path(), b"not json").unwrap();
    }
    assert_eq!(cache.get("h1", "cfg"), None);
  }

  #[test]
  fn test_clear_and_stats() {
    let temp_dir = TempDir::new().unwrap();
    let cache = TransformCache::new(temp_dir.path().join("cache"), 3600);
    assert_eq!(cache.stats(), CacheStats::default());
    cache.set("h1", "cfg", &entry("h1")).unwrap();
    cache.set("h2", "cfg", &entry("h2")).unwrap();
    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert!(stats.total_bytes > 0);
    cache.clear().unwrap();
    assert_eq!(cache.stats().entries, 0);
  }

  #[test]
  fn test_overwrite() {
    let temp_dir = TempDir::new().unwrap();
    let cache = TransformCache::new(temp_dir.path().join("cache"), 3600);
    cache.set("h1", "cfg", &entry("h1")).unwrap();
    let mut updated = entry("h1");
    updated.code = "updated".to_string();
    cache.set("h1", "cfg", &updated).unwrap();
    assert_eq!(cache.get("h1", "cfg").unwrap().code, "updated");
  }
}
