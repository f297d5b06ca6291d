use crate::error::{Result, ScopeError};
use crate::utils::atomic::write_atomic;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::result::DetectionResult;

pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheFile {
    version: u32,
    last_updated: DateTime<Utc>,
    entries: Vec<DetectionResult>,
}

/// Кэш результатов детекции на диске, ключ - source_identifier
#[derive(Debug)]
pub struct DetectionCache {
    path: PathBuf,
    ttl: ChronoDuration,
    entries: BTreeMap<String, DetectionResult>,
}

impl DetectionCache {
    /// Отсутствующий или несовместимый файл даёт пустой кэш
    pub fn load<P: AsRef<Path>>(path: P, ttl_days: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let ttl = ChronoDuration::days(i64::from(ttl_days));
        let mut cache = Self {
            path,
            ttl,
            entries: BTreeMap::new(),
        };

        let text = match fs::read_to_string(&cache.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(cache),
            Err(e) => return Err(e.into()),
        };

        let file: CacheFile = serde_json::from_str(&text).map_err(|e| {
            ScopeError::config(
                format!("{}: строка {}, столбец {}", cache.path.display(), e.line(), e.column()),
                e.to_string(),
            )
        })?;

        if file.version != CACHE_SCHEMA_VERSION {
            warn!(
                "Кэш детекции {:?} версии {} не поддерживается, начинаем с пустого",
                cache.path, file.version
            );
            return Ok(cache);
        }

        for entry in file.entries {
            match entry.validate() {
                Ok(()) if entry.is_cacheable() => {
                    cache.entries.insert(entry.source_identifier.clone(), entry);
                }
                Ok(()) => debug!("Пропущена запись кэша '{}' ({})", entry.source_identifier, entry.method),
                Err(e) => warn!("Пропущена запись кэша детекции: {}", e),
            }
        }
        debug!("Кэш детекции: {} записей", cache.entries.len());
        Ok(cache)
    }

    /// Свежая запись; устаревшие (старше TTL) считаются отсутствующими
    pub fn get(&self, source: &str) -> Option<&DetectionResult> {
        self.get_at(source, Utc::now())
    }

    pub fn get_at(&self, source: &str, now: DateTime<Utc>) -> Option<&DetectionResult> {
        self.entries
            .get(source)
            .filter(|entry| !entry.is_stale(self.ttl, now))
    }

    /// Неудачные детекции не кэшируются
    pub fn insert(&mut self, result: DetectionResult) -> bool {
        if !result.is_cacheable() {
            return false;
        }
        self.entries.insert(result.source_identifier.clone(), result);
        true
    }

    /// Удаляет устаревшие записи, возвращает их число
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| !entry.is_stale(ttl, now));
        before - self.entries.len()
    }

    pub fn save(&mut self) -> Result<()> {
        self.prune(Utc::now());
        let file = CacheFile {
            version: CACHE_SCHEMA_VERSION,
            last_updated: Utc::now(),
            entries: self.entries.values().cloned().collect(),
        };
        let mut text = serde_json::to_string_pretty(&file)?;
        text.push('\n');
        write_atomic(&self.path, text.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("detections.json");

        let mut cache = DetectionCache::load(&path, 30).unwrap();
        assert!(cache.is_empty());
        assert!(cache.insert(DetectionResult::isolated("code", "Code", Some("code".into()))));
        assert!(!cache.insert(DetectionResult::failed("broken", "timeout")));
        assert!(!cache.insert(DetectionResult::heuristic("guessed", "guessed")));
        cache.save().unwrap();

        let cache = DetectionCache::load(&path, 30).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("code").unwrap().detected_class.as_deref(), Some("Code"));
        assert!(cache.get("broken").is_none());
        assert!(cache.get("guessed").is_none());
    }

    #[test]
    fn test_stale_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DetectionCache::load(dir.path().join("c.json"), 30).unwrap();
        cache.insert(DetectionResult::desktop("firefox", "firefox"));

        let later = Utc::now() + ChronoDuration::days(31);
        assert!(cache.get_at("firefox", later).is_none());
        assert_eq!(cache.prune(later), 1);
    }

    #[test]
    fn test_unknown_version_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        fs::write(
            &path,
            r#"{"version": 99, "last_updated": "2026-01-01T00:00:00Z", "entries": []}"#,
        )
        .unwrap();
        assert!(DetectionCache::load(&path, 30).unwrap().is_empty());
    }
}
