use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, warn};

use crate::api::api_types::TranscriptEntry;
use crate::model::types::UserId;

/// Input:
///  - finalized transcript entries, appended on STT success
/// Output:
///  - when queried, the full list or the last N entries
///
/// The in-memory list is authoritative; a JSON file mirrors it and is
/// rewritten atomically after each append. A disk-write failure is
/// logged and otherwise ignored.
pub(crate) struct TranscriptStore {
    inner: Mutex<TranscriptInner>,
    mirror_path: Option<PathBuf>,
}

struct TranscriptInner {
    created_at_ms: u64,
    entries: Vec<TranscriptEntry>,
    user_map: HashMap<UserId, String>,
}

#[derive(Serialize)]
struct MirrorFile<'a> {
    created_at: u64,
    transcriptions: &'a [TranscriptEntry],
    user_map: &'a HashMap<UserId, String>,
}

pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl TranscriptStore {
    /// Creates a store mirroring to `<dir>/transcript-<created_at>.json`.
    /// If the directory can't be created the store stays memory-only.
    pub fn new(transcript_dir: &Path) -> Self {
        let created_at_ms = unix_millis(SystemTime::now());
        let mirror_path = match std::fs::create_dir_all(transcript_dir) {
            Ok(()) => Some(transcript_dir.join(format!("transcript-{}.json", created_at_ms))),
            Err(e) => {
                warn!(
                    "cannot create transcript dir {:?}: {}; transcript will not be persisted",
                    transcript_dir, e
                );
                None
            }
        };
        Self {
            inner: Mutex::new(TranscriptInner {
                created_at_ms,
                entries: Vec::new(),
                user_map: HashMap::new(),
            }),
            mirror_path,
        }
    }

    pub fn set_username(&self, user_id: UserId, name: String) {
        self.inner.lock().unwrap().user_map.insert(user_id, name);
    }

    /// Appends an entry and rewrites the mirror. Never rejects a valid
    /// append.
    pub async fn append(&self, entry: TranscriptEntry) {
        let serialized = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(user_id) = entry.user_id {
                inner
                    .user_map
                    .entry(user_id)
                    .or_insert_with(|| entry.username.clone());
            }
            inner.entries.push(entry);
            self.serialize_mirror(&inner)
        };
        self.rewrite_mirror(serialized).await;
    }

    /// Returns the last `limit` entries in insertion order, or all of
    /// them.
    pub fn entries(&self, limit: Option<usize>) -> Vec<TranscriptEntry> {
        let inner = self.inner.lock().unwrap();
        let entries = &inner.entries;
        let start = match limit {
            Some(n) => entries.len().saturating_sub(n),
            None => 0,
        };
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    fn serialize_mirror(&self, inner: &TranscriptInner) -> Option<String> {
        self.mirror_path.as_ref()?;
        match serde_json::to_string_pretty(&MirrorFile {
            created_at: inner.created_at_ms,
            transcriptions: &inner.entries,
            user_map: &inner.user_map,
        }) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!("cannot serialize transcript mirror: {}", e);
                None
            }
        }
    }

    /// Write-to-temp-then-rename. This is a low-rate path; a few
    /// rewrites per second at most under heavy speech.
    async fn rewrite_mirror(&self, serialized: Option<String>) {
        let (Some(path), Some(json)) = (self.mirror_path.as_ref(), serialized) else {
            return;
        };
        let tmp_path = path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp_path, json.as_bytes()).await?;
            tokio::fs::rename(&tmp_path, path).await
        }
        .await;
        match result {
            Ok(()) => debug!("transcript mirror rewritten: {:?}", path),
            Err(e) => warn!("transcript mirror write failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user_id: UserId, text: &str) -> TranscriptEntry {
        TranscriptEntry {
            user_id: Some(user_id),
            username: format!("user-{}", user_id),
            text: text.to_string(),
            timestamp: unix_millis(SystemTime::now()),
            words: None,
            guild_id: Some(1),
            channel_id: Some(2),
        }
    }

    fn test_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("discanto-transcript-{}-{}", tag, std::process::id()))
    }

    #[tokio::test]
    async fn appends_preserve_insertion_order() {
        let dir = test_dir("order");
        let store = TranscriptStore::new(&dir);
        store.append(entry(1, "first")).await;
        store.append(entry(2, "second")).await;
        store.append(entry(1, "third")).await;

        let all = store.entries(None);
        assert_eq!(
            all.iter().map(|e| e.text.as_str()).collect::<Vec<_>>(),
            vec!["first", "second", "third"]
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn last_n_returns_the_tail() {
        let dir = test_dir("tail");
        let store = TranscriptStore::new(&dir);
        for i in 0..5 {
            store.append(entry(1, &format!("line {}", i))).await;
        }
        let tail = store.entries(Some(2));
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].text, "line 3");
        assert_eq!(tail[1].text, "line 4");
        // asking for more than we have returns everything
        assert_eq!(store.entries(Some(100)).len(), 5);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn mirror_file_has_the_persisted_shape() {
        let dir = test_dir("mirror");
        let store = TranscriptStore::new(&dir);
        store.set_username(42, "alice".to_string());
        store.append(entry(42, "hello there")).await;

        let mirror_path = store.mirror_path.clone().expect("mirror configured");
        let raw = std::fs::read_to_string(mirror_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed["created_at"].as_u64().is_some());
        assert_eq!(parsed["transcriptions"][0]["text"], "hello there");
        assert_eq!(parsed["user_map"]["42"], "alice");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn memory_store_survives_unwritable_mirror() {
        // /proc is not writable; the store must degrade to memory-only
        let store = TranscriptStore::new(Path::new("/proc/discanto-nope"));
        store.append(entry(1, "still recorded")).await;
        assert_eq!(store.len(), 1);
    }
}
