//! Persistent store of recently processed event ids.
//!
//! The agent must never execute the same event twice, even across a crash, so
//! every accepted event id is recorded in a sharded in-memory index mirrored
//! by an append-only file. A periodic compaction pass drops entries older
//! than the retention window and rewrites the file. The retention window is
//! deliberately wider than the staleness window applied at intake, so the
//! index always covers any event that could still be accepted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::util::ConcurrentMap;

pub const EVENT_BACKUP_FILE: &str = ".events";
const EVENT_ID_TIMESTAMP_SEP: &str = ":::";
const EVENT_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Handle to the event store. Cloneable; all clones share the same index and
/// append channel.
#[derive(Clone)]
pub struct EventStore {
    index: ConcurrentMap,
    append_tx: mpsc::Sender<(String, i64)>,
}

impl EventStore {
    /// Loads the backup file from `<dir>/.events` (an unreadable file leaves
    /// the store memory-only for this boot) and starts the loop that appends
    /// new records and periodically compacts the file.
    pub fn initialize(dir: &Path, cancel: CancellationToken) -> EventStore {
        let path = dir.join(EVENT_BACKUP_FILE);
        info!(path = %path.display(), "initializing events backup file");

        let index = match load_event_ids(&path) {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "could not load events backup file; starting with an empty index");
                ConcurrentMap::new()
            }
        };

        let (append_tx, append_rx) = mpsc::channel(1);
        let store = EventStore {
            index: index.clone(),
            append_tx,
        };
        tokio::spawn(run_loop(index, path, append_rx, cancel));
        store
    }

    /// True if this agent already processed the given event id.
    pub fn has_processed(&self, event_id: &str) -> bool {
        self.index.has(event_id)
    }

    /// Records the event id so it is never executed again: the index entry is
    /// visible immediately, the file append happens on the store loop.
    pub async fn persist(&self, event_id: &str) {
        let now = chrono::Utc::now().timestamp();
        self.index.set(event_id, now);
        let _ = self.append_tx.send((event_id.to_string(), now)).await;
    }
}

async fn run_loop(
    index: ConcurrentMap,
    path: PathBuf,
    mut append_rx: mpsc::Receiver<(String, i64)>,
    cancel: CancellationToken,
) {
    let mut compaction = tokio::time::interval_at(
        tokio::time::Instant::now() + EVENT_RETENTION,
        EVENT_RETENTION,
    );
    compaction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            record = append_rx.recv() => {
                let Some((event_id, timestamp)) = record else { break };
                debug!(event_id, "persisting the event id");
                if let Err(e) = append_record(&path, &event_id, timestamp).await {
                    warn!(error = %e, "could not append to the events file");
                }
            }
            _ = compaction.tick() => {
                debug!("compacting the events file");
                let cutoff = chrono::Utc::now().timestamp() - EVENT_RETENTION.as_secs() as i64;
                if let Err(e) = compact(&index, &path, cutoff).await {
                    warn!(error = %e, "could not compact the events file");
                }
            }
        }
    }
}

/// Loads `<eventId>:::<unixSeconds>` lines into a fresh index, skipping
/// anything unparseable. A missing file yields an empty index and a fresh
/// file on the first append.
fn load_event_ids(path: &Path) -> Result<ConcurrentMap> {
    let index = ConcurrentMap::new();
    if !path.exists() {
        info!(path = %path.display(), "events backup file does not exist yet");
        return Ok(index);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading events file: {}", path.display()))?;
    for line in content.lines() {
        let mut parts = line.splitn(2, EVENT_ID_TIMESTAMP_SEP);
        let (Some(event_id), Some(timestamp)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let Ok(timestamp) = timestamp.parse::<i64>() {
            index.set(event_id, timestamp);
        }
    }
    Ok(index)
}

async fn append_record(path: &Path, event_id: &str, timestamp: i64) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening events file: {}", path.display()))?;
    file.write_all(format_record(event_id, timestamp).as_bytes())
        .await
        .context("writing to events file")?;
    Ok(())
}

/// Drops entries recorded before `cutoff` from the index, then rewrites the
/// backup file from the surviving entries. The rewrite goes to a temp file
/// that is atomically renamed over the old one, so a crash mid-compaction
/// cannot lose the whole index.
async fn compact(index: &ConcurrentMap, path: &Path, cutoff: i64) -> Result<()> {
    for (event_id, timestamp) in index.snapshot() {
        if timestamp < cutoff {
            index.remove(&event_id);
        }
    }

    let mut content = String::new();
    for (event_id, timestamp) in index.snapshot() {
        content.push_str(&format_record(&event_id, timestamp));
    }

    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, content)
        .await
        .with_context(|| format!("writing events file: {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .context("renaming compacted events file")?;
    Ok(())
}

fn format_record(event_id: &str, timestamp: i64) -> String {
    format!("{event_id}{EVENT_ID_TIMESTAMP_SEP}{timestamp}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir {
        path: PathBuf,
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn tempdir() -> TempDir {
        let path = std::env::temp_dir().join(format!("neptune-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        TempDir { path }
    }

    #[test]
    fn load_skips_corrupt_lines() {
        let dir = tempdir();
        let path = dir.path.join(EVENT_BACKUP_FILE);
        std::fs::write(&path, "E1:::100\ngarbage\nE2:::not-a-number\nE3:::300\n").unwrap();

        let index = load_event_ids(&path).unwrap();
        assert_eq!(index.get("E1"), Some(100));
        assert_eq!(index.get("E3"), Some(300));
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn load_of_missing_file_yields_empty_index() {
        let dir = tempdir();
        let index = load_event_ids(&dir.path.join(EVENT_BACKUP_FILE)).unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn persist_makes_event_visible_immediately_and_durable() {
        let dir = tempdir();
        let cancel = CancellationToken::new();
        let store = EventStore::initialize(&dir.path, cancel.clone());

        assert!(!store.has_processed("E1"));
        store.persist("E1").await;
        assert!(store.has_processed("E1"));

        // Give the store loop a moment to flush the append.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let content = std::fs::read_to_string(dir.path.join(EVENT_BACKUP_FILE)).unwrap();
        assert!(content.starts_with("E1:::"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn restart_reloads_persisted_events() {
        let dir = tempdir();
        let cancel = CancellationToken::new();
        let store = EventStore::initialize(&dir.path, cancel.clone());
        store.persist("E1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let restarted = EventStore::initialize(&dir.path, CancellationToken::new());
        assert!(restarted.has_processed("E1"));
        assert!(!restarted.has_processed("E2"));
    }

    #[tokio::test]
    async fn compaction_drops_old_entries_from_memory_and_disk() {
        let dir = tempdir();
        let path = dir.path.join(EVENT_BACKUP_FILE);
        let index = ConcurrentMap::new();
        let now = chrono::Utc::now().timestamp();
        index.set("old", now - 31 * 60);
        index.set("recent", now - 60);

        compact(&index, &path, now - 30 * 60).await.unwrap();

        assert!(!index.has("old"));
        assert!(index.has("recent"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("old"));
        assert!(content.contains("recent"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn compaction_overwrites_previous_file_contents() {
        let dir = tempdir();
        let path = dir.path.join(EVENT_BACKUP_FILE);
        std::fs::write(&path, "stale-line:::1\n").unwrap();

        let index = ConcurrentMap::new();
        index.set("kept", chrono::Utc::now().timestamp());
        compact(&index, &path, 0).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("stale-line"));
        assert!(content.contains("kept"));
    }
}
