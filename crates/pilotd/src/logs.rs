//! In-memory log buffer for the execution engine.
//!
//! Entries get a strictly increasing index under the buffer lock, so a client
//! can poll with `after(last_seen + 1)` and never miss or repeat a line. Only
//! the newest [`LOG_CAPACITY`] entries are kept in memory; entries that carry a
//! task id are mirrored to the store in the background.

use crate::storage::TaskStore;
use chrono::Utc;
use pilot_core::{LogEntry, LogLevel, TaskId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Maximum entries kept in memory.
pub const LOG_CAPACITY: usize = 1000;

#[derive(Debug)]
struct Ring {
    entries: VecDeque<LogEntry>,
    next_index: u64,
}

/// Bounded log buffer with an optional durable mirror.
#[derive(Debug)]
pub struct LogSink {
    ring: Mutex<Ring>,
    capacity: usize,
    persist_tx: Option<mpsc::UnboundedSender<LogEntry>>,
}

impl LogSink {
    /// Memory-only sink.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity.min(LOG_CAPACITY)),
                next_index: 0,
            }),
            capacity: capacity.max(1),
            persist_tx: None,
        }
    }

    /// Sink that also writes task-tagged entries through `store`.
    ///
    /// Must be called inside a tokio runtime; the writer task ends when the
    /// sink is dropped.
    pub fn with_store(capacity: usize, store: Arc<dyn TaskStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogEntry>();

        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let Some(task_id) = entry.task_id else {
                    continue;
                };
                if let Err(err) = store.append_log(task_id, &entry).await {
                    warn!(task_id, error = %err, "failed to persist log entry");
                }
            }
        });

        let mut sink = Self::new(capacity);
        sink.persist_tx = Some(tx);
        sink
    }

    /// Append an entry and return it with its assigned index.
    pub fn push(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        task_id: Option<TaskId>,
    ) -> LogEntry {
        let message = message.into();
        emit_tracing(level, &message, task_id);

        let entry = {
            let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = LogEntry {
                index: ring.next_index,
                timestamp: Utc::now(),
                level,
                message,
                task_id,
            };
            ring.next_index += 1;
            if ring.entries.len() == self.capacity {
                ring.entries.pop_front();
            }
            ring.entries.push_back(entry.clone());
            entry
        };

        if let (Some(tx), Some(_)) = (&self.persist_tx, entry.task_id) {
            // The receiver only goes away at shutdown.
            let _ = tx.send(entry.clone());
        }

        entry
    }

    pub fn sys(&self, message: impl Into<String>, task_id: Option<TaskId>) -> LogEntry {
        self.push(LogLevel::Sys, message, task_id)
    }

    pub fn error(&self, message: impl Into<String>, task_id: Option<TaskId>) -> LogEntry {
        self.push(LogLevel::Error, message, task_id)
    }

    /// Entries with `index >= after`, oldest first.
    pub fn after(&self, after: u64) -> Vec<LogEntry> {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        ring.entries
            .iter()
            .filter(|e| e.index >= after)
            .cloned()
            .collect()
    }

    /// Index the next entry will receive.
    pub fn next_index(&self) -> u64 {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_index
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

fn emit_tracing(level: LogLevel, message: &str, task_id: Option<TaskId>) {
    match level {
        LogLevel::Error => warn!(task_id, level = level.as_str(), "{message}"),
        _ => info!(task_id, level = level.as_str(), "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use pilot_core::NewTask;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn indices_are_strictly_increasing() {
        let sink = LogSink::default();
        let a = sink.sys("one", None);
        let b = sink.push(LogLevel::Agent, "two", Some(1));
        let c = sink.error("three", None);
        assert_eq!((a.index, b.index, c.index), (0, 1, 2));
        assert_eq!(sink.next_index(), 3);
    }

    #[test]
    fn after_returns_tail_in_order() {
        let sink = LogSink::default();
        for i in 0..5 {
            sink.sys(format!("line {i}"), None);
        }

        let tail = sink.after(3);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "line 3");
        assert_eq!(tail[1].message, "line 4");

        assert_eq!(sink.after(0).len(), 5);
        assert!(sink.after(5).is_empty());
        assert!(sink.after(500).is_empty());
    }

    #[test]
    fn ring_drops_oldest_but_keeps_numbering() {
        let sink = LogSink::new(3);
        for i in 0..5 {
            sink.sys(format!("line {i}"), None);
        }

        let all = sink.after(0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].index, 2);
        assert_eq!(all[2].index, 4);
        assert_eq!(all[2].message, "line 4");
    }

    #[tokio::test]
    async fn task_entries_are_mirrored_to_store() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let task = storage.create_task(&NewTask::new("t")).await.unwrap();

        let sink = LogSink::with_store(LOG_CAPACITY, Arc::clone(&storage) as Arc<dyn TaskStore>);
        sink.sys("untagged", None);
        sink.push(LogLevel::Tool, "Tool: Edit", Some(task.id));

        let mut persisted = Vec::new();
        for _ in 0..50 {
            persisted = storage.get_task_logs(task.id, 10).await.unwrap();
            if !persisted.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].message, "Tool: Edit");
        assert_eq!(persisted[0].level, LogLevel::Tool);
    }
}
