use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use super::*;
use crate::config::DEFAULT_RECORD_MAX_ENTRIES;

/// Session recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Record key events only.
    #[default]
    KeyEventsOnly,
    /// Record key events and raw chunks.
    Full,
}

/// A single recorded session event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecordEntry {
    pub ts: DateTime<Utc>,
    pub event: SessionEvent,
}

/// Supported recorded event types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionEstablished {
        device_addr: String,
        prompt: String,
    },
    ConnectionClosed {
        reason: String,
        #[serde(default)]
        prompt_before: Option<String>,
    },
    CommandCompleted {
        command: String,
        outcome: Outcome,
        prompt_before: String,
        prompt_after: String,
        output: String,
    },
    ModeChanged {
        prompt: String,
    },
    RawChunk {
        data: String,
    },
}

/// In-memory session history.
///
/// Holds at most `max_entries` entries; the oldest are dropped first. Zero
/// means no limit.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    max_entries: usize,
    entries: Arc<StdMutex<VecDeque<SessionRecordEntry>>>,
}

impl SessionRecorder {
    /// Create a recorder with the given level and the default entry cap.
    pub fn new(level: SessionRecordLevel) -> Self {
        Self::bounded(level, DEFAULT_RECORD_MAX_ENTRIES)
    }

    /// Create a recorder that keeps only the newest `max_entries` entries.
    pub fn bounded(level: SessionRecordLevel, max_entries: usize) -> Self {
        Self {
            level,
            max_entries,
            entries: Arc::new(StdMutex::new(VecDeque::new())),
        }
    }

    /// Current recording level.
    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Record a key-level event.
    pub fn record_event(&self, event: SessionEvent) {
        if self.level == SessionRecordLevel::Off {
            return;
        }
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if self.max_entries > 0 {
            while guard.len() >= self.max_entries {
                guard.pop_front();
            }
        }
        guard.push_back(SessionRecordEntry {
            ts: Utc::now(),
            event,
        });
    }

    /// Record a raw data chunk when enabled.
    pub fn record_raw_chunk(&self, data: &str) {
        if self.level != SessionRecordLevel::Full {
            return;
        }
        self.record_event(SessionEvent::RawChunk {
            data: data.to_string(),
        })
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Vec<SessionRecordEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Clears all recorded events.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let lines = self
            .entries()
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lines.join("\n"))
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::default())
    }
}
