//! Conversation-id → Claude-session-id mapping with TTL expiry.
//!
//! Backed by one JSON file in the user's home directory, loaded on first use
//! and held in memory afterwards. Writes are fire-and-forget whole-file
//! rewrites; the process is assumed to be the only writer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

pub const SESSION_FILE_NAME: &str = ".claude-code-cli-sessions.json";
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const SESSION_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// One persisted mapping. Field names are a compatibility surface: the file
/// is shared with earlier deployments of the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub clawdbot_id: String,
    pub claude_session_id: String,
    pub created_at: u64,
    pub last_used_at: u64,
    pub model: String,
}

pub struct SessionStore {
    path: Option<PathBuf>,
    /// `None` until the backing file has been loaded.
    state: Mutex<Option<HashMap<String, SessionEntry>>>,
}

impl SessionStore {
    /// Store at `$HOME/.claude-code-cli-sessions.json`.
    pub fn at_default_path() -> Self {
        let path = dirs::home_dir().map(|home| home.join(SESSION_FILE_NAME));
        if path.is_none() {
            tracing::warn!("no home directory; session mappings will not persist");
        }
        Self {
            path,
            state: Mutex::new(None),
        }
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            state: Mutex::new(None),
        }
    }

    /// No backing file; used by tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(None),
        }
    }

    /// Session id for a conversation, minting one when absent or expired.
    /// `lastUsedAt` never decreases.
    pub async fn get_or_create(&self, conversation_id: &str, model: &str) -> String {
        let mut guard = self.state.lock().await;
        let entries = self.loaded(&mut guard);
        let now = now_ms();

        let expired = entries
            .get(conversation_id)
            .is_some_and(|entry| now.saturating_sub(entry.last_used_at) > SESSION_TTL_MS);
        if expired {
            entries.remove(conversation_id);
        }

        let entry = entries
            .entry(conversation_id.to_string())
            .or_insert_with(|| SessionEntry {
                clawdbot_id: conversation_id.to_string(),
                claude_session_id: Uuid::new_v4().to_string(),
                created_at: now,
                last_used_at: now,
                model: model.to_string(),
            });
        entry.last_used_at = entry.last_used_at.max(now);
        entry.model = model.to_string();
        let session_id = entry.claude_session_id.clone();

        self.persist(entries);
        session_id
    }

    pub async fn get(&self, conversation_id: &str) -> Option<SessionEntry> {
        let mut guard = self.state.lock().await;
        self.loaded(&mut guard).get(conversation_id).cloned()
    }

    pub async fn delete(&self, conversation_id: &str) {
        let mut guard = self.state.lock().await;
        let entries = self.loaded(&mut guard);
        if entries.remove(conversation_id).is_some() {
            self.persist(entries);
        }
    }

    /// Drop every mapping idle past the TTL. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let mut guard = self.state.lock().await;
        let entries = self.loaded(&mut guard);
        let now = now_ms();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_sub(entry.last_used_at) <= SESSION_TTL_MS);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "expired session mappings removed");
            self.persist(entries);
        }
        removed
    }

    fn loaded<'a>(
        &self,
        guard: &'a mut Option<HashMap<String, SessionEntry>>,
    ) -> &'a mut HashMap<String, SessionEntry> {
        guard.get_or_insert_with(|| self.load())
    }

    /// Absent or malformed files yield an empty store; never fatal.
    fn load(&self) -> HashMap<String, SessionEntry> {
        let Some(path) = &self.path else {
            return HashMap::new();
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "malformed session file, starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unreadable session file, starting empty");
                HashMap::new()
            }
        }
    }

    fn persist(&self, entries: &HashMap<String, SessionEntry>) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let serialized = match serde_json::to_string_pretty(entries) {
            Ok(serialized) => serialized,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize session mappings");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(err) = tokio::fs::write(&path, serialized).await {
                tracing::warn!(path = %path.display(), error = %err, "failed to write session file");
            }
        });
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
