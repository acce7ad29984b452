//! Durable state store seam.
//!
//! The JSON file store keeps one document per section so a corrupt section
//! never takes down the rest of the hydrate. Writes go through a temp file
//! and rename so a crashed write leaves the previous document intact.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use sync_core::{Message, Room, StoreSnapshot, SupportSession};

const ROOMS_FILE: &str = "rooms.json";
const MESSAGES_FILE: &str = "messages.json";
const SESSION_FILE: &str = "session.json";
/// Legacy flat message list from the pre-room-keyed schema.
const LEGACY_MESSAGES_FILE: &str = "messages.v0.json";

/// Errors surfaced by state store implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateStoreError {
    #[error("state store io failure: {0}")]
    Io(String),
    #[error("state store serialization failure: {0}")]
    Serialization(String),
    #[error("state store backend failure: {0}")]
    Backend(String),
}

impl From<io::Error> for StateStoreError {
    fn from(err: io::Error) -> Self {
        StateStoreError::Io(err.to_string())
    }
}

/// Durable snapshot storage behind the persistence writer.
pub trait StateStore: Send + Sync {
    /// Load the persisted snapshot, tolerating corrupt sections/entries.
    fn hydrate(&self) -> Result<StoreSnapshot, StateStoreError>;

    /// Replace the persisted snapshot.
    fn persist(&self, snapshot: &StoreSnapshot) -> Result<(), StateStoreError>;

    /// Remove all persisted state.
    fn clear(&self) -> Result<(), StateStoreError>;
}

/// Session-section document (active room pointer + support descriptor).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionDoc {
    active_room_id: Option<String>,
    support_session: Option<SupportSession>,
}

/// File-backed store writing one JSON document per section.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    root: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    fn load_rooms(&self) -> Vec<Room> {
        let Some(raw) = read_optional(&self.path(ROOMS_FILE)) else {
            return Vec::new();
        };
        let Ok(entries) = serde_json::from_slice::<Vec<Value>>(&raw) else {
            warn!("rooms section unreadable; starting with no rooms");
            return Vec::new();
        };

        entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<Room>(entry) {
                Ok(room) => Some(room),
                Err(err) => {
                    warn!(%err, "skipping corrupt persisted room entry");
                    None
                }
            })
            .collect()
    }

    fn load_messages(&self) -> HashMap<String, Vec<Message>> {
        let Some(raw) = read_optional(&self.path(MESSAGES_FILE)) else {
            return HashMap::new();
        };
        let Ok(entries) = serde_json::from_slice::<HashMap<String, Vec<Value>>>(&raw) else {
            warn!("messages section unreadable; starting with no messages");
            return HashMap::new();
        };

        entries
            .into_iter()
            .map(|(room_id, values)| {
                let messages = values
                    .into_iter()
                    .filter_map(|value| match serde_json::from_value::<Message>(value) {
                        Ok(message) => Some(message),
                        Err(err) => {
                            warn!(%room_id, %err, "skipping corrupt persisted message");
                            None
                        }
                    })
                    .collect();
                (room_id, messages)
            })
            .collect()
    }

    fn load_session_doc(&self) -> SessionDoc {
        let Some(raw) = read_optional(&self.path(SESSION_FILE)) else {
            return SessionDoc::default();
        };
        let Ok(value) = serde_json::from_slice::<Value>(&raw) else {
            warn!("session section unreadable; starting without session state");
            return SessionDoc::default();
        };

        // Fields are recovered independently so one bad field does not drop
        // the other.
        SessionDoc {
            active_room_id: value
                .get("active_room_id")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            support_session: value
                .get("support_session")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        }
    }

    /// Fold the legacy flat message list into the room-keyed map, then
    /// remove the legacy file so the import happens exactly once.
    fn import_legacy_messages(&self, messages: &mut HashMap<String, Vec<Message>>) {
        let legacy_path = self.path(LEGACY_MESSAGES_FILE);
        let Some(raw) = read_optional(&legacy_path) else {
            return;
        };
        let Ok(entries) = serde_json::from_slice::<Vec<Value>>(&raw) else {
            warn!("legacy message list unreadable; dropping it");
            let _ = fs::remove_file(&legacy_path);
            return;
        };

        let mut imported = 0usize;
        for entry in entries {
            let Ok(message) = serde_json::from_value::<Message>(entry) else {
                continue;
            };
            let sequence = messages.entry(message.room_id.clone()).or_default();
            if !sequence.iter().any(|m| m.message_id == message.message_id) {
                let position =
                    sequence.partition_point(|m| m.timestamp_ms <= message.timestamp_ms);
                sequence.insert(position, message);
                imported += 1;
            }
        }
        debug!(imported, "imported legacy flat message list");

        // Persist the folded map before removing the legacy file so a crash
        // in between cannot lose the imported history.
        if let Err(err) = self.write_messages(messages) {
            warn!(%err, "failed writing imported messages; keeping legacy file");
            return;
        }
        let _ = fs::remove_file(&legacy_path);
    }

    fn write_messages(
        &self,
        messages: &HashMap<String, Vec<Message>>,
    ) -> Result<(), StateStoreError> {
        let encoded = serde_json::to_vec(messages)
            .map_err(|err| StateStoreError::Serialization(err.to_string()))?;
        write_atomic(&self.path(MESSAGES_FILE), &encoded)?;
        Ok(())
    }
}

impl StateStore for JsonFileStateStore {
    fn hydrate(&self) -> Result<StoreSnapshot, StateStoreError> {
        let rooms = self.load_rooms();
        let mut messages = self.load_messages();
        self.import_legacy_messages(&mut messages);
        let session = self.load_session_doc();

        Ok(StoreSnapshot {
            rooms,
            messages,
            active_room_id: session.active_room_id,
            support_session: session.support_session,
        })
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> Result<(), StateStoreError> {
        let rooms = serde_json::to_vec(&snapshot.rooms)
            .map_err(|err| StateStoreError::Serialization(err.to_string()))?;
        write_atomic(&self.path(ROOMS_FILE), &rooms)?;

        self.write_messages(&snapshot.messages)?;

        let session = SessionDoc {
            active_room_id: snapshot.active_room_id.clone(),
            support_session: snapshot.support_session.clone(),
        };
        let session = serde_json::to_vec(&session)
            .map_err(|err| StateStoreError::Serialization(err.to_string()))?;
        write_atomic(&self.path(SESSION_FILE), &session)?;

        Ok(())
    }

    fn clear(&self) -> Result<(), StateStoreError> {
        for file in [ROOMS_FILE, MESSAGES_FILE, SESSION_FILE, LEGACY_MESSAGES_FILE] {
            match fs::remove_file(self.path(file)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// In-memory store used by tests and the smoke binary.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    snapshot: Mutex<StoreSnapshot>,
}

impl StateStore for InMemoryStateStore {
    fn hydrate(&self) -> Result<StoreSnapshot, StateStoreError> {
        self.snapshot
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| StateStoreError::Backend("poisoned lock".to_owned()))
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> Result<(), StateStoreError> {
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| StateStoreError::Backend("poisoned lock".to_owned()))?;
        *guard = snapshot.clone();
        Ok(())
    }

    fn clear(&self) -> Result<(), StateStoreError> {
        self.persist(&StoreSnapshot::default())
    }
}

fn read_optional(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!(path = %path.display(), %err, "failed reading persisted section");
            None
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateStoreError> {
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, bytes)
        .map_err(|err| StateStoreError::Io(format!("temp write {}: {err}", temp_path.display())))?;

    if let Err(rename_err) = fs::rename(&temp_path, path) {
        // Windows does not allow replacing existing files via rename.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(StateStoreError::Io(format!(
                    "replace {} after rename error ({rename_err}): {err}",
                    path.display()
                )));
            }
        }
        fs::rename(&temp_path, path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            StateStoreError::Io(format!("rename into {}: {err}", path.display()))
        })?;
    }

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("section.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{ChatKind, MessageKind, MessageMeta};

    fn message(id: &str, room: &str, ts: u64) -> Message {
        Message {
            message_id: id.to_owned(),
            room_id: room.to_owned(),
            sender_id: "u1".to_owned(),
            content: format!("body-{id}"),
            kind: MessageKind::Text,
            timestamp_ms: ts,
            metadata: MessageMeta::None,
        }
    }

    fn snapshot_with_room() -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::default();
        snapshot.rooms.push(Room::new("R1", ChatKind::Order, 10));
        snapshot
            .messages
            .insert("R1".to_owned(), vec![message("m1", "R1", 20)]);
        snapshot.active_room_id = Some("R1".to_owned());
        snapshot
    }

    #[test]
    fn persist_then_hydrate_round_trips() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = JsonFileStateStore::new(dir.path()).expect("store init");

        store.persist(&snapshot_with_room()).expect("persist");
        let loaded = store.hydrate().expect("hydrate");

        assert_eq!(loaded, snapshot_with_room());
    }

    #[test]
    fn corrupt_section_does_not_fail_the_whole_hydrate() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = JsonFileStateStore::new(dir.path()).expect("store init");
        store.persist(&snapshot_with_room()).expect("persist");

        fs::write(dir.path().join(ROOMS_FILE), b"{{not json").expect("corrupt rooms");

        let loaded = store.hydrate().expect("hydrate despite corruption");
        assert!(loaded.rooms.is_empty());
        assert_eq!(loaded.messages.get("R1").map(Vec::len), Some(1));
        assert_eq!(loaded.active_room_id.as_deref(), Some("R1"));
    }

    #[test]
    fn corrupt_message_entry_is_skipped_individually() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = JsonFileStateStore::new(dir.path()).expect("store init");

        let good = serde_json::to_value(message("m1", "R1", 20)).expect("encode");
        let doc = serde_json::json!({ "R1": [good, {"message_id": 42}] });
        fs::write(
            dir.path().join(MESSAGES_FILE),
            serde_json::to_vec(&doc).expect("encode doc"),
        )
        .expect("write messages");

        let loaded = store.hydrate().expect("hydrate");
        assert_eq!(loaded.messages.get("R1").map(Vec::len), Some(1));
    }

    #[test]
    fn legacy_flat_list_imports_exactly_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = JsonFileStateStore::new(dir.path()).expect("store init");

        let legacy = vec![message("m1", "R1", 10), message("m2", "R2", 20)];
        fs::write(
            dir.path().join(LEGACY_MESSAGES_FILE),
            serde_json::to_vec(&legacy).expect("encode legacy"),
        )
        .expect("write legacy");

        let first = store.hydrate().expect("first hydrate");
        assert_eq!(first.messages.get("R1").map(Vec::len), Some(1));
        assert_eq!(first.messages.get("R2").map(Vec::len), Some(1));
        assert!(!dir.path().join(LEGACY_MESSAGES_FILE).exists());

        // Second hydrate sees the folded map, not a second import.
        let second = store.hydrate().expect("second hydrate");
        assert_eq!(second.messages.get("R1").map(Vec::len), Some(1));
        assert_eq!(second.messages.get("R2").map(Vec::len), Some(1));
    }

    #[test]
    fn clear_removes_all_sections() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = JsonFileStateStore::new(dir.path()).expect("store init");
        store.persist(&snapshot_with_room()).expect("persist");

        store.clear().expect("clear");
        let loaded = store.hydrate().expect("hydrate");
        assert_eq!(loaded, StoreSnapshot::default());
    }

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryStateStore::default();
        store.persist(&snapshot_with_room()).expect("persist");
        assert_eq!(store.hydrate().expect("hydrate"), snapshot_with_room());

        store.clear().expect("clear");
        assert_eq!(store.hydrate().expect("hydrate"), StoreSnapshot::default());
    }
}
