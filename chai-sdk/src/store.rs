//! Client-side persistence: one identity blob plus one session blob per
//! peer, behind a small keyed-blob trait so hosts can bring their own
//! storage.
//!
//! Keys are fixed: `identity` for the (possibly vault-locked) identity
//! blob and `session:<peer_id>` for each session.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use parking_lot::Mutex;

/// Storage key of the identity blob.
pub const IDENTITY_KEY: &str = "identity";

const SESSION_PREFIX: &str = "session:";

/// Storage key of the session blob for a peer.
pub fn session_key(peer_id: &str) -> String {
    format!("{SESSION_PREFIX}{peer_id}")
}

/// Extract the peer id from a session storage key.
pub fn peer_of_session_key(key: &str) -> Option<&str> {
    key.strip_prefix(SESSION_PREFIX)
}

/// Keyed blob storage.
pub trait ClientStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// In-memory store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// One file per key under a data directory. Key bytes are base64url in
/// the filename, so peer ids can contain anything.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Open the default per-user data directory.
    pub fn open_default() -> Result<Self, StoreError> {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::open(base.join("chai"))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.blob", B64.encode(key)))
    }
}

impl ClientStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        // Write-then-rename so a crash never leaves a torn blob.
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(encoded) = name.to_str().and_then(|n| n.strip_suffix(".blob")) else {
                continue;
            };
            let Ok(raw) = B64.decode(encoded) else { continue };
            let Ok(key) = String::from_utf8(raw) else { continue };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn ClientStore) {
        assert!(store.get(IDENTITY_KEY).unwrap().is_none());
        store.put(IDENTITY_KEY, b"id-blob").unwrap();
        store.put(&session_key("alice"), b"session-a").unwrap();
        store.put(&session_key("bob/with:odd chars"), b"session-b").unwrap();

        assert_eq!(store.get(IDENTITY_KEY).unwrap().unwrap(), b"id-blob");
        assert_eq!(store.get(&session_key("alice")).unwrap().unwrap(), b"session-a");

        let sessions = store.keys_with_prefix(SESSION_PREFIX).unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|k| peer_of_session_key(k).is_some()));

        // Overwrite and delete.
        store.put(&session_key("alice"), b"session-a2").unwrap();
        assert_eq!(store.get(&session_key("alice")).unwrap().unwrap(), b"session-a2");
        store.delete(&session_key("alice")).unwrap();
        assert!(store.get(&session_key("alice")).unwrap().is_none());
        store.delete(&session_key("alice")).unwrap(); // idempotent
    }

    #[test]
    fn memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        exercise(&store);

        // Blobs survive a reopen.
        store.put(IDENTITY_KEY, b"persisted").unwrap();
        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(IDENTITY_KEY).unwrap().unwrap(), b"persisted");
    }

    #[test]
    fn session_key_roundtrip() {
        let key = session_key("some peer");
        assert_eq!(peer_of_session_key(&key), Some("some peer"));
        assert_eq!(peer_of_session_key("identity"), None);
    }
}
