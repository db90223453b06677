//! SQLite persistence layer: the message store and the prekey
//! directory.
//!
//! Uses WAL mode for concurrent reads during writes. The handle lives
//! behind a mutex in shared state; one-time prekey consumption is a
//! single `UPDATE … RETURNING` statement, so no two fetches can ever
//! hand out the same prekey.
//!
//! The relay never inspects ciphertext: the `messages.ciphertext`
//! column is an opaque blob, and nothing plaintext is ever written.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

use chai_sdk::x3dh::PreKeyBundle;

/// Signed-prekey generations retained per user so in-flight initial
/// envelopes can still name a superseded id.
const BUNDLE_GENERATIONS: i64 = 3;

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A persisted envelope row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: String,
    pub recipient_id: String,
    pub ciphertext: Vec<u8>,
    pub message_type: u8,
    /// Relay arrival time, unix milliseconds.
    pub created_at: i64,
    pub delivered_at: Option<i64>,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (tests, ephemeral deployments).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id    TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                ciphertext   BLOB NOT NULL,
                message_type INTEGER NOT NULL DEFAULT 0,
                created_at   INTEGER NOT NULL,
                delivered_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_messages_undelivered
                ON messages(recipient_id, created_at, id)
                WHERE delivered_at IS NULL;

            CREATE TABLE IF NOT EXISTS prekey_bundles (
                id                       INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id                  TEXT NOT NULL,
                identity_key             BLOB NOT NULL,
                signed_prekey            BLOB NOT NULL,
                signed_prekey_signature  BLOB NOT NULL,
                prekey_id                INTEGER NOT NULL,
                created_at               INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_prekey_bundles_user
                ON prekey_bundles(user_id, id DESC);

            CREATE TABLE IF NOT EXISTS one_time_prekeys (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id    TEXT NOT NULL,
                prekey     BLOB NOT NULL,
                prekey_id  INTEGER NOT NULL,
                used       INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(user_id, prekey_id)
            );

            CREATE INDEX IF NOT EXISTS idx_one_time_prekeys_unused
                ON one_time_prekeys(user_id, id)
                WHERE used = 0;
            ",
        )?;
        Ok(())
    }

    // ── Messages ───────────────────────────────────────────────────

    /// Persist an envelope. Returns the assigned message id.
    pub fn insert_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        ciphertext: &[u8],
        message_type: u8,
        created_at: i64,
    ) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO messages (sender_id, recipient_id, ciphertext, message_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sender_id, recipient_id, ciphertext, message_type as i64, created_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All undelivered envelopes for a user, in arrival order.
    pub fn undelivered_for(&self, recipient_id: &str) -> SqlResult<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sender_id, recipient_id, ciphertext, message_type, created_at, delivered_at
             FROM messages
             WHERE recipient_id = ?1 AND delivered_at IS NULL
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![recipient_id], map_message_row)?;
        rows.collect()
    }

    /// Mark envelopes delivered in one statement. Already-delivered ids
    /// are untouched, so repeated acks are no-ops. Returns how many
    /// rows changed.
    pub fn mark_delivered(&self, message_ids: &[i64], delivered_at: i64) -> SqlResult<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; message_ids.len()].join(",");
        let sql = format!(
            "UPDATE messages SET delivered_at = ? WHERE delivered_at IS NULL AND id IN ({placeholders})"
        );
        let mut values: Vec<i64> = Vec::with_capacity(1 + message_ids.len());
        values.push(delivered_at);
        values.extend_from_slice(message_ids);
        self.conn.execute(&sql, rusqlite::params_from_iter(values))
    }

    /// Fetch one stored message by id (tests and diagnostics).
    pub fn message_by_id(&self, id: i64) -> SqlResult<Option<StoredMessage>> {
        self.conn
            .query_row(
                "SELECT id, sender_id, recipient_id, ciphertext, message_type, created_at, delivered_at
                 FROM messages WHERE id = ?1",
                params![id],
                map_message_row,
            )
            .optional()
    }

    /// Delete delivered envelopes and anything past the retention
    /// window. Also drops consumed one-time prekey rows. Returns the
    /// number of message rows removed.
    pub fn sweep(&self, now: i64, retention_ms: i64) -> SqlResult<usize> {
        let cutoff = now - retention_ms;
        let removed = self.conn.execute(
            "DELETE FROM messages WHERE delivered_at IS NOT NULL OR created_at < ?1",
            params![cutoff],
        )?;
        self.conn
            .execute("DELETE FROM one_time_prekeys WHERE used = 1", [])?;
        Ok(removed)
    }

    // ── Prekey directory ───────────────────────────────────────────

    /// Publish a new signed-prekey bundle. The signature must verify
    /// under the bundle's identity key, and the identity key must match
    /// the one pinned at first publish. Old generations stay
    /// referenceable until they age out.
    pub fn publish_bundle(
        &self,
        user_id: &str,
        bundle: &PreKeyBundle,
        created_at: i64,
    ) -> Result<(), DirectoryError> {
        bundle.verify().map_err(|_| DirectoryError::BadSignature)?;

        let pinned: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT identity_key FROM prekey_bundles
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(pinned) = pinned {
            if pinned != bundle.identity_key {
                return Err(DirectoryError::IdentityMismatch);
            }
        }

        self.conn.execute(
            "INSERT INTO prekey_bundles
                 (user_id, identity_key, signed_prekey, signed_prekey_signature, prekey_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                bundle.identity_key,
                bundle.signed_prekey,
                bundle.signed_prekey_signature,
                bundle.signed_prekey_id,
                created_at,
            ],
        )?;
        self.conn.execute(
            "DELETE FROM prekey_bundles WHERE user_id = ?1 AND id NOT IN (
                 SELECT id FROM prekey_bundles WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![user_id, BUNDLE_GENERATIONS],
        )?;

        // A bundle may carry one inline one-time prekey (the HTTP
        // publish path); batches go through append_one_time_prekeys.
        if let (Some(prekey), Some(prekey_id)) =
            (&bundle.one_time_prekey, bundle.one_time_prekey_id)
        {
            self.append_one_time_prekeys(user_id, &[(prekey_id, prekey.clone())], created_at)?;
        }
        Ok(())
    }

    /// Add unused one-time prekeys. Re-uploads of an existing id are
    /// ignored.
    pub fn append_one_time_prekeys(
        &self,
        user_id: &str,
        prekeys: &[(u32, Vec<u8>)],
        created_at: i64,
    ) -> SqlResult<()> {
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO one_time_prekeys (user_id, prekey, prekey_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (prekey_id, prekey) in prekeys {
            stmt.execute(params![user_id, prekey, prekey_id, created_at])?;
        }
        Ok(())
    }

    /// Atomically select-and-consume one unused one-time prekey. The
    /// single UPDATE guarantees no two fetches receive the same row.
    fn take_one_time_prekey(&self, user_id: &str) -> SqlResult<Option<(u32, Vec<u8>)>> {
        self.conn
            .query_row(
                "UPDATE one_time_prekeys SET used = 1
                 WHERE id = (
                     SELECT id FROM one_time_prekeys
                     WHERE user_id = ?1 AND used = 0
                     ORDER BY id ASC LIMIT 1
                 )
                 RETURNING prekey_id, prekey",
                params![user_id],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()
    }

    /// Unused one-time prekeys remaining for a user.
    pub fn remaining_one_time_prekeys(&self, user_id: &str) -> SqlResult<u32> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ?1 AND used = 0",
            params![user_id],
            |row| row.get(0),
        )
    }

    /// Compose a bundle for an initiator: the current signed prekey
    /// plus one consumed one-time prekey when available. `None` when
    /// the user never published.
    pub fn fetch_bundle(&self, user_id: &str) -> SqlResult<Option<PreKeyBundle>> {
        let current = self
            .conn
            .query_row(
                "SELECT identity_key, signed_prekey, signed_prekey_signature, prekey_id
                 FROM prekey_bundles
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT 1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((identity_key, signed_prekey, signed_prekey_signature, signed_prekey_id)) = current
        else {
            return Ok(None);
        };

        let one_time = self.take_one_time_prekey(user_id)?;
        Ok(Some(PreKeyBundle {
            identity_key,
            signed_prekey,
            signed_prekey_signature,
            signed_prekey_id,
            one_time_prekey: one_time.as_ref().map(|(_, prekey)| prekey.clone()),
            one_time_prekey_id: one_time.map(|(id, _)| id),
        }))
    }
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        ciphertext: row.get(3)?,
        message_type: row.get::<_, i64>(4)? as u8,
        created_at: row.get(5)?,
        delivered_at: row.get(6)?,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("bundle signature does not verify")]
    BadSignature,
    #[error("identity key does not match the pinned identity")]
    IdentityMismatch,
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chai_sdk::SessionManager;

    fn published_manager(db: &Db, user_id: &str) -> SessionManager {
        let mut manager = SessionManager::generate();
        db.publish_bundle(user_id, &manager.generate_prekey_bundle(), 1000).unwrap();
        let otps = manager.generate_one_time_prekeys(3);
        let uploads: Vec<_> = otps.into_iter().map(|(id, pk)| (id, pk.to_vec())).collect();
        db.append_one_time_prekeys(user_id, &uploads, 1000).unwrap();
        manager
    }

    #[test]
    fn message_store_roundtrip() {
        let db = Db::open_memory().unwrap();

        let id1 = db.insert_message("alice", "bob", b"ct-1", 0, 1000).unwrap();
        let id2 = db.insert_message("alice", "bob", b"ct-2", 0, 1001).unwrap();
        let _ = db.insert_message("alice", "carol", b"ct-3", 0, 1002).unwrap();

        let pending = db.undelivered_for("bob").unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, id1);
        assert_eq!(pending[0].ciphertext, b"ct-1");
        assert_eq!(pending[1].id, id2);

        // Ack one; it leaves the undelivered set.
        assert_eq!(db.mark_delivered(&[id1], 2000).unwrap(), 1);
        let pending = db.undelivered_for("bob").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id2);

        // Re-acking is a no-op.
        assert_eq!(db.mark_delivered(&[id1], 3000).unwrap(), 0);
        assert_eq!(db.message_by_id(id1).unwrap().unwrap().delivered_at, Some(2000));
    }

    #[test]
    fn undelivered_ordering_breaks_timestamp_ties_by_id() {
        let db = Db::open_memory().unwrap();
        let a = db.insert_message("x", "bob", b"a", 0, 1000).unwrap();
        let b = db.insert_message("x", "bob", b"b", 0, 1000).unwrap();
        let c = db.insert_message("x", "bob", b"c", 0, 999).unwrap();

        let ids: Vec<i64> = db.undelivered_for("bob").unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![c, a, b]);
    }

    #[test]
    fn bundle_publish_and_fetch() {
        let db = Db::open_memory().unwrap();
        published_manager(&db, "bob");

        let bundle = db.fetch_bundle("bob").unwrap().unwrap();
        bundle.verify().unwrap();
        assert!(bundle.one_time_prekey.is_some());
        assert_eq!(db.remaining_one_time_prekeys("bob").unwrap(), 2);

        // Unpublished user has no bundle.
        assert!(db.fetch_bundle("nobody").unwrap().is_none());
    }

    #[test]
    fn one_time_prekeys_consumed_exactly_once() {
        let db = Db::open_memory().unwrap();
        published_manager(&db, "bob");

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let bundle = db.fetch_bundle("bob").unwrap().unwrap();
            let id = bundle.one_time_prekey_id.expect("pool not exhausted yet");
            assert!(seen.insert(id), "one-time prekey {id} handed out twice");
        }

        // Pool exhausted: the bundle still comes, without a one-time key.
        let bundle = db.fetch_bundle("bob").unwrap().unwrap();
        assert!(bundle.one_time_prekey.is_none());
        assert!(bundle.one_time_prekey_id.is_none());
        assert_eq!(db.remaining_one_time_prekeys("bob").unwrap(), 0);
    }

    #[test]
    fn bad_signature_rejected_without_side_effects() {
        let db = Db::open_memory().unwrap();
        let manager = SessionManager::generate();
        let mut bundle = manager.generate_prekey_bundle();
        bundle.signed_prekey_signature[0] ^= 1;

        assert!(matches!(
            db.publish_bundle("bob", &bundle, 1000),
            Err(DirectoryError::BadSignature)
        ));
        assert!(db.fetch_bundle("bob").unwrap().is_none());
    }

    #[test]
    fn identity_pin_rejects_swapped_identity() {
        let db = Db::open_memory().unwrap();
        published_manager(&db, "bob");

        // A different identity publishing under the same user id.
        let imposter = SessionManager::generate();
        assert!(matches!(
            db.publish_bundle("bob", &imposter.generate_prekey_bundle(), 2000),
            Err(DirectoryError::IdentityMismatch)
        ));
    }

    #[test]
    fn rotation_keeps_generations_and_serves_newest() {
        let db = Db::open_memory().unwrap();
        let mut manager = published_manager(&db, "bob");

        let rotated = manager.rotate_signed_prekey();
        db.publish_bundle("bob", &rotated, 2000).unwrap();

        let bundle = db.fetch_bundle("bob").unwrap().unwrap();
        assert_eq!(bundle.signed_prekey_id, rotated.signed_prekey_id);
    }

    #[test]
    fn duplicate_one_time_prekey_ids_ignored() {
        let db = Db::open_memory().unwrap();
        published_manager(&db, "bob");
        assert_eq!(db.remaining_one_time_prekeys("bob").unwrap(), 3);

        // Re-uploading id 1 does not create a second row.
        db.append_one_time_prekeys("bob", &[(1, vec![9u8; 32])], 2000).unwrap();
        assert_eq!(db.remaining_one_time_prekeys("bob").unwrap(), 3);
    }

    #[test]
    fn sweep_drops_delivered_and_expired() {
        let db = Db::open_memory().unwrap();
        let delivered = db.insert_message("a", "b", b"x", 0, 1000).unwrap();
        let expired = db.insert_message("a", "b", b"y", 0, 500).unwrap();
        let kept = db.insert_message("a", "b", b"z", 0, 5000).unwrap();
        db.mark_delivered(&[delivered], 1500).unwrap();

        // Retention window: everything older than now - 1000 expires.
        let removed = db.sweep(2000, 1000).unwrap();
        assert_eq!(removed, 2);
        assert!(db.message_by_id(delivered).unwrap().is_none());
        assert!(db.message_by_id(expired).unwrap().is_none());
        assert!(db.message_by_id(kept).unwrap().is_some());
    }
}
