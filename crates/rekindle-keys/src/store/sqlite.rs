use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{capacity_check, cutoff_days, expiry_after, KeyStore};
use crate::entities::{
    DeletedKeys, DeviceAddress, DevicePoolLevel, IdentityKey, NewPreKey, NewSignedPreKey, PreKey,
    SignedPreKey,
};
use crate::KeyError;

/// Key store schema version. Bump when the schema changes.
const KEY_SCHEMA_VERSION: i64 = 1;

const SIGNED_PREKEY_COLUMNS: &str =
    "id, user_id, device_id, key_id, public_key, signature, created_at, expires_at";

const PREKEY_COLUMNS: &str =
    "id, user_id, device_id, key_id, public_key, is_one_time, is_used, created_at, used_at";

/// `SQLite`-backed [`KeyStore`].
///
/// A single connection is shared behind a mutex, so statements from
/// concurrent requests are serialized. The prekey claim is additionally
/// written as one conditional `UPDATE ... RETURNING` so it stays atomic
/// without relying on that lock.
#[derive(Clone)]
pub struct SqliteKeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyStore {
    /// Open (or create) the key database at `path` and run migrations.
    ///
    /// `":memory:"` gives a private in-memory database.
    pub fn open(path: &str) -> Result<Self, KeyError> {
        let conn = Connection::open(path)
            .map_err(|e| KeyError::Storage(format!("failed to open key db: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| KeyError::Storage(format!("failed to set WAL mode: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| KeyError::Storage(format!("failed to enable foreign keys: {e}")))?;

        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current != KEY_SCHEMA_VERSION {
            if current != 0 {
                tracing::info!(
                    old = current,
                    new = KEY_SCHEMA_VERSION,
                    "key schema version mismatch, recreating"
                );
                drop_all_tables(&conn)?;
            }
            conn.execute_batch(KEY_SCHEMA)
                .map_err(|e| KeyError::Storage(format!("failed to run key schema: {e}")))?;
            conn.pragma_update(None, "user_version", KEY_SCHEMA_VERSION)
                .map_err(|e| KeyError::Storage(format!("failed to set schema version: {e}")))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Drop every user table so the schema can be cleanly re-applied.
fn drop_all_tables(conn: &Connection) -> Result<(), KeyError> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
        .map_err(|e| KeyError::Storage(format!("failed to list tables: {e}")))?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| KeyError::Storage(format!("failed to query tables: {e}")))?
        .filter_map(Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))
            .map_err(|e| KeyError::Storage(format!("failed to drop table {table}: {e}")))?;
    }
    Ok(())
}

const KEY_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS identity_keys (
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    public_key TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, device_id)
);

CREATE TABLE IF NOT EXISTS signed_prekeys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    key_id INTEGER NOT NULL,
    public_key TEXT NOT NULL,
    signature TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    UNIQUE (user_id, device_id, key_id)
);

CREATE INDEX IF NOT EXISTS idx_signed_prekeys_device
    ON signed_prekeys(user_id, device_id, expires_at);

CREATE INDEX IF NOT EXISTS idx_signed_prekeys_expiry
    ON signed_prekeys(expires_at);

CREATE TABLE IF NOT EXISTS prekeys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    key_id INTEGER NOT NULL,
    public_key TEXT NOT NULL,
    is_one_time INTEGER NOT NULL DEFAULT 1,
    is_used INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    used_at INTEGER,
    UNIQUE (user_id, device_id, key_id)
);

-- Claims and pool counts only ever look at unused rows
CREATE INDEX IF NOT EXISTS idx_prekeys_unused
    ON prekeys(user_id, device_id) WHERE is_used = 0;

CREATE INDEX IF NOT EXISTS idx_prekeys_used_at
    ON prekeys(used_at) WHERE is_used = 1;
";

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn to_count(n: i64) -> usize {
    usize::try_from(n).unwrap_or_default()
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<IdentityKey> {
    Ok(IdentityKey {
        user_id: row.get(0)?,
        device_id: row.get(1)?,
        public_key: row.get(2)?,
        created_at: from_millis(row.get(3)?),
        updated_at: from_millis(row.get(4)?),
    })
}

fn signed_prekey_from_row(row: &Row<'_>) -> rusqlite::Result<SignedPreKey> {
    Ok(SignedPreKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        device_id: row.get(2)?,
        key_id: row.get(3)?,
        public_key: row.get(4)?,
        signature: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        expires_at: from_millis(row.get(7)?),
    })
}

fn prekey_from_row(row: &Row<'_>) -> rusqlite::Result<PreKey> {
    Ok(PreKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        device_id: row.get(2)?,
        key_id: row.get(3)?,
        public_key: row.get(4)?,
        is_one_time: row.get(5)?,
        is_used: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        used_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
    })
}

impl KeyStore for SqliteKeyStore {
    fn upsert_identity_key(
        &self,
        user_id: &str,
        device_id: &str,
        public_key: &str,
    ) -> Result<IdentityKey, KeyError> {
        let conn = self.conn.lock();
        let key = conn.query_row(
            "INSERT INTO identity_keys (user_id, device_id, public_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_id, device_id) DO UPDATE
                SET public_key = excluded.public_key, updated_at = excluded.updated_at
             RETURNING user_id, device_id, public_key, created_at, updated_at",
            params![user_id, device_id, public_key, to_millis(Utc::now())],
            identity_from_row,
        )?;
        Ok(key)
    }

    fn find_identity_key(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<IdentityKey>, KeyError> {
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                "SELECT user_id, device_id, public_key, created_at, updated_at
                 FROM identity_keys WHERE user_id = ?1 AND device_id = ?2",
                params![user_id, device_id],
                identity_from_row,
            )
            .optional()?;
        Ok(key)
    }

    fn create_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
        key: &NewSignedPreKey,
        lifetime: Duration,
    ) -> Result<SignedPreKey, KeyError> {
        let now = Utc::now();
        let expires_at = expiry_after(now, lifetime)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signed_prekeys
                (user_id, device_id, key_id, public_key, signature, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                device_id,
                key.key_id,
                key.public_key,
                key.signature,
                to_millis(now),
                to_millis(expires_at)
            ],
        )
        .map_err(|e| match KeyError::from(e) {
            KeyError::Conflict(_) => KeyError::Conflict(format!(
                "signed prekey id {} already exists for this device",
                key.key_id
            )),
            other => other,
        })?;

        Ok(SignedPreKey {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            key_id: key.key_id,
            public_key: key.public_key.clone(),
            signature: key.signature.clone(),
            created_at: from_millis(to_millis(now)),
            expires_at: from_millis(to_millis(expires_at)),
        })
    }

    fn signed_prekey_exists(
        &self,
        user_id: &str,
        device_id: &str,
        key_id: u32,
    ) -> Result<bool, KeyError> {
        let conn = self.conn.lock();
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM signed_prekeys
                           WHERE user_id = ?1 AND device_id = ?2 AND key_id = ?3)",
            params![user_id, device_id, key_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn find_active_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<SignedPreKey>, KeyError> {
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                &format!(
                    "SELECT {SIGNED_PREKEY_COLUMNS} FROM signed_prekeys
                     WHERE user_id = ?1 AND device_id = ?2 AND expires_at > ?3
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![user_id, device_id, to_millis(Utc::now())],
                signed_prekey_from_row,
            )
            .optional()?;
        Ok(key)
    }

    fn create_prekeys(
        &self,
        user_id: &str,
        device_id: &str,
        keys: &[NewPreKey],
        max_unused: usize,
    ) -> Result<usize, KeyError> {
        let now = to_millis(Utc::now());
        let mut conn = self.conn.lock();
        // IMMEDIATE takes the write lock before the count, so no other
        // writer can grow the pool between the count and the inserts.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: i64 = tx.query_row(
            "SELECT COUNT(*) FROM prekeys WHERE user_id = ?1 AND device_id = ?2 AND is_used = 0",
            params![user_id, device_id],
            |row| row.get(0),
        )?;
        capacity_check(to_count(current), keys.len(), max_unused)?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO prekeys
                    (user_id, device_id, key_id, public_key, is_one_time, is_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, 0, ?5)",
            )?;
            for key in keys {
                stmt.execute(params![user_id, device_id, key.key_id, key.public_key, now])
                    .map_err(|e| match KeyError::from(e) {
                        KeyError::Conflict(_) => KeyError::Conflict(format!(
                            "prekey id {} already exists for this device",
                            key.key_id
                        )),
                        other => other,
                    })?;
            }
        }
        tx.commit()?;
        Ok(keys.len())
    }

    fn claim_unused_prekey(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<PreKey>, KeyError> {
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                &format!(
                    "UPDATE prekeys SET is_used = 1, used_at = ?3
                     WHERE id = (SELECT id FROM prekeys
                                 WHERE user_id = ?1 AND device_id = ?2 AND is_used = 0
                                 ORDER BY RANDOM() LIMIT 1)
                       AND is_used = 0
                     RETURNING {PREKEY_COLUMNS}"
                ),
                params![user_id, device_id, to_millis(Utc::now())],
                prekey_from_row,
            )
            .optional()?;
        Ok(key)
    }

    fn count_unused(&self, user_id: &str, device_id: &str) -> Result<usize, KeyError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM prekeys WHERE user_id = ?1 AND device_id = ?2 AND is_used = 0",
            params![user_id, device_id],
            |row| row.get(0),
        )?;
        Ok(to_count(count))
    }

    fn devices_below_threshold(&self, threshold: usize) -> Result<Vec<DevicePoolLevel>, KeyError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT i.user_id, i.device_id, COUNT(p.id) AS unused
             FROM identity_keys i
             LEFT JOIN prekeys p
                ON p.user_id = i.user_id AND p.device_id = i.device_id AND p.is_used = 0
             GROUP BY i.user_id, i.device_id
             HAVING unused < ?1
             ORDER BY i.user_id, i.device_id",
        )?;
        let rows = stmt.query_map(
            params![i64::try_from(threshold).unwrap_or(i64::MAX)],
            |row| {
                Ok(DevicePoolLevel {
                    device: DeviceAddress::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    unused_prekeys: to_count(row.get(2)?),
                })
            },
        )?;
        let levels = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(levels)
    }

    fn delete_all_keys_for_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<DeletedKeys, KeyError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let identity_keys = tx.execute(
            "DELETE FROM identity_keys WHERE user_id = ?1 AND device_id = ?2",
            params![user_id, device_id],
        )?;
        let signed_prekeys = tx.execute(
            "DELETE FROM signed_prekeys WHERE user_id = ?1 AND device_id = ?2",
            params![user_id, device_id],
        )?;
        let prekeys = tx.execute(
            "DELETE FROM prekeys WHERE user_id = ?1 AND device_id = ?2",
            params![user_id, device_id],
        )?;
        tx.commit()?;
        Ok(DeletedKeys {
            identity_keys,
            signed_prekeys,
            prekeys,
        })
    }

    fn delete_all_keys_for_user(&self, user_id: &str) -> Result<DeletedKeys, KeyError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let identity_keys =
            tx.execute("DELETE FROM identity_keys WHERE user_id = ?1", params![user_id])?;
        let signed_prekeys =
            tx.execute("DELETE FROM signed_prekeys WHERE user_id = ?1", params![user_id])?;
        let prekeys = tx.execute("DELETE FROM prekeys WHERE user_id = ?1", params![user_id])?;
        tx.commit()?;
        Ok(DeletedKeys {
            identity_keys,
            signed_prekeys,
            prekeys,
        })
    }

    fn find_expired_signed_prekeys(&self) -> Result<Vec<SignedPreKey>, KeyError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SIGNED_PREKEY_COLUMNS} FROM signed_prekeys
             WHERE expires_at <= ?1 ORDER BY expires_at"
        ))?;
        let rows = stmt.query_map(params![to_millis(Utc::now())], signed_prekey_from_row)?;
        let keys = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn delete_expired_signed_prekey(&self, id: i64) -> Result<bool, KeyError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM signed_prekeys WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn find_old_unused_prekeys(&self, age_days: i64) -> Result<Vec<PreKey>, KeyError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PREKEY_COLUMNS} FROM prekeys
             WHERE is_used = 0 AND created_at < ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![to_millis(cutoff_days(age_days))], prekey_from_row)?;
        let keys = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn delete_old_unused_prekeys(&self, age_days: i64) -> Result<usize, KeyError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM prekeys WHERE is_used = 0 AND created_at < ?1",
            params![to_millis(cutoff_days(age_days))],
        )?;
        Ok(deleted)
    }

    fn delete_used_prekeys(&self, age_days: i64) -> Result<usize, KeyError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM prekeys WHERE is_used = 1 AND used_at < ?1",
            params![to_millis(cutoff_days(age_days))],
        )?;
        Ok(deleted)
    }
}
