use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex as ParkingMutex, RwLock};
use rusqlite::{Connection, OptionalExtension, Row, params};
use time::OffsetDateTime;

use crate::{
    error::{HsmError, HsmResult},
    fs_utils,
    models::{KeyFilter, KeyRecord, KeyType, timestamp_from_nanos, timestamp_to_nanos},
};

/// Persisted metadata for device keys, keyed by label. The registry alone
/// decides whether a key may be used.
pub trait KeyRegistry: Send + Sync {
    /// Insert the record, replacing any existing record under the same label.
    fn upsert(&self, record: KeyRecord) -> HsmResult<()>;
    fn get(&self, label: &str) -> HsmResult<Option<KeyRecord>>;
    /// Records admitted by `filter`, newest first.
    fn list(&self, filter: KeyFilter) -> HsmResult<Vec<KeyRecord>>;
    /// Returns `false` when the label is unknown.
    fn set_active(&self, label: &str, active: bool) -> HsmResult<bool>;
    /// Bump the usage counter and last-used time in one atomic step.
    fn touch_usage(&self, label: &str, at: OffsetDateTime) -> HsmResult<bool>;

    /// The record a bare "default" selector refers to: newest `created_at`,
    /// later insertion on ties.
    fn most_recent(&self) -> HsmResult<Option<KeyRecord>> {
        Ok(self.list(KeyFilter::All)?.into_iter().next())
    }
}

struct MemoryEntry {
    record: KeyRecord,
    seq: u64,
}

/// In-memory registry for tests and ephemeral deployments.
pub struct MemoryKeyRegistry {
    inner: RwLock<HashMap<String, MemoryEntry>>,
    seq: AtomicU64,
}

impl Default for MemoryKeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(1),
        }
    }
}

impl KeyRegistry for MemoryKeyRegistry {
    fn upsert(&self, record: KeyRecord) -> HsmResult<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .insert(record.label.clone(), MemoryEntry { record, seq });
        Ok(())
    }

    fn get(&self, label: &str) -> HsmResult<Option<KeyRecord>> {
        Ok(self.inner.read().get(label).map(|e| e.record.clone()))
    }

    fn list(&self, filter: KeyFilter) -> HsmResult<Vec<KeyRecord>> {
        let guard = self.inner.read();
        let mut entries: Vec<&MemoryEntry> = guard
            .values()
            .filter(|entry| filter.admits(&entry.record))
            .collect();
        entries.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(entries.into_iter().map(|e| e.record.clone()).collect())
    }

    fn set_active(&self, label: &str, active: bool) -> HsmResult<bool> {
        let mut guard = self.inner.write();
        match guard.get_mut(label) {
            Some(entry) => {
                entry.record.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn touch_usage(&self, label: &str, at: OffsetDateTime) -> HsmResult<bool> {
        let mut guard = self.inner.write();
        match guard.get_mut(label) {
            Some(entry) => {
                entry.record.usage_count += 1;
                entry.record.last_used = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// SQLite-backed registry. Timestamps are stored as unix nanoseconds so ordering
/// happens in SQL.
pub struct SqliteKeyRegistry {
    conn: ParkingMutex<Connection>,
}

impl SqliteKeyRegistry {
    pub fn new<P: AsRef<Path>>(path: P) -> HsmResult<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs_utils::ensure_secure_dir(dir).map_err(HsmError::storage)?;
        }
        let conn = Connection::open(path).map_err(HsmError::storage)?;
        fs_utils::ensure_file_permissions(path).map_err(HsmError::storage)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> HsmResult<Self> {
        let conn = Connection::open_in_memory().map_err(HsmError::storage)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> HsmResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS key_registry (
                label TEXT PRIMARY KEY,
                key_type TEXT NOT NULL,
                key_size INTEGER NOT NULL,
                public_info TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_used INTEGER,
                usage_count INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL,
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS key_registry_created
                ON key_registry (created_at DESC, seq DESC);
            "#,
        )
        .map_err(HsmError::storage)?;
        Ok(Self {
            conn: ParkingMutex::new(conn),
        })
    }

    fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            label: row.get(0)?,
            key_type: row.get(1)?,
            key_size: row.get(2)?,
            public_info: row.get(3)?,
            created_at: row.get(4)?,
            last_used: row.get(5)?,
            usage_count: row.get(6)?,
            active: row.get(7)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT label, key_type, key_size, public_info, created_at, \
     last_used, usage_count, active FROM key_registry";

struct RawRecord {
    label: String,
    key_type: String,
    key_size: u32,
    public_info: String,
    created_at: i64,
    last_used: Option<i64>,
    usage_count: i64,
    active: bool,
}

impl RawRecord {
    fn into_record(self) -> HsmResult<KeyRecord> {
        let key_type: KeyType = self.key_type.parse().map_err(HsmError::storage)?;
        Ok(KeyRecord {
            label: self.label,
            key_type,
            key_size: self.key_size,
            public_info: self.public_info,
            created_at: timestamp_from_nanos(self.created_at)?,
            last_used: self.last_used.map(timestamp_from_nanos).transpose()?,
            usage_count: u64::try_from(self.usage_count).map_err(HsmError::storage)?,
            active: self.active,
        })
    }
}

impl KeyRegistry for SqliteKeyRegistry {
    fn upsert(&self, record: KeyRecord) -> HsmResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO key_registry (
                label, key_type, key_size, public_info, created_at, last_used, usage_count, active, seq
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM key_registry)
            )
            ON CONFLICT(label) DO UPDATE SET
                key_type = excluded.key_type,
                key_size = excluded.key_size,
                public_info = excluded.public_info,
                created_at = excluded.created_at,
                last_used = excluded.last_used,
                usage_count = excluded.usage_count,
                active = excluded.active,
                seq = excluded.seq
            "#,
            params![
                record.label,
                record.key_type.as_str(),
                record.key_size,
                record.public_info,
                timestamp_to_nanos(record.created_at),
                record.last_used.map(timestamp_to_nanos),
                i64::try_from(record.usage_count).map_err(HsmError::storage)?,
                record.active,
            ],
        )
        .map_err(HsmError::storage)?;
        Ok(())
    }

    fn get(&self, label: &str) -> HsmResult<Option<KeyRecord>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE label = ?1"),
                params![label],
                Self::read_row,
            )
            .optional()
            .map_err(HsmError::storage)?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn list(&self, filter: KeyFilter) -> HsmResult<Vec<KeyRecord>> {
        let conn = self.conn.lock();
        let sql = match filter {
            KeyFilter::All => format!("{SELECT_COLUMNS} ORDER BY created_at DESC, seq DESC"),
            KeyFilter::Active => {
                format!("{SELECT_COLUMNS} WHERE active = 1 ORDER BY created_at DESC, seq DESC")
            }
        };
        let mut stmt = conn.prepare(&sql).map_err(HsmError::storage)?;
        let rows = stmt
            .query_map([], Self::read_row)
            .map_err(HsmError::storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(HsmError::storage)?;
        rows.into_iter().map(RawRecord::into_record).collect()
    }

    fn set_active(&self, label: &str, active: bool) -> HsmResult<bool> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE key_registry SET active = ?2 WHERE label = ?1",
                params![label, active],
            )
            .map_err(HsmError::storage)?;
        Ok(affected > 0)
    }

    fn touch_usage(&self, label: &str, at: OffsetDateTime) -> HsmResult<bool> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE key_registry SET usage_count = usage_count + 1, last_used = ?2 WHERE label = ?1",
                params![label, timestamp_to_nanos(at)],
            )
            .map_err(HsmError::storage)?;
        Ok(affected > 0)
    }

    fn most_recent(&self) -> HsmResult<Option<KeyRecord>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} ORDER BY created_at DESC, seq DESC LIMIT 1"),
                [],
                Self::read_row,
            )
            .optional()
            .map_err(HsmError::storage)?;
        raw.map(RawRecord::into_record).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use time::Duration;

    fn record_at(label: &str, created_at: OffsetDateTime, active: bool) -> KeyRecord {
        let mut record = KeyRecord::new(label, KeyType::Rsa, 2048, "pem", active);
        record.created_at = created_at;
        record
    }

    fn exercise(registry: &dyn KeyRegistry) {
        let base = OffsetDateTime::now_utc();
        registry
            .upsert(record_at("old", base - Duration::seconds(10), true))
            .expect("upsert");
        registry
            .upsert(record_at("new", base, false))
            .expect("upsert");

        let all = registry.list(KeyFilter::All).expect("list");
        let labels: Vec<_> = all.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["new", "old"]);

        let active = registry.list(KeyFilter::Active).expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].label, "old");

        assert_eq!(
            registry.most_recent().expect("recent").map(|r| r.label),
            Some("new".to_string())
        );

        assert!(registry.set_active("new", true).expect("activate"));
        assert!(!registry.set_active("ghost", true).expect("activate"));
        assert!(registry.get("new").expect("get").expect("present").active);

        let used_at = base + Duration::seconds(1);
        assert!(registry.touch_usage("old", used_at).expect("touch"));
        assert!(registry.touch_usage("old", used_at).expect("touch"));
        assert!(!registry.touch_usage("ghost", used_at).expect("touch"));
        let old = registry.get("old").expect("get").expect("present");
        assert_eq!(old.usage_count, 2);
        assert_eq!(old.last_used, Some(used_at));

        registry
            .upsert(record_at("old", base - Duration::seconds(10), true))
            .expect("replace");
        let replaced = registry.get("old").expect("get").expect("present");
        assert_eq!(replaced.usage_count, 0);
        assert!(registry.get("ghost").expect("get").is_none());
    }

    #[test]
    fn memory_registry_semantics() {
        exercise(&MemoryKeyRegistry::new());
    }

    #[test]
    fn sqlite_registry_semantics() {
        exercise(&SqliteKeyRegistry::in_memory().expect("sqlite"));
    }

    #[test]
    fn ties_on_created_at_prefer_later_insert() {
        let at = OffsetDateTime::now_utc();
        let memory = MemoryKeyRegistry::new();
        let sqlite = SqliteKeyRegistry::in_memory().expect("sqlite");
        for registry in [&memory as &dyn KeyRegistry, &sqlite] {
            registry.upsert(record_at("first", at, true)).expect("upsert");
            registry.upsert(record_at("second", at, true)).expect("upsert");
            assert_eq!(
                registry.most_recent().expect("recent").map(|r| r.label),
                Some("second".to_string())
            );
        }
    }

    #[test]
    fn sqlite_registry_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.db");
        {
            let registry = SqliteKeyRegistry::new(&path).expect("open");
            registry
                .upsert(KeyRecord::new("k1", KeyType::Ec, 256, "04ab", true))
                .expect("upsert");
        }
        let registry = SqliteKeyRegistry::new(&path).expect("reopen");
        let record = registry.get("k1").expect("get").expect("present");
        assert_eq!(record.key_type, KeyType::Ec);
        assert_eq!(record.key_size, 256);
    }

    #[test]
    fn concurrent_touches_are_not_lost() {
        let registry = Arc::new(MemoryKeyRegistry::new());
        registry
            .upsert(KeyRecord::new("hot", KeyType::Rsa, 2048, "pem", true))
            .expect("upsert");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        registry
                            .touch_usage("hot", OffsetDateTime::now_utc())
                            .expect("touch");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let record = registry.get("hot").expect("get").expect("present");
        assert_eq!(record.usage_count, 400);
    }
}
