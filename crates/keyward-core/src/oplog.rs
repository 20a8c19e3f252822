use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, Row, params, params_from_iter, types::Value};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{HsmError, HsmResult},
    fs_utils,
    models::{
        VerificationOutcome, duration_to_nanos, nanos, timestamp_from_nanos, timestamp_to_nanos,
    },
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    KeyGeneration,
    Sign,
    Verify,
    Encrypt,
    Decrypt,
    Hash,
    HashAndSign,
    HashVerify,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::KeyGeneration => "key_generation",
            OperationType::Sign => "sign",
            OperationType::Verify => "verify",
            OperationType::Encrypt => "encrypt",
            OperationType::Decrypt => "decrypt",
            OperationType::Hash => "hash",
            OperationType::HashAndSign => "hash_and_sign",
            OperationType::HashVerify => "hash_verify",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = HsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "key_generation" => Ok(OperationType::KeyGeneration),
            "sign" => Ok(OperationType::Sign),
            "verify" => Ok(OperationType::Verify),
            "encrypt" => Ok(OperationType::Encrypt),
            "decrypt" => Ok(OperationType::Decrypt),
            "hash" => Ok(OperationType::Hash),
            "hash_and_sign" => Ok(OperationType::HashAndSign),
            "hash_verify" => Ok(OperationType::HashVerify),
            other => Err(HsmError::invalid(format!("unknown operation type {other}"))),
        }
    }
}

/// Immutable entry describing one dispatcher call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationRecord {
    pub id: Uuid,
    pub operation: OperationType,
    pub key_label: Option<String>,
    pub algorithm: Option<String>,
    pub input_size: u64,
    pub digest: Option<String>,
    pub signature: Option<String>,
    pub outcome: Option<VerificationOutcome>,
    #[serde(rename = "duration_ns", with = "nanos")]
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl OperationRecord {
    pub fn new(operation: OperationType) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            key_label: None,
            algorithm: None,
            input_size: 0,
            digest: None,
            signature: None,
            outcome: None,
            duration: Duration::ZERO,
            success: false,
            error: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Truncate an artifact for storage, keeping `max_chars` characters.
pub fn preview(artifact: &str, max_chars: usize) -> String {
    if artifact.chars().count() <= max_chars {
        return artifact.to_string();
    }
    let mut out: String = artifact.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, Default)]
pub struct OperationQuery {
    pub operation: Option<OperationType>,
    pub key_label: Option<String>,
    pub since: Option<OffsetDateTime>,
    pub until: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

impl OperationQuery {
    pub fn operation(operation: OperationType) -> Self {
        Self {
            operation: Some(operation),
            ..Default::default()
        }
    }

    pub fn key(label: impl Into<String>) -> Self {
        Self {
            key_label: Some(label.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &OperationRecord) -> bool {
        if let Some(operation) = self.operation
            && record.operation != operation
        {
            return false;
        }
        if let Some(label) = self.key_label.as_deref()
            && record.key_label.as_deref() != Some(label)
        {
            return false;
        }
        if let Some(since) = self.since
            && record.timestamp < since
        {
            return false;
        }
        if let Some(until) = self.until
            && record.timestamp > until
        {
            return false;
        }
        true
    }
}

pub trait OperationLog: Send + Sync {
    fn append(&self, record: OperationRecord) -> HsmResult<()>;
    /// Matching records, newest first.
    fn query(&self, query: &OperationQuery) -> HsmResult<Vec<OperationRecord>>;
    /// Drop records older than `cutoff`, returning how many were removed.
    fn prune_before(&self, cutoff: OffsetDateTime) -> HsmResult<u64>;
}

fn newest_first(
    records: impl DoubleEndedIterator<Item = OperationRecord>,
    query: &OperationQuery,
) -> Vec<OperationRecord> {
    let limit = query.limit.unwrap_or(usize::MAX);
    let mut matched: Vec<_> = records.rev().filter(|r| query.matches(r)).collect();
    matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    matched.truncate(limit);
    matched
}

#[derive(Default)]
pub struct MemoryOperationLog {
    records: RwLock<Vec<OperationRecord>>,
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl OperationLog for MemoryOperationLog {
    fn append(&self, record: OperationRecord) -> HsmResult<()> {
        self.records.write().push(record);
        Ok(())
    }

    fn query(&self, query: &OperationQuery) -> HsmResult<Vec<OperationRecord>> {
        let records = self.records.read();
        Ok(newest_first(records.iter().cloned(), query))
    }

    fn prune_before(&self, cutoff: OffsetDateTime) -> HsmResult<u64> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

/// Append-only JSON-lines log guarded by an exclusive file lock.
pub struct FileOperationLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileOperationLog {
    pub fn new<P: AsRef<Path>>(path: P) -> HsmResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs_utils::ensure_secure_dir(dir).map_err(HsmError::storage)?;
        }
        fs_utils::ensure_file_permissions(&path).map_err(HsmError::storage)?;
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> HsmResult<Vec<OperationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(HsmError::storage)?;
        FileExt::lock_shared(&file).map_err(HsmError::storage)?;
        let records = read_records(&file);
        FileExt::unlock(&file).map_err(HsmError::storage)?;
        records
    }

    /// Open the live log and take its exclusive lock. A prune may swap the file
    /// while we wait on the old one, so retry until the locked file is the one
    /// still linked at `path`.
    fn lock_current(&self) -> HsmResult<File> {
        loop {
            let mut options = OpenOptions::new();
            options.create(true).read(true).append(true);
            let file =
                fs_utils::open_secure(&self.path, &mut options).map_err(HsmError::storage)?;
            FileExt::lock_exclusive(&file).map_err(HsmError::storage)?;
            if !fs_utils::is_unlinked(&file).map_err(HsmError::storage)? {
                return Ok(file);
            }
            FileExt::unlock(&file).map_err(HsmError::storage)?;
        }
    }

    fn rewrite(&self, records: &[OperationRecord]) -> HsmResult<()> {
        let staging = fs_utils::staging_path(&self.path);
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        let file = fs_utils::open_secure(&staging, &mut options).map_err(HsmError::storage)?;
        let mut writer = BufWriter::new(&file);
        for record in records {
            serde_json::to_writer(&mut writer, record).map_err(HsmError::storage)?;
            writer.write_all(b"\n").map_err(HsmError::storage)?;
        }
        writer.flush().map_err(HsmError::storage)?;
        drop(writer);
        file.sync_all().map_err(HsmError::storage)?;
        std::fs::rename(&staging, &self.path).map_err(HsmError::storage)
    }
}

fn read_records(file: &File) -> HsmResult<Vec<OperationRecord>> {
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(HsmError::storage)?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line).map_err(HsmError::storage)?);
    }
    Ok(records)
}

impl OperationLog for FileOperationLog {
    fn append(&self, record: OperationRecord) -> HsmResult<()> {
        let _guard = self.lock.lock();
        let file = self.lock_current()?;
        let mut writer = BufWriter::new(&file);
        serde_json::to_writer(&mut writer, &record).map_err(HsmError::storage)?;
        writer.write_all(b"\n").map_err(HsmError::storage)?;
        writer.flush().map_err(HsmError::storage)?;
        drop(writer);
        file.sync_all().map_err(HsmError::storage)?;
        FileExt::unlock(&file).map_err(HsmError::storage)?;
        Ok(())
    }

    fn query(&self, query: &OperationQuery) -> HsmResult<Vec<OperationRecord>> {
        let _guard = self.lock.lock();
        Ok(newest_first(self.read_all()?.into_iter(), query))
    }

    /// Read, filter and swap in the pruned file under one exclusive lock, so
    /// an append from another handle lands either before the read or in the
    /// new file.
    fn prune_before(&self, cutoff: OffsetDateTime) -> HsmResult<u64> {
        let _guard = self.lock.lock();
        let file = self.lock_current()?;
        let pruned = read_records(&file).and_then(|records| {
            let before = records.len();
            let kept: Vec<_> = records.into_iter().filter(|r| r.timestamp >= cutoff).collect();
            let removed = (before - kept.len()) as u64;
            if removed > 0 {
                self.rewrite(&kept)?;
            }
            Ok(removed)
        });
        FileExt::unlock(&file).map_err(HsmError::storage)?;
        pruned
    }
}

/// SQLite-backed log supporting indexed queries by operation, key and time.
pub struct SqliteOperationLog {
    conn: Mutex<Connection>,
}

impl SqliteOperationLog {
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
            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                key_label TEXT,
                algorithm TEXT,
                input_size INTEGER NOT NULL,
                digest TEXT,
                signature TEXT,
                outcome TEXT,
                duration_ns INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error TEXT,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS operations_by_type ON operations (operation, timestamp);
            CREATE INDEX IF NOT EXISTS operations_by_key ON operations (key_label, timestamp);
            "#,
        )
        .map_err(HsmError::storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read_row(row: &Row<'_>) -> rusqlite::Result<RawOperation> {
        Ok(RawOperation {
            id: row.get(0)?,
            operation: row.get(1)?,
            key_label: row.get(2)?,
            algorithm: row.get(3)?,
            input_size: row.get(4)?,
            digest: row.get(5)?,
            signature: row.get(6)?,
            outcome: row.get(7)?,
            duration_ns: row.get(8)?,
            success: row.get(9)?,
            error: row.get(10)?,
            timestamp: row.get(11)?,
        })
    }
}

struct RawOperation {
    id: String,
    operation: String,
    key_label: Option<String>,
    algorithm: Option<String>,
    input_size: i64,
    digest: Option<String>,
    signature: Option<String>,
    outcome: Option<String>,
    duration_ns: i64,
    success: bool,
    error: Option<String>,
    timestamp: i64,
}

impl RawOperation {
    fn into_record(self) -> HsmResult<OperationRecord> {
        Ok(OperationRecord {
            id: Uuid::parse_str(&self.id).map_err(HsmError::storage)?,
            operation: self.operation.parse().map_err(HsmError::storage)?,
            key_label: self.key_label,
            algorithm: self.algorithm,
            input_size: u64::try_from(self.input_size).map_err(HsmError::storage)?,
            digest: self.digest,
            signature: self.signature,
            outcome: self
                .outcome
                .map(|o| o.parse::<VerificationOutcome>())
                .transpose()?,
            duration: Duration::from_nanos(
                u64::try_from(self.duration_ns).map_err(HsmError::storage)?,
            ),
            success: self.success,
            error: self.error,
            timestamp: timestamp_from_nanos(self.timestamp)?,
        })
    }
}

fn to_i64(value: u64) -> HsmResult<i64> {
    i64::try_from(value).map_err(HsmError::storage)
}

impl OperationLog for SqliteOperationLog {
    fn append(&self, record: OperationRecord) -> HsmResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO operations (
                id, operation, key_label, algorithm, input_size, digest, signature, outcome,
                duration_ns, success, error, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id.to_string(),
                record.operation.as_str(),
                record.key_label,
                record.algorithm,
                to_i64(record.input_size)?,
                record.digest,
                record.signature,
                record.outcome.map(|o| o.as_str()),
                to_i64(duration_to_nanos(record.duration))?,
                record.success,
                record.error,
                timestamp_to_nanos(record.timestamp),
            ],
        )
        .map_err(HsmError::storage)?;
        Ok(())
    }

    fn query(&self, query: &OperationQuery) -> HsmResult<Vec<OperationRecord>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(operation) = query.operation {
            values.push(Value::Text(operation.as_str().to_string()));
            clauses.push(format!("operation = ?{}", values.len()));
        }
        if let Some(label) = &query.key_label {
            values.push(Value::Text(label.clone()));
            clauses.push(format!("key_label = ?{}", values.len()));
        }
        if let Some(since) = query.since {
            values.push(Value::Integer(timestamp_to_nanos(since)));
            clauses.push(format!("timestamp >= ?{}", values.len()));
        }
        if let Some(until) = query.until {
            values.push(Value::Integer(timestamp_to_nanos(until)));
            clauses.push(format!("timestamp <= ?{}", values.len()));
        }
        let mut sql = String::from(
            "SELECT id, operation, key_label, algorithm, input_size, digest, signature, outcome, \
             duration_ns, success, error, timestamp FROM operations",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC");
        if let Some(limit) = query.limit {
            values.push(Value::Integer(to_i64(limit as u64)?));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(HsmError::storage)?;
        let rows = stmt
            .query_map(params_from_iter(values), Self::read_row)
            .map_err(HsmError::storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(HsmError::storage)?;
        rows.into_iter().map(RawOperation::into_record).collect()
    }

    fn prune_before(&self, cutoff: OffsetDateTime) -> HsmResult<u64> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM operations WHERE timestamp < ?1",
                params![timestamp_to_nanos(cutoff)],
            )
            .map_err(HsmError::storage)?;
        Ok(affected as u64)
    }
}
