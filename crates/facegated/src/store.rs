use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use facegate_core::{Embedding, Gallery, GalleryEntry};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_DIM: usize = 512;
const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("unknown employee: {0}")]
    UnknownEmployee(String),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected 512)")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// Direction of an attendance mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkDirection {
    In,
    Out,
}

impl std::fmt::Display for MarkDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkDirection::In => write!(f, "IN"),
            MarkDirection::Out => write!(f, "OUT"),
        }
    }
}

/// The result of marking attendance for a verified employee.
#[derive(Debug, Clone)]
pub struct MarkEvent {
    pub employee: String,
    pub direction: MarkDirection,
    pub time: String,
}

/// Enrolled employee metadata (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmployeeInfo {
    pub id: String,
    pub name: String,
    pub model_version: String,
    pub created_at: String,
}

/// One attendance row for the daily report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttendanceRecord {
    pub employee: String,
    pub date: String,
    pub time_in: String,
    pub time_out: Option<String>,
    pub status: String,
}

/// SQLite-backed employee and attendance storage.
///
/// Embeddings are AES-256-GCM encrypted at rest. A per-installation
/// 32-byte key is generated at first use and stored at `{db_dir}/.key`
/// (mode 0600). Legacy plaintext blobs (2048 bytes) are accepted
/// transparently.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/facegate"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS employees (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL UNIQUE,
                     embedding BLOB NOT NULL,
                     model_version TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS attendance (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     employee_id TEXT NOT NULL REFERENCES employees(id) ON DELETE CASCADE,
                     date TEXT NOT NULL,
                     time_in TEXT NOT NULL,
                     time_out TEXT,
                     status TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance(employee_id, date);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Enroll an employee, replacing the stored embedding when the name is
    /// already present. Returns the employee id.
    pub async fn enroll(&self, name: &str, embedding: &Embedding) -> Result<String, StoreError> {
        validate_embedding_values(&embedding.values)?;
        let blob = self.encrypt_embedding(&embedding.values)?;
        let model_version = embedding
            .model_version
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let created_at = chrono::Utc::now().to_rfc3339();
        let name = name.to_string();

        self.conn
            .call(move |conn| {
                let existing: Option<String> = conn
                    .query_row("SELECT id FROM employees WHERE name = ?1", [&name], |row| {
                        row.get(0)
                    })
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                match existing {
                    Some(id) => {
                        conn.execute(
                            "UPDATE employees SET embedding = ?1, model_version = ?2 WHERE id = ?3",
                            rusqlite::params![blob, model_version, id],
                        )?;
                        Ok(id)
                    }
                    None => {
                        let id = uuid::Uuid::new_v4().to_string();
                        conn.execute(
                            "INSERT INTO employees (id, name, embedding, model_version, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            rusqlite::params![id, name, blob, model_version, created_at],
                        )?;
                        Ok(id)
                    }
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove an employee by name. Attendance rows cascade.
    pub async fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM employees WHERE name = ?1", [&name])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Build the in-memory gallery for the matcher: every employee with a
    /// decrypted embedding.
    pub async fn gallery(&self) -> Result<Gallery, StoreError> {
        let rows: Vec<(String, Vec<u8>, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, embedding, model_version FROM employees ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (name, blob, model_version) in rows {
            let values = self.decrypt_embedding(&blob)?;
            entries.push(GalleryEntry {
                name,
                embedding: Embedding {
                    values,
                    model_version: Some(model_version),
                },
            });
        }
        Ok(Gallery::new(entries))
    }

    /// Mark attendance for an employee by name, using the local clock.
    ///
    /// Daily toggle: first mark of the day opens an IN record; a mark while
    /// a record is open closes it as OUT; any further mark opens a new IN.
    pub async fn mark(&self, name: &str) -> Result<MarkEvent, StoreError> {
        let now = chrono::Local::now();
        let date = now.format("%Y-%m-%d").to_string();
        let time = now.format("%H:%M:%S").to_string();
        self.mark_at(name, &date, &time).await
    }

    /// Mark attendance at an explicit date and time (exposed for tests).
    pub async fn mark_at(&self, name: &str, date: &str, time: &str) -> Result<MarkEvent, StoreError> {
        let name = name.to_string();
        let date = date.to_string();
        let time = time.to_string();

        self.conn
            .call(move |conn| {
                let employee_id: String = conn
                    .query_row("SELECT id FROM employees WHERE name = ?1", [&name], |row| {
                        row.get(0)
                    })
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => tokio_rusqlite::Error::Other(
                            Box::new(StoreError::UnknownEmployee(name.clone())),
                        ),
                        other => other.into(),
                    })?;

                // Latest open record for today, if any.
                let open_id: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM attendance
                         WHERE employee_id = ?1 AND date = ?2 AND time_out IS NULL
                         ORDER BY id DESC LIMIT 1",
                        rusqlite::params![employee_id, date],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let direction = match open_id {
                    Some(id) => {
                        conn.execute(
                            "UPDATE attendance SET time_out = ?1, status = 'OUT' WHERE id = ?2",
                            rusqlite::params![time, id],
                        )?;
                        MarkDirection::Out
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO attendance (employee_id, date, time_in, time_out, status)
                             VALUES (?1, ?2, ?3, NULL, 'IN')",
                            rusqlite::params![employee_id, date, time],
                        )?;
                        MarkDirection::In
                    }
                };

                Ok(MarkEvent {
                    employee: name,
                    direction,
                    time,
                })
            })
            .await
            .map_err(unwrap_other)
    }

    /// Attendance rows for the local calendar day.
    pub async fn today(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.report_for(&date).await
    }

    /// Attendance rows for an explicit date.
    pub async fn report_for(&self, date: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        let date = date.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT e.name, a.date, a.time_in, a.time_out, a.status
                     FROM attendance a JOIN employees e ON e.id = a.employee_id
                     WHERE a.date = ?1 ORDER BY a.id",
                )?;
                let rows = stmt.query_map([&date], |row| {
                    Ok(AttendanceRecord {
                        employee: row.get(0)?,
                        date: row.get(1)?,
                        time_in: row.get(2)?,
                        time_out: row.get(3)?,
                        status: row.get(4)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// List enrolled employees, metadata only.
    pub async fn list_employees(&self) -> Result<Vec<EmployeeInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, model_version, created_at FROM employees ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(EmployeeInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        model_version: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count enrolled employees.
    pub async fn count_employees(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM employees", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt an embedding blob.
    ///
    /// Accepts the legacy plaintext format (512 x 4 = 2048 bytes) and the
    /// current encrypted format (12-byte nonce + ciphertext + GCM tag).
    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        const NONCE_LEN: usize = 12;

        if blob.len() == EMBEDDING_BYTE_LEN {
            // Legacy plaintext, accepted transparently; re-encrypted on
            // the next enrollment of that employee.
            return bytes_to_embedding_strict(blob);
        }

        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding_strict(&plaintext)
    }
}

/// Surface a `StoreError` smuggled through `tokio_rusqlite::Error::Other`.
fn unwrap_other(err: tokio_rusqlite::Error) -> StoreError {
    match err {
        tokio_rusqlite::Error::Other(boxed) => match boxed.downcast::<StoreError>() {
            Ok(store_err) => *store_err,
            Err(other) => StoreError::Db(tokio_rusqlite::Error::Other(other)),
        },
        other => StoreError::Db(other),
    }
}

// ── Key management ──────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ───────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(EMBEDDING_DIM);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }

    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(seed: f32) -> Embedding {
        Embedding {
            values: (0..EMBEDDING_DIM)
                .map(|i| seed + i as f32 / EMBEDDING_DIM as f32)
                .collect(),
            model_version: Some("w600k_r50".to_string()),
        }
    }

    async fn open_memory() -> AttendanceStore {
        AttendanceStore::open(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn enroll_and_gallery_roundtrip() {
        let store = open_memory().await;
        let emb = embedding(0.0);

        let id = store.enroll("ALICE", &emb).await.unwrap();
        assert!(!id.is_empty());

        let gallery = store.gallery().await.unwrap();
        assert_eq!(gallery.len(), 1);
        let entry = &gallery.entries()[0];
        assert_eq!(entry.name, "ALICE");
        for (orig, rec) in emb.values.iter().zip(entry.embedding.values.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
        assert_eq!(entry.embedding.model_version.as_deref(), Some("w600k_r50"));
    }

    #[tokio::test]
    async fn reenroll_replaces_embedding_keeps_id() {
        let store = open_memory().await;

        let id1 = store.enroll("BOB", &embedding(0.0)).await.unwrap();
        let id2 = store.enroll("BOB", &embedding(1.0)).await.unwrap();
        assert_eq!(id1, id2);

        let gallery = store.gallery().await.unwrap();
        assert_eq!(gallery.len(), 1);
        assert!((gallery.entries()[0].embedding.values[0] - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn mark_toggles_in_out_in() {
        let store = open_memory().await;
        store.enroll("ALICE", &embedding(0.0)).await.unwrap();

        let first = store.mark_at("ALICE", "2026-08-27", "09:00:00").await.unwrap();
        assert_eq!(first.direction, MarkDirection::In);

        let second = store.mark_at("ALICE", "2026-08-27", "17:30:00").await.unwrap();
        assert_eq!(second.direction, MarkDirection::Out);

        let third = store.mark_at("ALICE", "2026-08-27", "19:00:00").await.unwrap();
        assert_eq!(third.direction, MarkDirection::In);

        let report = store.report_for("2026-08-27").await.unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].time_in, "09:00:00");
        assert_eq!(report[0].time_out.as_deref(), Some("17:30:00"));
        assert_eq!(report[0].status, "OUT");
        assert_eq!(report[1].time_in, "19:00:00");
        assert_eq!(report[1].time_out, None);
        assert_eq!(report[1].status, "IN");
    }

    #[tokio::test]
    async fn mark_on_new_day_starts_fresh() {
        let store = open_memory().await;
        store.enroll("ALICE", &embedding(0.0)).await.unwrap();

        store.mark_at("ALICE", "2026-08-27", "09:00:00").await.unwrap();
        let next_day = store.mark_at("ALICE", "2026-08-28", "08:45:00").await.unwrap();
        assert_eq!(next_day.direction, MarkDirection::In);
    }

    #[tokio::test]
    async fn mark_unknown_employee_fails() {
        let store = open_memory().await;
        let err = store.mark_at("GHOST", "2026-08-27", "09:00:00").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownEmployee(name) if name == "GHOST"));
    }

    #[tokio::test]
    async fn remove_cascades_attendance() {
        let store = open_memory().await;
        store.enroll("ALICE", &embedding(0.0)).await.unwrap();
        store.mark_at("ALICE", "2026-08-27", "09:00:00").await.unwrap();

        assert!(store.remove("ALICE").await.unwrap());
        assert!(!store.remove("ALICE").await.unwrap());

        let report = store.report_for("2026-08-27").await.unwrap();
        assert!(report.is_empty());
        assert_eq!(store.count_employees().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_employees_sorted_by_name() {
        let store = open_memory().await;
        store.enroll("CAROL", &embedding(0.0)).await.unwrap();
        store.enroll("ALICE", &embedding(0.1)).await.unwrap();

        let employees = store.list_employees().await.unwrap();
        assert_eq!(employees.len(), 2);
        assert_eq!(employees[0].name, "ALICE");
        assert_eq!(employees[1].name, "CAROL");
    }

    #[tokio::test]
    async fn wrong_key_fails_decryption() {
        let store1 = AttendanceStore {
            conn: Connection::open(Path::new(":memory:")).await.unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = AttendanceStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };

        let blob = store1.encrypt_embedding(&embedding(0.0).values).unwrap();
        assert!(store2.decrypt_embedding(&blob).is_err());
    }

    #[tokio::test]
    async fn legacy_plaintext_blob_accepted() {
        let store = open_memory().await;
        let values = embedding(0.0).values;
        let plaintext = embedding_to_bytes(&values);
        let recovered = store.decrypt_embedding(&plaintext).unwrap();
        assert_eq!(recovered, values);
    }

    #[tokio::test]
    async fn strict_rejects_nan() {
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[42] = f32::NAN;
        let bytes = embedding_to_bytes(&values);
        let err = bytes_to_embedding_strict(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingValue));
    }

    #[tokio::test]
    async fn validate_rejects_wrong_dimension() {
        let values = vec![0.5f32; 128];
        let err = validate_embedding_values(&values).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingDim(128)));
    }
}
