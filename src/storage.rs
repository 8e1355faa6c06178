use crate::error::AppError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where the serialized quota record lives. Implementations must replace the
/// stored document all at once.
pub trait StateBackend: Send {
    fn load(&self) -> Result<Option<String>, AppError>;

    fn store(&mut self, raw: &str) -> Result<(), AppError>;

    fn describe(&self) -> String;
}

/// Single JSON file, replaced through a temp file and rename.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "usage.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<String>, AppError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&mut self, raw: &str) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.temp_path();
        let mut file = File::create(&tmp)?;
        file.write_all(raw.as_bytes())?;
        file.sync_all()?;
        drop(file);

        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Single-row SQLite table holding the same JSON document.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let this = Self { conn };
        this.init()?;
        Ok(this)
    }

    fn init(&self) -> Result<(), AppError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS quota_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body TEXT NOT NULL,
                stored_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl StateBackend for SqliteBackend {
    fn load(&self) -> Result<Option<String>, AppError> {
        let body = self
            .conn
            .query_row("SELECT body FROM quota_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(body)
    }

    fn store(&mut self, raw: &str) -> Result<(), AppError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO quota_state (id, body, stored_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body, stored_at = excluded.stored_at",
            params![raw, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(|p| format!("sqlite:{p}"))
            .unwrap_or_else(|| "sqlite::memory:".into())
    }
}

/// Ephemeral backend for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    body: Option<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
        }
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<Option<String>, AppError> {
        Ok(self.body.clone())
    }

    fn store(&mut self, raw: &str) -> Result<(), AppError> {
        self.body = Some(raw.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn json_backend_reports_missing_file_as_empty() {
        let tmp = TempDir::new().expect("tempdir");
        let backend = JsonFileBackend::new(tmp.path().join("usage.json"));
        assert_eq!(backend.load().expect("load"), None);
    }

    #[test]
    fn json_backend_replaces_file_and_leaves_no_temp() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("nested").join("usage.json");
        let mut backend = JsonFileBackend::new(&path);

        backend.store("{\"a\":1}").expect("first store");
        backend.store("{\"a\":2}").expect("second store");

        assert_eq!(backend.load().expect("load").as_deref(), Some("{\"a\":2}"));
        assert!(!tmp.path().join("nested").join("usage.json.tmp").exists());
    }

    #[test]
    fn json_backend_surfaces_write_failures() {
        let tmp = TempDir::new().expect("tempdir");
        // A directory squatting on the target path makes the rename fail.
        let path = tmp.path().join("usage.json");
        fs::create_dir_all(path.join("occupied")).expect("create blocking dir");
        let mut backend = JsonFileBackend::new(&path);

        assert!(backend.store("{}").is_err());
        assert!(!tmp.path().join("usage.json.tmp").exists());
    }

    #[test]
    fn sqlite_backend_upserts_single_row() {
        let tmp = TempDir::new().expect("tempdir");
        let db = tmp.path().join("usage.sqlite");
        let mut backend = SqliteBackend::open(&db).expect("open sqlite");

        assert_eq!(backend.load().expect("empty load"), None);
        backend.store("{\"v\":1}").expect("insert");
        backend.store("{\"v\":2}").expect("update");

        let reopened = SqliteBackend::open(&db).expect("reopen sqlite");
        assert_eq!(reopened.load().expect("load").as_deref(), Some("{\"v\":2}"));

        let rows: i64 = reopened
            .conn
            .query_row("SELECT COUNT(*) FROM quota_state", [], |r| r.get(0))
            .expect("count rows");
        assert_eq!(rows, 1);
    }

    #[test]
    fn memory_backend_round_trips() {
        let mut backend = MemoryBackend::new();
        assert_eq!(backend.load().expect("load"), None);
        backend.store("x").expect("store");
        assert_eq!(backend.load().expect("load").as_deref(), Some("x"));
        assert_eq!(MemoryBackend::with_body("y").load().expect("load").as_deref(), Some("y"));
    }
}
