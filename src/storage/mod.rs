pub mod repository;

use std::path::{Path, PathBuf};

use rusqlite_migration::{Migrations, M};

use crate::error::{Error, Result};

/// Overrides the default database location when set.
pub const ENV_DB_PATH: &str = "DORADW_DB";

const CONNECTION_PRAGMAS: &str = "PRAGMA journal_mode=WAL;\
                                  PRAGMA foreign_keys=ON;\
                                  PRAGMA busy_timeout=5000;";

/// The warehouse store: one writer and one reader connection over the same
/// SQLite file in WAL mode. Writes queue up behind the writer's channel;
/// metric queries go through the reader and never wait on a sync.
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
}

impl Database {
    /// Open the database at [`default_path`].
    pub async fn open() -> Result<Self> {
        Self::open_at(default_path()?).await
    }

    /// Open (creating if needed) the database at `path`. Missing parent
    /// directories are created.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("cannot create {}: {e}", parent.display())))?;
        }
        log::debug!("Opening warehouse at {}", path.display());

        let writer = tokio_rusqlite::Connection::open(&path).await?;
        configure(&writer, true).await?;

        let reader = tokio_rusqlite::Connection::open(&path).await?;
        configure(&reader, false).await?;

        Ok(Self { writer, reader })
    }

    /// In-memory database for tests. Both handles share one connection.
    pub async fn open_memory() -> Result<Self> {
        let writer = tokio_rusqlite::Connection::open_in_memory().await?;
        configure(&writer, true).await?;
        Ok(Self {
            reader: writer.clone(),
            writer,
        })
    }

    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }
}

/// `$DORADW_DB`, or `~/.doradw/doradw.db`.
pub fn default_path() -> Result<PathBuf> {
    resolve_path(std::env::var_os(ENV_DB_PATH).map(PathBuf::from), dirs::home_dir())
}

fn resolve_path(override_path: Option<PathBuf>, home: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = override_path.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(path);
    }
    let home = home.ok_or_else(|| Error::Config("cannot determine home directory".into()))?;
    Ok(home.join(".doradw").join("doradw.db"))
}

/// Apply connection pragmas; the writer also brings the schema up to date.
async fn configure(conn: &tokio_rusqlite::Connection, migrate: bool) -> Result<()> {
    conn.call(move |conn| {
        conn.execute_batch(CONNECTION_PRAGMAS)
            .map_err(|e| e.to_string())?;
        if migrate {
            migrations().to_latest(conn).map_err(|e| e.to_string())?;
        }
        Ok::<(), String>(())
    })
    .await
    .map_err(|e| Error::Migration(e.to_string()))
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_initial.sql"))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_validate() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_resolve_path() {
        let home = Some(PathBuf::from("/home/dev"));
        assert_eq!(
            resolve_path(None, home.clone()).unwrap(),
            PathBuf::from("/home/dev/.doradw/doradw.db")
        );
        assert_eq!(
            resolve_path(Some(PathBuf::from("/data/w.db")), home.clone()).unwrap(),
            PathBuf::from("/data/w.db")
        );
        // An empty override is ignored.
        assert_eq!(
            resolve_path(Some(PathBuf::new()), home).unwrap(),
            PathBuf::from("/home/dev/.doradw/doradw.db")
        );
        assert!(matches!(resolve_path(None, None), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_open_memory_has_schema() {
        let db = Database::open_memory().await.unwrap();

        let tables: Vec<String> = db
            .reader()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok::<Vec<String>, rusqlite::Error>(rows.filter_map(|r| r.ok()).collect())
            })
            .await
            .unwrap();

        for table in [
            "repositories",
            "commits",
            "issues",
            "teams",
            "team_members",
            "team_repositories",
            "sync_history",
            "metric_cache",
            "app_config",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_open_at_creates_parent_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warehouse.db");
        {
            let db = Database::open_at(&path).await.unwrap();
            db.writer()
                .call(|conn| repository::set_config(conn, "adapter", "mock"))
                .await
                .unwrap();
        }
        assert!(path.exists());

        let db = Database::open_at(&path).await.unwrap();
        let value = db
            .reader()
            .call(|conn| repository::get_config(conn, "adapter"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("mock"));
    }

    #[tokio::test]
    async fn test_foreign_keys_cascade() {
        let db = Database::open_memory().await.unwrap();
        let remaining = db
            .writer()
            .call(|conn| {
                repository::add_repository(conn, "api", "API", "/src/api", None)?;
                repository::upsert_team(conn, "core", "Core")?;
                repository::add_team_repository(conn, "core", "api")?;
                repository::remove_repository(conn, "api")?;
                conn.query_row("SELECT COUNT(*) FROM team_repositories", [], |row| row.get::<_, i64>(0))
            })
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
