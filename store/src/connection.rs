//! Connection management for the structured store.
//!
//! The [`ConnectionManager`] owns the one live [`Connection`] for the
//! process. It is built once by the composition root and shared (behind an
//! `Arc`) with every [`RecordStore`](crate::RecordStore) that needs it.
//!
//! Opening runs the schema upgrade when the stored version is behind the
//! requested one. The upgrade holds an exclusive lock on the database for
//! its whole duration and only creates collections and indices that are
//! missing, so it is safe on a database of any earlier version.
//!
//! An on-disk store also marks every open connection with a read lock on a
//! small presence file per schema version (`<name>.open-v<N>.sqlite3`).
//! An upgrade that finds a lower version still held open fails with
//! [`ConnectionError::UpgradeBlocked`] instead of changing the schema
//! underneath it. The operating system drops the lock if a process dies.

use crate::{
    error::ConnectionError,
    structured::{create_index_sql, create_table_sql, index_name, table_name},
    Registry, SchemaVersion, StoreConfig,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Connection as _, SqliteConnection};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Where and how to open the structured store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Directory holding the database file. `None` keeps it in memory.
    pub directory: Option<PathBuf>,
    pub busy_timeout: Duration,
}

impl ConnectOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            directory: config.database_dir.clone(),
            busy_timeout: config.busy_timeout,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            directory: None,
            busy_timeout: Duration::from_millis(5000),
        }
    }

    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Self::in_memory()
        }
    }

    /// Whether the environment can host the structured store.
    ///
    /// The database directory must exist or be creatable.
    pub fn probe(&self) -> bool {
        match &self.directory {
            None => true,
            Some(dir) => dir.is_dir() || std::fs::create_dir_all(dir).is_ok(),
        }
    }

    fn sqlite_options(&self, name: &str) -> SqliteConnectOptions {
        let options = match &self.directory {
            Some(dir) => SqliteConnectOptions::new()
                .filename(dir.join(format!("{name}.sqlite3")))
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal),
            None => SqliteConnectOptions::new().in_memory(true),
        };
        options.busy_timeout(self.busy_timeout)
    }

    fn presence_path(dir: &Path, name: &str, version: SchemaVersion) -> PathBuf {
        dir.join(format!("{name}.open-v{version}.sqlite3"))
    }

    /// Mark `name` as open at `version`. In-memory stores are private to
    /// their connection and need no mark.
    async fn presence(
        &self,
        name: &str,
        version: SchemaVersion,
    ) -> Result<Option<Arc<Presence>>, ConnectionError> {
        match &self.directory {
            Some(dir) => {
                let path = Self::presence_path(dir, name, version);
                Ok(Some(Arc::new(Presence::hold(path, self.busy_timeout).await?)))
            }
            None => Ok(None),
        }
    }

    /// The lowest version below `version` that some connection still holds
    /// open.
    async fn open_below(
        &self,
        name: &str,
        version: SchemaVersion,
    ) -> Result<Option<SchemaVersion>, ConnectionError> {
        let Some(dir) = &self.directory else {
            return Ok(None);
        };
        for older in 1..version {
            let path = Self::presence_path(dir, name, older);
            if path.exists() && Presence::is_held(path).await? {
                return Ok(Some(older));
            }
        }
        Ok(None)
    }
}

/// A read lock marking a connection as open at one schema version.
///
/// The presence file stays in rollback-journal mode, where a held read
/// transaction makes any other `BEGIN EXCLUSIVE` fail.
#[derive(Debug)]
struct Presence {
    conn: Mutex<Option<SqliteConnection>>,
}

impl Presence {
    async fn hold(path: PathBuf, busy_timeout: Duration) -> Result<Self, ConnectionError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(busy_timeout);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(ConnectionError::Open)?;

        for sql in [
            "CREATE TABLE IF NOT EXISTS presence (id INTEGER)",
            "BEGIN",
            "SELECT count(*) FROM presence",
        ] {
            sqlx::query(sql)
                .execute(&mut conn)
                .await
                .map_err(ConnectionError::Open)?;
        }
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Whether any connection holds the presence file at `path`.
    async fn is_held(path: PathBuf) -> Result<bool, ConnectionError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .busy_timeout(Duration::ZERO);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(ConnectionError::Open)?;

        let held = match sqlx::query("BEGIN EXCLUSIVE").execute(&mut conn).await {
            Ok(_) => {
                sqlx::query("ROLLBACK")
                    .execute(&mut conn)
                    .await
                    .map_err(ConnectionError::Open)?;
                false
            }
            Err(err) if is_busy(&err) => true,
            Err(err) => return Err(ConnectionError::Open(err)),
        };

        if let Err(err) = conn.close().await {
            tracing::warn!(error = %err, "closing presence check failed");
        }
        Ok(held)
    }

    async fn release(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            if let Err(err) = conn.close().await {
                tracing::warn!(error = %err, "releasing presence lock failed");
            }
        }
    }
}

/// A live handle to the structured store at a fixed schema version.
#[derive(Debug, Clone)]
pub struct Connection {
    name: String,
    registry: Registry,
    pool: SqlitePool,
    presence: Option<Arc<Presence>>,
}

impl Connection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema version the connection was opened at.
    pub fn version(&self) -> SchemaVersion {
        self.registry.version()
    }

    /// Declarations in force for this connection.
    pub fn registry(&self) -> Registry {
        self.registry
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Opens, caches and closes the structured store connection.
#[derive(Debug)]
pub struct ConnectionManager {
    options: ConnectOptions,
    registry: Registry,
    current: RwLock<Option<Connection>>,
}

impl ConnectionManager {
    /// Create a manager. Nothing is opened until [`open`](Self::open).
    pub fn new(options: ConnectOptions, registry: Registry) -> Self {
        Self {
            options,
            registry,
            current: RwLock::new(None),
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// The full registry this manager can upgrade to.
    pub fn registry(&self) -> Registry {
        self.registry
    }

    /// Open the store `name` at `version`, upgrading it if needed.
    ///
    /// Once a connection is open every later call returns it unchanged.
    /// Concurrent callers wait for the first open to finish.
    pub async fn open(
        &self,
        name: &str,
        version: SchemaVersion,
    ) -> Result<Connection, ConnectionError> {
        let mut current = self.current.write().await;
        if let Some(conn) = current.as_ref() {
            tracing::debug!(name = %conn.name, version = conn.version(), "reusing open connection");
            return Ok(conn.clone());
        }

        let registry =
            self.registry
                .at_version(version)
                .ok_or(ConnectionError::UnknownVersion {
                    requested: version,
                    latest: self.registry.version(),
                })?;

        if !self.options.probe() {
            return Err(ConnectionError::Unavailable(format!(
                "database directory {:?} is not usable",
                self.options.directory
            )));
        }

        // Held before the version is read, so an upgrade elsewhere either
        // sees this connection or finishes before it reads.
        let presence = self.options.presence(name, version).await?;
        let pool = match self.connect(name, registry).await {
            Ok(pool) => pool,
            Err(err) => {
                if let Some(presence) = presence {
                    presence.release().await;
                }
                return Err(err);
            }
        };

        tracing::info!(name, version, "structured store open");
        let conn = Connection {
            name: name.to_string(),
            registry,
            pool,
            presence,
        };
        *current = Some(conn.clone());
        Ok(conn)
    }

    async fn connect(&self, name: &str, registry: Registry) -> Result<SqlitePool, ConnectionError> {
        // One connection: SQLite admits a single writer, and an in-memory
        // database only lives as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(self.options.sqlite_options(name))
            .await
            .map_err(ConnectionError::Open)?;

        if let Err(err) = upgrade(&pool, registry, &self.options, name).await {
            pool.close().await;
            return Err(err);
        }
        Ok(pool)
    }

    /// The open connection, if any.
    pub async fn connection(&self) -> Option<Connection> {
        self.current.read().await.clone()
    }

    /// Whether a connection has been opened.
    pub async fn is_ready(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Close the connection so the next [`open`](Self::open) starts afresh.
    ///
    /// Must not be called while other operations are in flight.
    pub async fn close(&self) {
        if let Some(conn) = self.current.write().await.take() {
            conn.pool.close().await;
            if let Some(presence) = &conn.presence {
                presence.release().await;
            }
            tracing::info!(name = %conn.name, "structured store closed");
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    let primary = err
        .as_database_error()
        .and_then(|db| db.code())
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff);
    matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
}

fn classify(version: SchemaVersion, err: sqlx::Error) -> ConnectionError {
    if is_busy(&err) {
        ConnectionError::UpgradeBlocked {
            version,
            reason: err.to_string(),
        }
    } else {
        ConnectionError::Open(err)
    }
}

async fn stored_version(conn: &mut SqliteConnection) -> Result<SchemaVersion, ConnectionError> {
    let stored: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&mut *conn)
        .await
        .map_err(ConnectionError::Open)?;
    SchemaVersion::try_from(stored)
        .map_err(|_| ConnectionError::Unavailable(format!("corrupt schema version {stored}")))
}

/// Bring the database up to `registry`'s version.
///
/// The version is read under the exclusive lock, so an upgrade running in
/// another process finishes before this one looks.
async fn upgrade(
    pool: &SqlitePool,
    registry: Registry,
    options: &ConnectOptions,
    name: &str,
) -> Result<(), ConnectionError> {
    let target = registry.version();
    let mut conn = pool.acquire().await.map_err(ConnectionError::Open)?;

    sqlx::query("BEGIN EXCLUSIVE")
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(target, e))?;

    let result = match stored_version(&mut conn).await {
        Ok(stored) if stored > target => Err(ConnectionError::VersionTooNew {
            stored,
            requested: target,
        }),
        Ok(stored) if stored == target => Ok(()),
        Ok(stored) => match options.open_below(name, target).await {
            Ok(Some(older)) => Err(ConnectionError::UpgradeBlocked {
                version: target,
                reason: format!("a connection at version {older} is still open"),
            }),
            Ok(None) => {
                tracing::info!(from = stored, to = target, "upgrading schema");
                create_missing(&mut conn, registry).await
            }
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => {
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(|e| classify(target, e))?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::error!(error = %rollback, "rollback of failed upgrade failed");
            }
            Err(err)
        }
    }
}

async fn create_missing(
    conn: &mut SqliteConnection,
    registry: Registry,
) -> Result<(), ConnectionError> {
    let target = registry.version();
    let existing: HashSet<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type IN ('table', 'index')")
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| classify(target, e))?
            .into_iter()
            .collect();

    for def in registry.collections() {
        if !existing.contains(table_name(def.name)) {
            sqlx::query(&create_table_sql(def))
                .execute(&mut *conn)
                .await
                .map_err(|e| classify(target, e))?;
            tracing::info!(collection = %def.name, "created collection");
        }

        for index in def.indices_at(target) {
            if !existing.contains(&index_name(def.name, index)) {
                sqlx::query(&create_index_sql(def, index))
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| classify(target, e))?;
                tracing::info!(collection = %def.name, index = index.name, "created index");
            }
        }
    }

    // PRAGMA does not take bound parameters.
    sqlx::query(&format!("PRAGMA user_version = {target}"))
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(target, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SCHEMA_VERSION;

    async fn table_names(conn: &Connection) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name != 'sqlite_sequence' ORDER BY name",
        )
        .fetch_all(conn.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn open_creates_every_collection() {
        let manager = ConnectionManager::new(ConnectOptions::in_memory(), Registry::current());
        assert!(!manager.is_ready().await);

        let conn = manager.open("farmlog", SCHEMA_VERSION).await.unwrap();
        assert!(manager.is_ready().await);
        assert_eq!(conn.version(), SCHEMA_VERSION);
        assert_eq!(
            table_names(&conn).await,
            vec![
                "activities",
                "expenses",
                "inventory",
                "labour",
                "sales",
                "tax-records",
                "weather"
            ]
        );
    }

    #[tokio::test]
    async fn open_is_cached() {
        let manager = ConnectionManager::new(ConnectOptions::in_memory(), Registry::current());
        let first = manager.open("farmlog", SCHEMA_VERSION).await.unwrap();
        sqlx::query("CREATE TABLE marker (x)")
            .execute(first.pool())
            .await
            .unwrap();

        // Same underlying database, not a fresh in-memory one.
        let second = manager.open("farmlog", SCHEMA_VERSION).await.unwrap();
        assert!(table_names(&second).await.contains(&"marker".to_string()));
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let manager = ConnectionManager::new(ConnectOptions::in_memory(), Registry::current());
        let err = manager
            .open("farmlog", SCHEMA_VERSION + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::UnknownVersion { .. }));
        assert!(!manager.is_ready().await);
    }

    #[tokio::test]
    async fn upgrade_adds_only_missing_declarations() {
        let dir = tempfile::tempdir().unwrap();
        let options = ConnectOptions::in_directory(dir.path());

        let v1 = ConnectionManager::new(options.clone(), Registry::current());
        let conn = v1.open("farmlog", 1).await.unwrap();
        assert_eq!(
            table_names(&conn).await,
            vec!["activities", "expenses", "inventory", "sales"]
        );
        v1.close().await;
        assert!(!v1.is_ready().await);

        let v2 = ConnectionManager::new(options, Registry::current());
        let conn = v2.open("farmlog", 2).await.unwrap();
        assert_eq!(table_names(&conn).await.len(), 7);

        let indices: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'inventory' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(conn.pool())
        .await
        .unwrap();
        assert_eq!(indices, vec!["inventory__category", "inventory__name"]);
    }

    #[tokio::test]
    async fn newer_stored_version_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = ConnectOptions::in_directory(dir.path());

        let latest = ConnectionManager::new(options.clone(), Registry::current());
        latest.open("farmlog", 2).await.unwrap();
        latest.close().await;

        let older = ConnectionManager::new(options, Registry::current());
        let err = older.open("farmlog", 1).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::VersionTooNew {
                stored: 2,
                requested: 1
            }
        ));
    }

    #[tokio::test]
    async fn older_open_connection_blocks_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let options = ConnectOptions::in_directory(dir.path());

        let old = ConnectionManager::new(options.clone(), Registry::current());
        old.open("farmlog", 1).await.unwrap();

        let new = ConnectionManager::new(options, Registry::current());
        let err = new.open("farmlog", 2).await.unwrap_err();
        assert!(
            matches!(err, ConnectionError::UpgradeBlocked { version: 2, .. }),
            "{err}"
        );
        assert!(!new.is_ready().await);

        // Nothing was changed underneath the old connection.
        let conn = old.connection().await.unwrap();
        assert_eq!(table_names(&conn).await.len(), 4);

        old.close().await;
        let conn = new.open("farmlog", 2).await.unwrap();
        assert_eq!(table_names(&conn).await.len(), 7);
    }

    #[tokio::test]
    async fn connections_at_same_version_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let options = ConnectOptions::in_directory(dir.path());

        let first = ConnectionManager::new(options.clone(), Registry::current());
        first.open("farmlog", 2).await.unwrap();
        let second = ConnectionManager::new(options.clone(), Registry::current());
        second.open("farmlog", 2).await.unwrap();

        // A refused open gives its mark back.
        let older = ConnectionManager::new(options, Registry::current());
        let err = older.open("farmlog", 1).await.unwrap_err();
        assert!(matches!(err, ConnectionError::VersionTooNew { .. }));
        let mark = ConnectOptions::presence_path(dir.path(), "farmlog", 1);
        assert!(!Presence::is_held(mark).await.unwrap());

        first.close().await;
        let mark = ConnectOptions::presence_path(dir.path(), "farmlog", 2);
        assert!(Presence::is_held(mark).await.unwrap());
    }

    #[tokio::test]
    async fn unusable_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let options = ConnectOptions::in_directory(&file);
        assert!(!options.probe());

        let manager = ConnectionManager::new(options, Registry::current());
        let err = manager.open("farmlog", SCHEMA_VERSION).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Unavailable(_)));
    }
}
