//! Durable transmission log backed by SQLite.
//!
//! The log is append-only: rows are inserted and scanned, never updated or
//! deleted. One connection is shared behind a mutex, so each operation runs
//! as its own serialized session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, params};

use crate::error::{Error, Result};
use crate::types::{Address16, Address64, RemoteEndpoint, RemoteMessage, TransmissionRecord};

/// Default connection URL: `xbee_log.db` in the working directory.
pub const DEFAULT_URL: &str = "sqlite:///xbee_log.db";

/// Default log table name.
pub const DEFAULT_TABLE: &str = "xbee_transmissions";

/// How long a writer waits for a lock held by another process.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEME: &str = "sqlite:";

/// Configuration for a [`TransmissionStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Connection URL, e.g. `sqlite:///xbee_log.db` or `sqlite::memory:`.
    pub url: String,
    /// Log table name.
    pub table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

impl StoreConfig {
    /// Creates a configuration for `url` with the default table.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: DEFAULT_TABLE.to_owned(),
        }
    }

    /// Creates an in-memory configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new("sqlite::memory:")
    }

    /// Sets the table name.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }
}

/// Where a store lives, resolved from its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Private in-memory database, gone on close.
    Memory,
    /// Database file.
    File(PathBuf),
}

impl StoreLocation {
    /// Resolves a connection URL.
    ///
    /// Accepts `sqlite://` and `sqlite::memory:` (in-memory),
    /// `sqlite:///relative.db`, `sqlite:////absolute.db` and bare paths.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] for other schemes, for URLs with
    /// a host and for empty paths.
    pub fn parse(url: &str) -> Result<Self> {
        let unavailable = |reason: &str| Error::StoreUnavailable {
            reason: format!("{reason}: {url:?}"),
        };

        let url = url.trim();
        if url.is_empty() {
            return Err(unavailable("empty log URL"));
        }

        let Some(rest) = url.strip_prefix(SCHEME) else {
            if url.contains("://") {
                return Err(unavailable("unsupported log URL scheme"));
            }
            return Ok(Self::File(PathBuf::from(url)));
        };

        if rest == ":memory:" || rest == "//" {
            return Ok(Self::Memory);
        }

        let Some(authority) = rest.strip_prefix("//") else {
            return Err(unavailable("malformed sqlite URL"));
        };
        let Some(path) = authority.strip_prefix('/') else {
            return Err(unavailable("sqlite URL must not name a host"));
        };

        match path {
            "" => Err(unavailable("sqlite URL has no database path")),
            ":memory:" => Ok(Self::Memory),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }

    /// Returns the file path, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Memory => None,
            Self::File(path) => Some(path),
        }
    }
}

/// Checks that `table` is a plain SQL identifier.
///
/// # Errors
///
/// Returns [`Error::InvalidTableName`] otherwise.
pub fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = table.len() <= 64
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidTableName(table.to_owned()))
    }
}

/// Append-only log of received and sent transmissions.
pub struct TransmissionStore {
    conn: Mutex<Option<Connection>>,
    table: String,
    location: StoreLocation,
}

impl TransmissionStore {
    /// Opens the store described by `config`, creating the table if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreUnavailable`] if the URL is unsupported or the
    ///   database cannot be opened
    /// - [`Error::InvalidTableName`] for a bad table name
    pub fn open(config: &StoreConfig) -> Result<Self> {
        validate_table_name(&config.table)?;
        let location = StoreLocation::parse(&config.url)?;

        let conn = match &location {
            StoreLocation::Memory => Connection::open_in_memory(),
            StoreLocation::File(path) => Connection::open(path),
        }
        .map_err(|e| Error::StoreUnavailable {
            reason: format!("cannot open {}: {e}", config.url),
        })?;

        if let StoreLocation::File(path) = &location {
            Self::tune(&conn).map_err(|e| Error::StoreUnavailable {
                reason: format!("cannot use {}: {e}", path.display()),
            })?;
        }

        let store = Self {
            conn: Mutex::new(Some(conn)),
            table: config.table.clone(),
            location,
        };
        store.init_schema()?;

        tracing::info!("transmission log at {} (table {})", config.url, store.table);
        Ok(store)
    }

    /// Opens the store at `url` with the default table.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open).
    pub fn open_url(url: &str) -> Result<Self> {
        Self::open(&StoreConfig::new(url))
    }

    /// Opens a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if SQLite cannot allocate it.
    pub fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory())
    }

    fn tune(conn: &Connection) -> rusqlite::Result<()> {
        // Readers never block the writer
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("journal mode {}", mode);
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)
    }

    fn init_schema(&self) -> Result<()> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or_else(closed)?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sender_64_hardware TEXT NOT NULL,
                    sender_16_network TEXT NOT NULL,
                    rssi INTEGER,
                    is_broadcast BOOLEAN NOT NULL,
                    data TEXT NOT NULL,
                    timestamp REAL NOT NULL
                )",
                self.table
            ),
            [],
        )
        .map_err(|e| Error::StoreUnavailable {
            reason: format!("cannot create table {}: {e}", self.table),
        })?;

        Ok(())
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns where the store lives.
    #[must_use]
    pub const fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Returns true once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Appends one record and returns its id.
    ///
    /// The insert runs in its own transaction; on failure nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreUnavailable`] if the store is closed
    /// - [`Error::StoreWriteFailed`] if the insert fails
    pub fn insert(
        &self,
        sender: &RemoteEndpoint,
        rssi: Option<i32>,
        is_broadcast: bool,
        payload: &str,
        timestamp: f64,
    ) -> Result<u64> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or_else(closed)?;

        let id = insert_row(conn, &self.table, sender, rssi, is_broadcast, payload, timestamp)
            .map_err(Error::StoreWriteFailed)?;
        let id = to_id(id).map_err(Error::StoreWriteFailed)?;
        tracing::trace!("logged record {} from {}", id, sender);
        Ok(id)
    }

    /// Appends a live message.
    ///
    /// # Errors
    ///
    /// [`Error::PayloadEncoding`] if the payload is not UTF-8, otherwise as
    /// [`insert`](Self::insert).
    pub fn log_message(&self, message: &RemoteMessage) -> Result<u64> {
        let payload = message.text()?;
        self.insert(
            &message.sender,
            message.rssi,
            message.is_broadcast,
            payload,
            message.timestamp,
        )
    }

    /// Returns every record in id order.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreUnavailable`] if the store is closed
    /// - [`Error::Database`] if the read fails
    pub fn scan_all(&self) -> Result<Vec<TransmissionRecord>> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or_else(closed)?;

        let tx = conn.transaction()?;
        let records = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id, sender_64_hardware, sender_16_network, rssi, is_broadcast, data, timestamp
                 FROM \"{}\" ORDER BY id",
                self.table
            ))?;
            let rows = stmt.query_map([], |row| {
                let id: i64 = row.get(0)?;
                let address64: String = row.get(1)?;
                let address16: String = row.get(2)?;
                Ok(TransmissionRecord {
                    id: to_id(id)?,
                    sender: RemoteEndpoint::new(
                        Address64::from_hex(&address64).map_err(|e| conversion(1, e))?,
                        Address16::from_hex(&address16).map_err(|e| conversion(2, e))?,
                    ),
                    rssi: row.get(3)?,
                    is_broadcast: row.get(4)?,
                    payload: row.get(5)?,
                    timestamp: row.get(6)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;

        Ok(records)
    }

    /// Closes the connection. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if SQLite refuses to close; the store is
    /// closed either way.
    pub fn close(&self) -> Result<()> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        tracing::info!("closing transmission log");
        conn.close().map_err(|(_, e)| Error::Database(e))
    }
}

fn insert_row(
    conn: &mut Connection,
    table: &str,
    sender: &RemoteEndpoint,
    rssi: Option<i32>,
    is_broadcast: bool,
    payload: &str,
    timestamp: f64,
) -> rusqlite::Result<i64> {
    let tx = conn.transaction()?;
    tx.execute(
        &format!(
            "INSERT INTO \"{table}\"
             (sender_64_hardware, sender_16_network, rssi, is_broadcast, data, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        params![
            sender.address64.to_hex(),
            sender.address16.to_hex(),
            rssi,
            is_broadcast,
            payload,
            timestamp
        ],
    )?;
    let rowid = tx.last_insert_rowid();
    // Dropping an uncommitted transaction rolls it back
    tx.commit()?;
    Ok(rowid)
}

fn closed() -> Error {
    Error::StoreUnavailable {
        reason: "store is closed".to_owned(),
    }
}

fn to_id(rowid: i64) -> rusqlite::Result<u64> {
    u64::try_from(rowid).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, rowid))
}

fn conversion(column: usize, error: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(error))
}

impl std::fmt::Debug for TransmissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionStore")
            .field("table", &self.table)
            .field("location", &self.location)
            .field("closed", &self.is_closed())
            .finish()
    }
}
