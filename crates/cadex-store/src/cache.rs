//! DuckDB reference cache for portal lookup tables.

use std::path::{Path, PathBuf};

use cadex_core::Entry;
use duckdb::{Connection, params};
use sha2::{Digest, Sha512};
use tracing::{debug, info};

use crate::lock::{ExclusiveRegion, FileLock};
use crate::StoreError;

/// Id of the self-referential root record every derived root hangs under.
pub const ROOT_ID: &str = "subject";
/// Content of the root record.
pub const ROOT_RECORD: &str = "root_record";
/// Content of a record marking a derived root as fully populated.
pub const FORK_RECORD: &str = "fork_record";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS record (
        id VARCHAR PRIMARY KEY,
        content VARCHAR NOT NULL,
        root VARCHAR NOT NULL DEFAULT 'subject'
    );
    CREATE INDEX IF NOT EXISTS idx_record_root ON record (root);
";

const ID_LEN_BYTES: usize = 10;

/// Content-addressed id of an entry stored under `root`.
///
/// The first 20 hex digits of SHA-512 over root and content, so identical
/// pairs under different roots never collide.
pub fn content_id(root: &str, entry: &Entry) -> String {
    let mut hasher = Sha512::new();
    hasher.update(root.as_bytes());
    hasher.update([0x1f]);
    hasher.update(entry.to_content().as_bytes());
    hasher
        .finalize()
        .iter()
        .take(ID_LEN_BYTES)
        .map(|b| format!("{b:02X}"))
        .collect()
}

/// Local memo of `(code, label)` reference lists keyed by logical root.
///
/// One table of `(id, content, root)` triples. `content` is either a
/// serialised entry or one of the [`ROOT_RECORD`]/[`FORK_RECORD`] sentinels,
/// and every entry's `root` names an existing record id.
///
/// The DuckDB file is opened per operation, inside the exclusive region, so
/// several processes can share one cache file.
pub struct ReferenceCache<L: ExclusiveRegion = FileLock> {
    path: PathBuf,
    lock: L,
}

impl ReferenceCache<FileLock> {
    /// Open or create the cache at `path`, locking via a sibling `.lock` file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let lock = FileLock::new(path.with_extension("lock"));
        Self::with_lock(path, lock)
    }
}

impl<L: ExclusiveRegion> ReferenceCache<L> {
    /// Open or create the cache at `path` guarded by `lock`.
    ///
    /// Creates the table and index when absent and seeds the root record
    /// when the table is empty.
    pub fn with_lock(path: impl Into<PathBuf>, lock: L) -> Result<Self, StoreError> {
        let cache = Self {
            path: path.into(),
            lock,
        };
        cache.bootstrap()?;
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Ok(Connection::open(&self.path)?)
    }

    fn bootstrap(&self) -> Result<(), StoreError> {
        let _guard = self.lock.acquire()?;
        let conn = self.connect()?;
        conn.execute_batch(SCHEMA)?;

        let count: i64 = conn.query_row("SELECT count(*) FROM record", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO record (id, content, root) VALUES (?, ?, ?)",
                params![ROOT_ID, ROOT_RECORD, ROOT_ID],
            )?;
            info!(path = %self.path.display(), "initialised reference cache");
        }
        Ok(())
    }

    // ── Reads ──

    /// Entries stored under `root`, ordered by label.
    ///
    /// `Some(vec![])` when the root was forked but holds no entries;
    /// `None` when the root was never populated.
    pub fn get(&self, root: &str) -> Result<Option<Vec<Entry>>, StoreError> {
        let _guard = self.lock.acquire()?;
        let conn = self.connect()?;

        let mut entries = {
            let mut stmt = conn.prepare(
                "SELECT content FROM record WHERE root = ? AND content <> ? AND content <> ?",
            )?;
            let rows = stmt.query_map(params![root, ROOT_RECORD, FORK_RECORD], |row| {
                row.get::<_, String>(0)
            })?;
            let mut entries = Vec::new();
            for content in rows {
                if let Some(entry) = Entry::from_content(&content?) {
                    entries.push(entry);
                }
            }
            entries
        };

        if !entries.is_empty() {
            entries.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.code.cmp(&b.code)));
            debug!(root, count = entries.len(), "cache hit");
            return Ok(Some(entries));
        }

        let forked: i64 = conn.query_row(
            "SELECT count(*) FROM record WHERE id = ? AND content = ?",
            params![root, FORK_RECORD],
            |row| row.get(0),
        )?;
        if forked > 0 {
            debug!(root, "cache hit (empty fork)");
            Ok(Some(entries))
        } else {
            debug!(root, "cache miss");
            Ok(None)
        }
    }

    /// Total stored rows, sentinels included.
    pub fn row_count(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.acquire()?;
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT count(*) FROM record", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ── Writes ──

    /// Store `entries` under `root` in one transaction.
    ///
    /// Entries whose id already exists are skipped, so repeating a call is a
    /// no-op. Returns the number of rows inserted. `root` must already exist.
    pub fn set(&self, root: &str, entries: &[Entry]) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock.acquire()?;
        let mut conn = self.connect()?;
        if !record_exists(&conn, root)? {
            return Err(StoreError::UnknownRoot(root.to_string()));
        }

        let tx = conn.transaction()?;
        let inserted = insert_entries(&tx, root, entries)?;
        tx.commit()?;
        info!(root, inserted, "cached reference entries");
        Ok(inserted)
    }

    /// Mark `child` as a fully populated (possibly empty) root under `parent`.
    pub fn fork(&self, parent: &str, child: &str) -> Result<(), StoreError> {
        let _guard = self.lock.acquire()?;
        let conn = self.connect()?;
        if !record_exists(&conn, parent)? {
            return Err(StoreError::UnknownRoot(parent.to_string()));
        }
        insert_fork(&conn, parent, child)?;
        Ok(())
    }

    /// Fork `child` under `parent` and store `entries` under it atomically.
    ///
    /// The fork marker never exists without its entries.
    pub fn populate(
        &self,
        parent: &str,
        child: &str,
        entries: &[Entry],
    ) -> Result<usize, StoreError> {
        let _guard = self.lock.acquire()?;
        let mut conn = self.connect()?;
        if !record_exists(&conn, parent)? {
            return Err(StoreError::UnknownRoot(parent.to_string()));
        }

        let tx = conn.transaction()?;
        insert_fork(&tx, parent, child)?;
        let inserted = insert_entries(&tx, child, entries)?;
        tx.commit()?;
        info!(parent, child, inserted, "populated cache root");
        Ok(inserted)
    }
}

fn record_exists(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM record WHERE id = ?",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn insert_fork(conn: &Connection, parent: &str, child: &str) -> Result<(), StoreError> {
    if record_exists(conn, child)? {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO record (id, content, root) VALUES (?, ?, ?)",
        params![child, FORK_RECORD, parent],
    )?;
    Ok(())
}

fn insert_entries(conn: &Connection, root: &str, entries: &[Entry]) -> Result<usize, StoreError> {
    let mut inserted = 0;
    for entry in entries {
        let id = content_id(root, entry);
        if record_exists(conn, &id)? {
            continue;
        }
        conn.execute(
            "INSERT INTO record (id, content, root) VALUES (?, ?, ?)",
            params![id, entry.to_content(), root],
        )?;
        inserted += 1;
    }
    Ok(inserted)
}
