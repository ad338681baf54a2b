//! Shared state ledger.
//!
//! Every dispatcher instance is a separate process, so all coordination
//! between concurrent jobs goes through this SQLite file:
//! - **hosts**: the configured worker pool, managed by the admin commands
//! - **processes**: one row per in-flight job, used for load accounting
//! - **states**: append-only host health events; a host's current state is
//!   its latest event
//!
//! Mutations run inside `IMMEDIATE` transactions so writers serialize on the
//! database lock, and `busy_timeout` makes a contending process wait for the
//! lock instead of failing. Foreign keys are enforced, so a process or state
//! row can never reference a removed host.

pub mod model;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::{RelayError, Result};

pub use model::{
    is_local_address, Cleared, Host, HostId, HostState, LedgerSnapshot, ProcessRecord, StateEvent,
    Target,
};

const SCHEMA: &str = "
    DROP TABLE IF EXISTS states;
    DROP TABLE IF EXISTS processes;
    DROP TABLE IF EXISTS hosts;

    CREATE TABLE hosts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        address TEXT NOT NULL UNIQUE,
        weight INTEGER NOT NULL DEFAULT 1 CHECK (weight >= 1),
        added_at INTEGER NOT NULL
    );

    CREATE TABLE processes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id INTEGER REFERENCES hosts(id) ON DELETE CASCADE,
        process_id INTEGER NOT NULL UNIQUE,
        command TEXT NOT NULL,
        started_at INTEGER NOT NULL
    );

    CREATE TABLE states (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
        process_id INTEGER NOT NULL,
        state TEXT NOT NULL CHECK (state IN ('idle', 'active', 'bad')),
        recorded_at INTEGER NOT NULL
    );

    CREATE INDEX idx_states_host ON states(host_id, id);
    CREATE INDEX idx_states_process ON states(process_id);
";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Host given by id or by address, as typed by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRef {
    Id(HostId),
    Address(String),
}

impl FromStr for HostRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<i64>() {
            Ok(id) => HostRef::Id(HostId(id)),
            Err(_) => HostRef::Address(s.to_string()),
        })
    }
}

impl std::fmt::Display for HostRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostRef::Id(id) => write!(f, "{}", id),
            HostRef::Address(addr) => f.write_str(addr),
        }
    }
}

/// Handle to the ledger file.
#[derive(Debug)]
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open an existing, initialized ledger.
    ///
    /// Never creates the file: a missing or uninitialized ledger is
    /// [`RelayError::LedgerUnavailable`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(RelayError::LedgerUnavailable(path));
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;

        let has_schema: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'hosts')",
            [],
            |row| row.get(0),
        )?;
        if !has_schema {
            return Err(RelayError::LedgerUnavailable(path));
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Destructively (re)create the ledger schema, creating the file and its
    /// parent directory if needed.
    pub fn initialize(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        // WAL lets readers snapshot while another dispatcher holds the write lock.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "Ledger journal mode set");
        conn.pragma_update(None, "foreign_keys", false)?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        tracing::info!(path = %path.display(), "Ledger initialized");
        Self::open(path)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-call; the
        // SQLite transaction it held was rolled back on drop.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    /// All hosts in insertion order.
    pub fn list_hosts(&self) -> Result<Vec<Host>> {
        self.read(query_hosts)
    }

    pub fn add_host(&self, address: &str, weight: i64) -> Result<HostId> {
        if weight < 1 {
            return Err(RelayError::InvalidWeight(weight));
        }
        let id = self.write(|tx| {
            tx.execute(
                "INSERT INTO hosts (address, weight, added_at) VALUES (?1, ?2, ?3)",
                params![address, weight, Utc::now().timestamp()],
            )?;
            Ok(HostId(tx.last_insert_rowid()))
        })?;
        tracing::info!(host_id = %id, address, weight, "Host added");
        Ok(id)
    }

    /// Remove a host along with its process and state rows.
    pub fn remove_host(&self, host: &HostRef) -> Result<Host> {
        let removed = self.write(|tx| {
            let found =
                find_host(tx, host)?.ok_or_else(|| RelayError::HostNotFound(host.to_string()))?;
            tx.execute("DELETE FROM hosts WHERE id = ?1", params![found.id.0])?;
            Ok(found)
        })?;
        tracing::info!(host_id = %removed.id, address = %removed.address, "Host removed");
        Ok(removed)
    }

    pub fn find_host(&self, host: &HostRef) -> Result<Option<Host>> {
        self.read(|tx| find_host(tx, host))
    }

    // =========================================================================
    // States
    // =========================================================================

    /// Current state of a host: its latest event, or `Idle`.
    pub fn latest_state(&self, host_id: HostId) -> Result<HostState> {
        self.read(|tx| latest_state(tx, host_id))
    }

    pub fn record_state(&self, host_id: HostId, pid: u32, state: HostState) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO states (host_id, process_id, state, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![host_id.0, pid, state.as_str(), Utc::now().timestamp()],
            )?;
            Ok(())
        })?;
        tracing::debug!(host_id = %host_id, pid, state = %state, "State recorded");
        Ok(())
    }

    pub fn state_history(&self, host_id: HostId) -> Result<Vec<StateEvent>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, host_id, process_id, state, recorded_at FROM states
                 WHERE host_id = ?1 ORDER BY id",
            )?;
            let events = stmt
                .query_map(params![host_id.0], |row| {
                    let state: String = row.get(3)?;
                    Ok(StateEvent {
                        seq: row.get(0)?,
                        host_id: HostId(row.get(1)?),
                        process_id: row.get(2)?,
                        state: parse_state(3, &state)?,
                        recorded_at: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }

    /// Drop process rows and state history for one host, or for every host
    /// and the local fallback. This is the only way a `bad` host becomes
    /// eligible again, and the only way to remove rows left behind by a
    /// dispatcher that was killed before it could clean up.
    pub fn clear(&self, host: Option<&HostRef>) -> Result<Cleared> {
        self.write(|tx| {
            let cleared = match host {
                Some(host) => {
                    let found = find_host(tx, host)?
                        .ok_or_else(|| RelayError::HostNotFound(host.to_string()))?;
                    Cleared {
                        processes: tx.execute(
                            "DELETE FROM processes WHERE host_id = ?1",
                            params![found.id.0],
                        )?,
                        states: tx
                            .execute("DELETE FROM states WHERE host_id = ?1", params![found.id.0])?,
                    }
                }
                None => Cleared {
                    processes: tx.execute("DELETE FROM processes", [])?,
                    states: tx.execute("DELETE FROM states", [])?,
                },
            };
            Ok(cleared)
        })
    }

    // =========================================================================
    // Processes
    // =========================================================================

    /// Record an in-flight job. A stale row left by an earlier process with
    /// the same (recycled) pid is replaced.
    pub fn register_process(&self, target: Target, pid: u32, command: &str) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO processes (host_id, process_id, command, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    target.host_id().map(|id| id.0),
                    pid,
                    command,
                    Utc::now().timestamp()
                ],
            )?;
            Ok(())
        })?;
        tracing::debug!(host = %target, pid, "Process registered");
        Ok(())
    }

    pub fn list_processes(&self) -> Result<Vec<ProcessRecord>> {
        self.read(query_processes)
    }

    /// Remove this pid's process row and the state events it reported,
    /// except `bad` markings, which outlive the reporter. Idempotent: returns
    /// whether anything was removed.
    pub fn clear_process(&self, pid: u32) -> Result<bool> {
        self.write(|tx| {
            let processes =
                tx.execute("DELETE FROM processes WHERE process_id = ?1", params![pid])?;
            let states = tx.execute(
                "DELETE FROM states WHERE process_id = ?1 AND state != 'bad'",
                params![pid],
            )?;
            Ok(processes + states > 0)
        })
    }

    /// Hosts, running processes and current host states from one transaction.
    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        self.read(|tx| {
            let hosts = query_hosts(tx)?;
            let processes = query_processes(tx)?;
            let states = hosts
                .iter()
                .map(|h| latest_state(tx, h.id))
                .collect::<Result<Vec<_>>>()?;
            Ok(LedgerSnapshot {
                hosts,
                processes,
                states,
            })
        })
    }
}

fn parse_state(idx: usize, raw: &str) -> rusqlite::Result<HostState> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_host(row: &rusqlite::Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: HostId(row.get(0)?),
        address: row.get(1)?,
        weight: row.get(2)?,
    })
}

fn query_hosts(tx: &Transaction<'_>) -> Result<Vec<Host>> {
    let mut stmt = tx.prepare("SELECT id, address, weight FROM hosts ORDER BY id")?;
    let hosts = stmt
        .query_map([], row_to_host)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hosts)
}

fn query_processes(tx: &Transaction<'_>) -> Result<Vec<ProcessRecord>> {
    let mut stmt =
        tx.prepare("SELECT host_id, process_id, command FROM processes ORDER BY id")?;
    let processes = stmt
        .query_map([], |row| {
            let host_id: Option<i64> = row.get(0)?;
            Ok(ProcessRecord {
                target: host_id.map_or(Target::Local, |id| Target::Host(HostId(id))),
                process_id: row.get(1)?,
                command: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(processes)
}

fn find_host(tx: &Transaction<'_>, host: &HostRef) -> Result<Option<Host>> {
    let found = match host {
        HostRef::Id(id) => tx
            .query_row(
                "SELECT id, address, weight FROM hosts WHERE id = ?1",
                params![id.0],
                row_to_host,
            )
            .optional()?,
        HostRef::Address(addr) => tx
            .query_row(
                "SELECT id, address, weight FROM hosts WHERE address = ?1",
                params![addr],
                row_to_host,
            )
            .optional()?,
    };
    Ok(found)
}

fn latest_state(tx: &Transaction<'_>, host_id: HostId) -> Result<HostState> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT state FROM states WHERE host_id = ?1 ORDER BY id DESC LIMIT 1",
            params![host_id.0],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(parse_state(0, &raw)?),
        None => Ok(HostState::Idle),
    }
}
