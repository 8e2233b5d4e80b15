//! Shared SQLite plumbing for the persistent grant and reference stores.

use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};

/// Open (or create) a SQLite database with WAL enabled.
///
/// On Unix the file is restricted to 0600 (owner read/write only): grant
/// records reveal who paid for what.
pub fn open_sqlite(path: &str) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!(
                path = %path,
                error = %e,
                "failed to set database file permissions to 0600"
            );
        }
    }

    Ok(conn)
}

/// Lock a connection, recovering from poisoning.
pub fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(c) => c,
        Err(poisoned) => {
            tracing::error!("sqlite mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
