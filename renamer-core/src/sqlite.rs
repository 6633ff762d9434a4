use rusqlite::Connection;

/// Pragmas for a small, frequently read settings database shared between the
/// bot process and the CLI.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}
