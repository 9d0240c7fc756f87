use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 2;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS revisions (
            repository TEXT NOT NULL,
            revision TEXT NOT NULL,
            recorded INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            PRIMARY KEY (repository, revision)
        );

        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            repository TEXT NOT NULL,
            revision TEXT NOT NULL,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            qualname TEXT NOT NULL,
            path TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            start_col INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            end_col INTEGER NOT NULL,
            has_span INTEGER NOT NULL,
            language TEXT,
            depth INTEGER NOT NULL,
            signature TEXT,
            text TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_scope_name ON nodes(repository, revision, name);
        CREATE INDEX IF NOT EXISTS idx_nodes_scope_qualname ON nodes(repository, revision, qualname);
        CREATE INDEX IF NOT EXISTS idx_nodes_scope_path ON nodes(repository, revision, path);

        CREATE TABLE IF NOT EXISTS edges (
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            PRIMARY KEY (source_id, target_id, kind),
            FOREIGN KEY(source_id) REFERENCES nodes(id),
            FOREIGN KEY(target_id) REFERENCES nodes(id)
        );

        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id, kind);
        COMMIT;
        ",
    )?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|v| v.parse::<i64>().unwrap_or(0)),
        )
        .optional()?;

    let existing = existing.unwrap_or(0);

    if existing < 2 && !has_column(conn, "nodes", "text")? {
        conn.execute("ALTER TABLE nodes ADD COLUMN text TEXT", [])?;
    }

    if existing < SCHEMA_VERSION {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SCHEMA_VERSION.to_string()],
        )?;
    }

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for row in rows {
        if row? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_a_version_one_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
            INSERT INTO meta (key, value) VALUES ('schema_version', '1');
            CREATE TABLE nodes (
                id TEXT PRIMARY KEY,
                repository TEXT NOT NULL,
                revision TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                qualname TEXT NOT NULL,
                path TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                start_col INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                end_col INTEGER NOT NULL,
                has_span INTEGER NOT NULL,
                language TEXT,
                depth INTEGER NOT NULL,
                signature TEXT
            );
            ",
        )
        .unwrap();
        assert!(!has_column(&conn, "nodes", "text").unwrap());

        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert!(has_column(&conn, "nodes", "text").unwrap());
        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }
}
