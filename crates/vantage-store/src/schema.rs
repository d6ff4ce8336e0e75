use std::collections::HashSet;

use rusqlite::Connection;
use tracing::{debug, info, instrument};

use crate::error::StoreError;

/// One column the schema must eventually have. `ADD COLUMN` steps are
/// derived by diffing this declarative list against the introspected
/// `PRAGMA table_info` state, per the REDESIGN FLAGS note "Repeated
/// 'ensure column exists' migrations" → "a declarative schema whose
/// migration step is derived by diffing target against introspected
/// state."
struct ColumnSpec {
    name: &'static str,
    decl: &'static str,
}

const LINKS_BASELINE: &str = "
    CREATE TABLE IF NOT EXISTS links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL UNIQUE
    )
";

const LINKS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { name: "repaired_uri", decl: "TEXT" },
    ColumnSpec { name: "config_json", decl: "TEXT NOT NULL DEFAULT ''" },
    ColumnSpec { name: "fingerprint", decl: "TEXT" },
    ColumnSpec { name: "group_id", decl: "TEXT" },
    ColumnSpec { name: "is_primary", decl: "INTEGER NOT NULL DEFAULT 0" },
    ColumnSpec { name: "is_invalid", decl: "INTEGER NOT NULL DEFAULT 0" },
    ColumnSpec { name: "is_unsupported", decl: "INTEGER NOT NULL DEFAULT 0" },
    ColumnSpec { name: "outbound_tag", decl: "TEXT" },
    ColumnSpec { name: "inbound_tag", decl: "TEXT" },
    ColumnSpec { name: "test_status", decl: "TEXT NOT NULL DEFAULT 'idle'" },
    ColumnSpec { name: "test_started_at", decl: "INTEGER" },
    ColumnSpec { name: "test_lock_until", decl: "INTEGER" },
    ColumnSpec { name: "test_lock_owner", decl: "TEXT" },
    ColumnSpec { name: "test_batch_id", decl: "TEXT" },
    ColumnSpec { name: "last_tested_at", decl: "INTEGER" },
    ColumnSpec { name: "last_test_ok", decl: "INTEGER" },
    ColumnSpec { name: "last_test_error", decl: "TEXT" },
    ColumnSpec { name: "is_alive", decl: "INTEGER NOT NULL DEFAULT 0" },
    ColumnSpec { name: "ip", decl: "TEXT" },
    ColumnSpec { name: "country", decl: "TEXT" },
    ColumnSpec { name: "city", decl: "TEXT" },
    ColumnSpec { name: "datacenter", decl: "TEXT" },
    ColumnSpec { name: "is_in_use", decl: "INTEGER NOT NULL DEFAULT 0" },
    ColumnSpec { name: "bound_port", decl: "INTEGER" },
];

const SLOTS_BASELINE: &str = "
    CREATE TABLE IF NOT EXISTS inbound_slots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        port INTEGER NOT NULL UNIQUE,
        tag TEXT NOT NULL UNIQUE
    )
";

const SLOTS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { name: "role", decl: "TEXT NOT NULL DEFAULT 'test'" },
    ColumnSpec { name: "link_id", decl: "INTEGER REFERENCES links(id)" },
    ColumnSpec { name: "outbound_tag", decl: "TEXT" },
    ColumnSpec { name: "status", decl: "TEXT NOT NULL DEFAULT 'new'" },
];

/// Indexes required by §4.1. Written as `CREATE ... IF NOT EXISTS` so the
/// whole migration is safe to re-run on every startup.
const INDEX_STATEMENTS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_links_fingerprint ON links(fingerprint)",
    "CREATE INDEX IF NOT EXISTS idx_links_test_status ON links(test_status)",
    "CREATE INDEX IF NOT EXISTS idx_links_test_lock_until ON links(test_lock_until)",
    "CREATE INDEX IF NOT EXISTS idx_links_test_batch_id ON links(test_batch_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_links_outbound_tag ON links(outbound_tag) WHERE outbound_tag IS NOT NULL AND outbound_tag != ''",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_links_inbound_tag ON links(inbound_tag) WHERE inbound_tag IS NOT NULL AND inbound_tag != ''",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_slots_port ON inbound_slots(port)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_slots_tag ON inbound_slots(tag)",
];

/// Legacy constraints from older installs that must be dropped explicitly
/// (§4.1: "Dropping a uniqueness constraint that exists only in older
/// installs (e.g., a legacy uniqueness on `slot.role`) is explicit.").
const LEGACY_INDEXES_TO_DROP: &[&str] = &["idx_slots_role_unique", "slots_role_key"];

/// Run the full idempotent migration: create tables, add missing columns,
/// drop legacy constraints, create indexes. Safe to call on every startup
/// (§4.1).
#[instrument(skip(conn))]
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(LINKS_BASELINE)?;
    conn.execute_batch(SLOTS_BASELINE)?;

    add_missing_columns(conn, "links", LINKS_COLUMNS)?;
    add_missing_columns(conn, "inbound_slots", SLOTS_COLUMNS)?;

    for legacy in LEGACY_INDEXES_TO_DROP {
        let sql = format!("DROP INDEX IF EXISTS {legacy}");
        conn.execute_batch(&sql)?;
    }

    for stmt in INDEX_STATEMENTS {
        conn.execute_batch(stmt)?;
    }

    info!("schema migration complete");
    Ok(())
}

fn existing_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

fn add_missing_columns(
    conn: &Connection,
    table: &str,
    columns: &[ColumnSpec],
) -> Result<(), StoreError> {
    let existing = existing_columns(conn, table)?;
    for col in columns {
        if existing.contains(col.name) {
            continue;
        }
        let sql = format!("ALTER TABLE {table} ADD COLUMN {} {}", col.name, col.decl);
        debug!(table, column = col.name, "adding missing column");
        conn.execute_batch(&sql)?;
    }
    Ok(())
}

/// Read-only introspection report used by migration tests and ops
/// diagnostics (§10, grounded on `dump_schema.py`).
#[derive(Debug, Clone)]
pub struct SchemaReport {
    pub tables: Vec<TableReport>,
}

#[derive(Debug, Clone)]
pub struct TableReport {
    pub name: String,
    pub columns: Vec<String>,
    pub indexes: Vec<String>,
}

pub fn describe_schema(conn: &Connection) -> Result<SchemaReport, StoreError> {
    let mut tables = Vec::new();
    for table in ["links", "inbound_slots"] {
        let columns = existing_columns(conn, table)?;
        let mut columns: Vec<String> = columns.into_iter().collect();
        columns.sort();

        let mut idx_stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='index' AND tbl_name = ?1")?;
        let indexes = idx_stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        tables.push(TableReport {
            name: table.to_string(),
            columns,
            indexes,
        });
    }
    Ok(SchemaReport { tables })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn migration_creates_both_tables_with_all_columns() {
        let conn = open();
        migrate(&conn).unwrap();
        let report = describe_schema(&conn).unwrap();
        let links = report.tables.iter().find(|t| t.name == "links").unwrap();
        for col in LINKS_COLUMNS {
            assert!(links.columns.contains(&col.name.to_string()), "missing {}", col.name);
        }
        let slots = report
            .tables
            .iter()
            .find(|t| t.name == "inbound_slots")
            .unwrap();
        for col in SLOTS_COLUMNS {
            assert!(slots.columns.contains(&col.name.to_string()), "missing {}", col.name);
        }
    }

    #[test]
    fn migration_is_idempotent() {
        let conn = open();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        // A second+ run must not error and must not duplicate columns.
        let report = describe_schema(&conn).unwrap();
        let links = report.tables.iter().find(|t| t.name == "links").unwrap();
        let unique: HashSet<_> = links.columns.iter().collect();
        assert_eq!(unique.len(), links.columns.len());
    }

    #[test]
    fn legacy_role_unique_index_is_dropped_if_present() {
        let conn = open();
        conn.execute_batch(SLOTS_BASELINE).unwrap();
        add_missing_columns(&conn, "inbound_slots", SLOTS_COLUMNS).unwrap();
        conn.execute_batch(
            "CREATE UNIQUE INDEX idx_slots_role_unique ON inbound_slots(role)",
        )
        .unwrap();
        // Two slots with the same role would violate the legacy constraint.
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO inbound_slots (port, tag, role) VALUES (1, 't1', 'test')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO inbound_slots (port, tag, role) VALUES (2, 't2', 'test')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn partial_unique_outbound_tag_allows_many_empty_but_rejects_dup_nonempty() {
        let conn = open();
        migrate(&conn).unwrap();
        conn.execute("INSERT INTO links (uri) VALUES ('a')", []).unwrap();
        conn.execute("INSERT INTO links (uri) VALUES ('b')", []).unwrap();
        conn.execute(
            "UPDATE links SET outbound_tag = '' WHERE uri IN ('a', 'b')",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE links SET outbound_tag = 'dup' WHERE uri = 'a'",
            [],
        )
        .unwrap();
        let err = conn.execute(
            "UPDATE links SET outbound_tag = 'dup' WHERE uri = 'b'",
            [],
        );
        assert!(err.is_err());
    }
}
