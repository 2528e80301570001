use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    configure_connection(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "assignment store ready"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

fn configure_connection(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS employees (
            worker_id TEXT PRIMARY KEY,
            doc TEXT NOT NULL,
            lat REAL,
            lng REAL,
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS job_sites (
            site_id TEXT PRIMARY KEY,
            doc TEXT NOT NULL,
            lat REAL,
            lng REAL,
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            employee_id TEXT NOT NULL,
            job_site_id TEXT NOT NULL,
            role TEXT NOT NULL,
            distance_km REAL NOT NULL,
            assigned_at TEXT NOT NULL,
            FOREIGN KEY (employee_id) REFERENCES employees(worker_id) ON DELETE CASCADE,
            FOREIGN KEY (job_site_id) REFERENCES job_sites(site_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_assignments_site_role ON assignments(job_site_id, role);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_employee ON assignments(employee_id);
        "#,
    )?;

    ensure_column(connection, "employees", "lat REAL")?;
    ensure_column(connection, "employees", "lng REAL")?;
    ensure_column(connection, "job_sites", "lat REAL")?;
    ensure_column(connection, "job_sites", "lng REAL")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}
