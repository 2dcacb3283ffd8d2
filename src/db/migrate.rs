//! Schema migrations for the relation and alarm tables.
//!
//! Each `NNN_name.sql` file in the migrations directory is applied once, in
//! version order, inside its own transaction. Applied versions are recorded
//! in `schema_migrations`.

use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::{RelgraphError, Result};

struct Migration {
    version: u32,
    name: String,
    sql: String,
}

impl Migration {
    /// Parse `001_relations.sql` into version 1, name `001_relations`.
    ///
    /// Returns `Ok(None)` for files that are not `.sql`.
    fn from_path(path: &Path) -> Result<Option<Self>> {
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            return Ok(None);
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| RelgraphError::Config(format!("Unreadable migration file name: {}", path.display())))?;
        let version = name
            .split_once('_')
            .and_then(|(prefix, _)| prefix.parse::<u32>().ok())
            .ok_or_else(|| {
                RelgraphError::Config(format!("Migration {} must start with a numeric version and '_'", name))
            })?;

        Ok(Some(Self {
            version,
            name: name.to_string(),
            sql: fs::read_to_string(path)?,
        }))
    }
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )?;
    Ok(())
}

/// Names of applied migrations, oldest first.
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for name in rows {
        names.push(name?);
    }
    Ok(names)
}

fn applied_versions(conn: &Connection) -> Result<HashSet<u32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let rows = stmt.query_map([], |row| row.get::<_, u32>(0))?;
    let mut versions = HashSet::new();
    for version in rows {
        versions.insert(version?);
    }
    Ok(versions)
}

/// Migrations on disk keyed by version. Two files sharing a version is an
/// error rather than an ordering accident.
fn pending_from_dir(migrations_dir: &Path) -> Result<BTreeMap<u32, Migration>> {
    let mut by_version: BTreeMap<u32, Migration> = BTreeMap::new();
    for entry in fs::read_dir(migrations_dir)? {
        let Some(migration) = Migration::from_path(&entry?.path())? else {
            continue;
        };
        if let Some(existing) = by_version.get(&migration.version) {
            return Err(RelgraphError::Config(format!(
                "Migrations {} and {} share version {}",
                existing.name, migration.name, migration.version
            )));
        }
        by_version.insert(migration.version, migration);
    }
    Ok(by_version)
}

/// Apply every migration in `migrations_dir` not yet recorded.
///
/// A failing migration is rolled back and stops the run; earlier ones stay
/// applied.
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<()> {
    ensure_migrations_table(conn)?;
    let applied = applied_versions(conn)?;

    let mut count = 0;
    for (version, migration) in pending_from_dir(migrations_dir)? {
        if applied.contains(&version) {
            continue;
        }

        log::info!("Applying migration {}", migration.name);
        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql).map_err(|e| {
            RelgraphError::Config(format!("Migration {} failed: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![version, migration.name],
        )?;
        tx.commit()?;
        count += 1;
    }

    log::debug!("{} migrations applied, {} already present", count, applied.len());
    Ok(())
}
