use anyhow::Result;
use relgraph::db::{migrate, Db};
use relgraph::Config;
use relgraph::RelgraphError;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // RUST_LOG wins over the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", config.storage.log_level.as_str())
    ).init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("verify");

    match command {
        "migrate" => {
            run_migrations(&config).await?;
        }
        "verify" => {
            let db = run_migrations(&config).await?;
            verify_database_schema(&db).await?;
        }
        other => {
            anyhow::bail!("Unknown command: {} (expected verify or migrate)", other);
        }
    }

    Ok(())
}

async fn run_migrations(config: &Config) -> Result<Db> {
    log::info!("Starting relgraph v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Database path: {}", config.db_path().display());

    let db = config.open_db();
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await?;

    log::info!("Database initialized successfully");
    Ok(db)
}

/// Check tables, indexes and pragmas, then print row counts.
async fn verify_database_schema(db: &Db) -> Result<()> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_tables = ["alarm_entities", "alarms", "relations", "schema_migrations"];
        let missing: Vec<&str> = expected_tables
            .iter()
            .copied()
            .filter(|t| !tables.iter().any(|have| have == t))
            .collect();
        if !missing.is_empty() {
            return Err(RelgraphError::Config(format!("Missing tables: {}", missing.join(", "))));
        }

        let active_index: bool = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND name='idx_alarms_single_active'")?
            .exists([])?;
        if !active_index {
            return Err(RelgraphError::Config("Unique active-alarm index is missing".to_string()));
        }

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(RelgraphError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(RelgraphError::Config(format!("Database integrity check failed: {}", integrity)));
        }

        let applied = migrate::get_applied_migrations(conn)?;
        println!("Migrations applied: {}", applied.len());
        for table in ["relations", "alarms", "alarm_entities"] {
            let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            println!("  {:<16} {}", table, count);
        }

        Ok(())
    }).await?;

    log::info!("Database schema verification complete");
    Ok(())
}
