use anyhow::Result;
use clap::Parser;
use relgraph::alarm::{AlarmQuery, AlarmSearchStatus, AlarmService, PageLink};
use relgraph::db::migrate;
use relgraph::entity::EntityRef;
use relgraph::{Config, InMemoryDirectory};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "alarms")]
#[command(about = "List alarms visible on an entity and report the highest severity")]
struct Args {
    /// Tenant owning the alarms
    #[arg(short, long)]
    tenant: Uuid,

    /// Affected entity as TYPE:uuid
    #[arg(short, long)]
    entity: EntityRef,

    /// ANY, ACTIVE, CLEARED, ACK or UNACK
    #[arg(short, long, default_value = "ANY")]
    status: AlarmSearchStatus,

    #[arg(long, default_value_t = 20)]
    page_size: usize,

    #[arg(long, default_value_t = 0)]
    page: usize,

    /// Print the page as JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "warn")
    ).init();

    let args = Args::parse();
    let config = Config::load()?;

    let db = config.open_db();
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await?;

    // Key values and ownership live outside this database.
    let directory = Arc::new(InMemoryDirectory::new());
    let service = AlarmService::new(db, directory.clone(), directory);

    let mut query = AlarmQuery::affecting(args.entity);
    query.search_status = Some(args.status);
    query.page_link = PageLink::new(args.page_size, args.page);
    let page = service.find_alarms(args.tenant, query).await?;

    let highest = service
        .find_highest_alarm_severity(args.tenant, args.entity, Some(args.status), None, None)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    println!(
        "{} alarms on {} (page {}/{})",
        page.total_elements,
        args.entity,
        args.page + 1,
        page.total_pages.max(1)
    );
    for alarm in &page.data {
        println!(
            "  {}  {:<13} {:<13} {}  originator={}",
            alarm.id,
            alarm.severity.as_str(),
            alarm.status().as_str(),
            alarm.alarm_type,
            alarm.originator
        );
    }
    match highest {
        Some(severity) => println!("Highest severity: {}", severity),
        None => println!("Highest severity: none"),
    }

    Ok(())
}
