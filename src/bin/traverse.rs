use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relgraph::db::migrate;
use relgraph::entity::EntityRef;
use relgraph::graph::{
    RelationEntityTypeFilter, RelationPathLevel, RelationPathQuery, RelationService, RelationTypeGroup,
    RelationsQuery, SearchDirection,
};
use relgraph::Config;
use std::time::Instant;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "traverse")]
#[command(about = "Run a relation traversal or path query and print the edges as JSON")]
struct Args {
    /// Tenant owning the relations
    #[arg(short, long)]
    tenant: Uuid,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Breadth-first traversal from one or more roots
    Query {
        /// Root entity as TYPE:uuid; repeat for several roots
        #[arg(short, long, required = true)]
        root: Vec<EntityRef>,

        /// FROM follows outgoing edges, TO incoming
        #[arg(short, long, default_value = "FROM")]
        direction: SearchDirection,

        /// Maximum depth; negative is unlimited
        #[arg(short, long, default_value_t = -1, allow_hyphen_values = true)]
        max_level: i32,

        /// Keep only edges at the deepest level reached
        #[arg(long)]
        last_level_only: bool,

        /// Relation types to follow; all when omitted
        #[arg(long = "relation-type")]
        relation_types: Vec<String>,

        #[arg(short, long, default_value = "COMMON")]
        group: RelationTypeGroup,
    },
    /// Fixed sequence of typed steps from one root
    Path {
        #[arg(short, long)]
        root: EntityRef,

        /// Steps as DIRECTION:RelationType, e.g. FROM:Contains
        #[arg(short, long = "step", required = true)]
        steps: Vec<String>,

        #[arg(short, long, default_value = "COMMON")]
        group: RelationTypeGroup,
    },
}

fn parse_step(raw: &str) -> Result<RelationPathLevel> {
    let (direction, relation_type) = raw
        .split_once(':')
        .with_context(|| format!("Invalid step {} (expected DIRECTION:RelationType)", raw))?;
    let direction: SearchDirection = direction.parse()?;
    Ok(RelationPathLevel::new(direction, relation_type))
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

    let service = RelationService::from_config(db, &config);
    let start = Instant::now();

    let relations = match args.command {
        Command::Query {
            root,
            direction,
            max_level,
            last_level_only,
            relation_types,
            group,
        } => {
            let mut query = RelationsQuery::new(root[0], direction)
                .with_roots(root)
                .with_max_level(max_level)
                .last_level_only(last_level_only)
                .with_type_groups(vec![group]);
            if !relation_types.is_empty() {
                query = query.with_filters(
                    relation_types
                        .into_iter()
                        .map(|t| RelationEntityTypeFilter::new(t, Vec::new()))
                        .collect(),
                );
            }
            service.find_by_query(args.tenant, query).await?
        }
        Command::Path { root, steps, group } => {
            let levels = steps.iter().map(|s| parse_step(s)).collect::<Result<Vec<_>>>()?;
            let mut query = RelationPathQuery::new(root, levels);
            query.type_group = group;
            service.find_by_path_query(args.tenant, query).await?
        }
    };

    log::info!("Found {} relations in {:?}", relations.len(), start.elapsed());
    println!("{}", serde_json::to_string_pretty(&relations)?);

    Ok(())
}
