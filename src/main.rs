//! Plansync CLI - Composite Plan Document Store

use clap::{Parser, Subcommand};
use plansync::index::SearchQuery;
use plansync::{Conditional, Config, Environment, Plansync};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "plansync")]
#[command(about = "Composite plan document store with a search-index mirror", long_about = None)]
struct Cli {
    /// Config file (defaults to plansync.yaml in the data directory, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment whose defaults apply when no config file is found
    #[arg(short, long, default_value = "development")]
    env: Environment,

    /// Data directory, overriding the config
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Bearer token, checked against the configured auth tokens
    #[arg(short, long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a data directory with a default config
    Init,

    /// Create a plan from a JSON file ("-" for stdin)
    Create { file: PathBuf },

    /// Apply a partial update from a JSON file ("-" for stdin)
    Patch {
        id: String,
        file: PathBuf,
        /// Only apply if this ETag is current
        #[arg(long)]
        if_match: Option<String>,
    },

    /// Print a plan
    Get {
        id: String,
        /// Print nothing if this ETag is still current
        #[arg(long)]
        if_none_match: Option<String>,
    },

    /// Print every plan
    List,

    /// Delete a plan and everything it owns
    Delete { id: String },

    /// Search plans by text, or by one field with --field
    Search {
        query: String,
        #[arg(long)]
        field: Option<String>,
    },

    /// Print the direct children of a node
    Children { id: String },

    /// Show store and index status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level()?)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Init => init_data_dir(config).await,
        command => run(config, cli.token.as_deref(), command).await,
    };

    if let Err(e) = &result {
        if let Some(err) = e.downcast_ref::<plansync::Error>() {
            eprintln!("Error ({}): {}", err.status(), err);
            if let Some(hint) = err.suggestion() {
                eprintln!("Hint: {}", hint);
            }
            std::process::exit(1);
        }
    }
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let default_path = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| Config::for_environment(cli.env).data_dir)
        .join("plansync.yaml");

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None if default_path.exists() => Config::load(&default_path)?,
        None => Config::for_environment(cli.env),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

async fn read_json(file: &Path) -> anyhow::Result<Value> {
    let content = if file == Path::new("-") {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(file).await?
    };
    Ok(serde_json::from_str(&content)?)
}

async fn init_data_dir(config: Config) -> anyhow::Result<()> {
    println!("Initializing plansync at {:?}...", config.data_dir);
    let db = Plansync::open(config).await?;

    let config_path = db.config.data_dir.join("plansync.yaml");
    if !config_path.exists() {
        tokio::fs::write(&config_path, db.config.to_yaml()?).await?;
    }

    println!("Data directory initialized successfully!");
    println!();
    println!("Directory structure:");
    println!("  store/          - Plan records and ETags");
    println!("  index/          - Search index snapshot");
    println!("  plansync.yaml   - Configuration");
    println!();
    println!("Get started:");
    println!("  plansync create plan.json");
    println!("  plansync get <objectId>");
    Ok(())
}

/// Open the data directory, authenticate, then run a plan command
async fn run(config: Config, token: Option<&str>, command: Commands) -> anyhow::Result<()> {
    let db = Plansync::open(config).await?;

    let authorization = token.map(|t| format!("Bearer {}", t));
    match db.auth().authenticate(authorization.as_deref()).await {
        Ok(principal) => tracing::debug!(subject = %principal.subject, "Authenticated"),
        Err(rejection) => {
            eprintln!("Error ({}): {}", rejection.status(), rejection);
            std::process::exit(1);
        }
    }

    match command {
        Commands::Init => Ok(()),
        Commands::Create { file } => create_plan(&db, &file).await,
        Commands::Patch { id, file, if_match } => patch_plan(&db, &id, &file, if_match.as_deref()).await,
        Commands::Get { id, if_none_match } => get_plan(&db, &id, if_none_match.as_deref()).await,
        Commands::List => list_plans(&db).await,
        Commands::Delete { id } => delete_plan(&db, &id).await,
        Commands::Search { query, field } => search(&db, &query, field).await,
        Commands::Children { id } => children(&db, &id).await,
        Commands::Status => show_status(&db).await,
    }
}

async fn create_plan(db: &Plansync, file: &Path) -> anyhow::Result<()> {
    let accepted = db.service().create_plan(read_json(file).await?).await?;
    println!("{} {}", accepted.status(), db.config.plan_path(&accepted.plan_id));
    report_drain(db).await
}

async fn patch_plan(db: &Plansync, id: &str, file: &Path, if_match: Option<&str>) -> anyhow::Result<()> {
    let accepted = db
        .service()
        .patch_plan(id, read_json(file).await?, if_match)
        .await?;
    println!("{} {}", accepted.status(), db.config.plan_path(id));
    report_drain(db).await
}

async fn delete_plan(db: &Plansync, id: &str) -> anyhow::Result<()> {
    let accepted = db.service().delete_plan(id).await?;
    println!("{} {}", accepted.status(), db.config.plan_path(id));
    report_drain(db).await
}

async fn report_drain(db: &Plansync) -> anyhow::Result<()> {
    let stats = db.drain().await?;
    if stats.failed > 0 {
        println!("Mutation was dropped by the consumer; see the log for details.");
    } else {
        println!("{} mutation(s) applied.", stats.processed);
    }
    Ok(())
}

async fn get_plan(db: &Plansync, id: &str, if_none_match: Option<&str>) -> anyhow::Result<()> {
    match db.service().get_plan(id, if_none_match).await? {
        Conditional::NotModified => println!("304 Not Modified"),
        Conditional::Fresh { body, etag } => {
            println!("ETag: {}", plansync::etag::quote(&etag));
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}

async fn list_plans(db: &Plansync) -> anyhow::Result<()> {
    match db.service().list_plans(None).await {
        Ok(listed) => {
            if let Conditional::Fresh { body, etag } = listed {
                println!("ETag: {}", plansync::etag::quote(&etag));
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
        }
        Err(plansync::Error::NoPlansFound) => println!("No plans found."),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn search(db: &Plansync, query: &str, field: Option<String>) -> anyhow::Result<()> {
    let query = match field {
        Some(field) if query.contains(['*', '?']) => SearchQuery::Wildcard {
            field,
            pattern: query.to_string(),
        },
        Some(field) => SearchQuery::Term {
            field,
            value: serde_json::from_str(query).unwrap_or_else(|_| Value::String(query.to_string())),
        },
        None => SearchQuery::Text(query.to_string()),
    };

    let plans = db.service().search(&query).await?;
    if plans.is_empty() {
        println!("No plans found.");
    } else {
        println!("{}", serde_json::to_string_pretty(&plans)?);
    }
    Ok(())
}

async fn children(db: &Plansync, id: &str) -> anyhow::Result<()> {
    let children = db.service().children(id).await?;
    if children.is_empty() {
        println!("No children found.");
    } else {
        println!("{}", serde_json::to_string_pretty(&children)?);
    }
    Ok(())
}

async fn show_status(db: &Plansync) -> anyhow::Result<()> {
    let plans = db.service().plan_ids().await?;

    println!("Plansync Status");
    println!("===============");
    println!("Environment: {}", db.config.environment);
    println!("Data dir: {:?}", db.config.data_dir);
    println!("Index: {}", db.index().name());
    println!("Queue: {} (capacity {})", db.config.queue_name, db.config.queue_capacity);
    println!();
    println!("Plans: {}", plans.len());
    for id in &plans {
        println!("  {}", id);
    }
    Ok(())
}
