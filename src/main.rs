use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use proxy_pool::{
    calc_stats,
    database::{ProxyFilter, ProxySort},
    init_tracing, live_proxies, register_jobs, Config, Database, LiveQuery, Protocol, ProxyKind,
    ProxyStatus, ProxyValidator, SharedSettings, SourceDefault, SourceIngestor, TokioScheduler,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// Ingests proxy lists, keeps verifying them and serves the live pool
#[derive(Parser)]
#[command(name = "proxy-pool")]
#[command(about = "Ingests proxy lists, keeps verifying them and serves the live pool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./proxy-pool.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database URL, overrides the config
    #[arg(short, long)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy_check and source_check jobs until Ctrl-C
    Serve,
    /// Manage sources
    #[command(subcommand)]
    Source(SourceCommand),
    /// Inspect and check single proxies
    #[command(subcommand)]
    Proxy(ProxyCommand),
    /// Print the live pool
    Live {
        /// Comma separated source ids
        #[arg(short, long, value_delimiter = ',')]
        sources: Option<Vec<String>>,
        /// Only this protocol (http, socks5)
        #[arg(short, long)]
        protocol: Option<Protocol>,
        /// One proxy per egress IP
        #[arg(short, long)]
        unique_ip: bool,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Print pool statistics as JSON
    Stats,
    /// Print all sources as TOML
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Create or update sources from a TOML file
    Import {
        input: PathBuf,
    },
    /// Mark every proxy as never checked
    ResetStatus,
}

#[derive(Subcommand)]
enum SourceCommand {
    /// Add a new source
    Add {
        id: String,
        /// URL of a plain text proxy list
        #[arg(short, long)]
        link: Option<String>,
    },
    /// Show a source as JSON
    Show { id: String },
    /// List all sources
    List,
    /// Delete a source and all of its proxies
    Delete { id: String },
    /// Replace the items of a source, one per line
    Items {
        id: String,
        /// Read items from a file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Set the template used for bare hosts
    Default {
        id: String,
        #[arg(short, long, default_value = "http")]
        protocol: Protocol,
        #[arg(short, long)]
        username: String,
        #[arg(short = 'P', long)]
        password: String,
        #[arg(long)]
        port: u16,
        /// direct or gateway
        #[arg(short, long, default_value = "direct")]
        kind: ProxyKind,
    },
    /// Remove the template of a source
    ClearDefault { id: String },
    /// Delete all proxies of a source
    ClearProxies { id: String },
    /// Ingest a source now
    Check { id: String },
}

#[derive(Subcommand)]
enum ProxyCommand {
    /// List proxies ordered by URL
    List {
        /// Only proxies of this source
        #[arg(short, long)]
        source: Option<String>,
        /// Only proxies with this status (UNKNOWN, OK, DOWN)
        #[arg(long)]
        status: Option<ProxyStatus>,
    },
    /// Show a proxy as JSON
    Show { id: String },
    /// Check a proxy now
    Check { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database_url = database;
    }
    let db = Database::new(&config.database_url)
        .await
        .with_context(|| format!("cannot open database {}", config.database_url))?;

    match cli.command {
        Commands::Serve => {
            let settings = Arc::new(SharedSettings::new(config.settings.clone()));
            let validator =
                Arc::new(ProxyValidator::with_default_oracles(db.clone(), settings).await);
            let ingestor = Arc::new(SourceIngestor::new(db.clone())?);

            let scheduler = TokioScheduler::new();
            register_jobs(&scheduler, Arc::clone(&validator), ingestor);
            tracing::info!(
                database = %config.database_url,
                own_ip = validator.own_ip().unwrap_or("unknown"),
                tasks = ?scheduler.task_names(),
                "serving"
            );

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            scheduler.shutdown();
        }
        Commands::Source(command) => run_source(command, db.clone()).await?,
        Commands::Proxy(ProxyCommand::List { source, status }) => {
            let mut filter = ProxyFilter::new();
            if let Some(source) = &source {
                filter = filter.source(source);
            }
            if let Some(status) = status {
                filter = filter.status(status);
            }
            let proxies = db.find_proxies(&filter, ProxySort::Url, None).await?;
            if proxies.is_empty() {
                println!("No proxies found.");
            }
            for proxy in proxies {
                println!(
                    "{} {:<7} {} ({}/{} ok) {}",
                    proxy.id,
                    proxy.status.to_string(),
                    proxy.endpoint(),
                    proxy.history_ok_count(),
                    proxy.history_ok_count() + proxy.history_down_count(),
                    proxy.proxy_ip.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Proxy(ProxyCommand::Show { id }) => {
            let proxy = db.get_proxy(&id).await?;
            println!("{}", serde_json::to_string_pretty(&proxy)?);
        }
        Commands::Proxy(ProxyCommand::Check { id }) => {
            let settings = Arc::new(config.settings.clone());
            let validator = ProxyValidator::with_default_oracles(db.clone(), settings).await;
            let outcome = validator.check(&id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Live {
            sources,
            protocol,
            unique_ip,
            format,
        } => {
            let query = LiveQuery {
                sources,
                protocol,
                unique_ip,
            };
            let proxies = live_proxies(&db, &config.settings, &query).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&proxies)?),
                OutputFormat::Text => {
                    for proxy in &proxies {
                        println!("{}", proxy.url);
                    }
                }
            }
        }
        Commands::Stats => {
            let stats = calc_stats(&db, &config.settings).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Export { output } => {
            let ingestor = SourceIngestor::new(db.clone())?;
            let toml = ingestor.export_toml().await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, toml)?;
                    println!("Exported sources to {:?}", path);
                }
                None => print!("{}", toml),
            }
        }
        Commands::Import { input } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("cannot read {:?}", input))?;
            let ingestor = SourceIngestor::new(db.clone())?;
            let count = ingestor.import_toml(&text).await?;
            println!("Imported {} sources", count);
        }
        Commands::ResetStatus => {
            let settings = Arc::new(config.settings.clone());
            let validator = ProxyValidator::new(db.clone(), settings, Vec::new(), None);
            let count = validator.reset_all_statuses().await?;
            println!("Reset {} proxies", count);
        }
    }

    db.close().await;
    Ok(())
}

async fn run_source(command: SourceCommand, db: Database) -> Result<()> {
    let ingestor = SourceIngestor::new(db)?;

    match command {
        SourceCommand::Add { id, link } => {
            let source = ingestor.create(&id, link).await?;
            println!("Source added: {}", source.id);
        }
        SourceCommand::Show { id } => {
            let source = ingestor.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&source)?);
        }
        SourceCommand::List => {
            let sources = ingestor.list().await?;
            if sources.is_empty() {
                println!("No sources found.");
            }
            for source in sources {
                let checked = source
                    .checked_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{} - {} items, link: {}, checked: {}",
                    source.id,
                    source.items.len(),
                    source.link.as_deref().unwrap_or("-"),
                    checked
                );
            }
        }
        SourceCommand::Delete { id } => {
            ingestor.get(&id).await?;
            ingestor.delete(&id).await?;
            println!("Source deleted: {}", id);
        }
        SourceCommand::Items { id, file } => {
            let text = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {:?}", path))?,
                None => {
                    let mut text = String::new();
                    std::io::stdin().read_to_string(&mut text)?;
                    text
                }
            };
            let items = ingestor.set_items(&id, &text).await?;
            println!("Saved {} items for {}", items.len(), id);
        }
        SourceCommand::Default {
            id,
            protocol,
            username,
            password,
            port,
            kind,
        } => {
            let default = SourceDefault::new(protocol, &username, &password, port).with_kind(kind);
            ingestor.set_default(&id, default).await?;
            println!("Default set for {}", id);
        }
        SourceCommand::ClearDefault { id } => {
            ingestor.clear_default(&id).await?;
            println!("Default cleared for {}", id);
        }
        SourceCommand::ClearProxies { id } => {
            let count = ingestor.clear_proxies(&id).await?;
            println!("Deleted {} proxies of {}", count, id);
        }
        SourceCommand::Check { id } => {
            let count = ingestor.check(&id).await?;
            println!("Collected {} proxy candidates from {}", count, id);
        }
    }

    Ok(())
}
