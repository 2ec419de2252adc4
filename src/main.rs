//! Binary entrypoint for the Townward admin CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml` and create the claims store
//! - `status` - print record counts for the store
//! - `sweep` - run the consistency sweep and print what it found
//! - `check <action> --subject <name> --world <w> --x --y --z [--material <m>] [--reason <r>]` -
//!   evaluate one permission decision and print it with its reason
//!
//! See the library crate docs for module-level details: `townward::`.
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use townward::claims::sweep::{spawn_sweep, SweepReport};
use townward::claims::{
    ActionKind, ClaimStore, ClaimStoreBuilder, Location, PermissionResolver, SpawnReason,
};
use townward::config::Config;
use townward::metrics;

#[derive(Parser)]
#[command(name = "townward")]
#[command(about = "Land claims and build permissions for block worlds")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the claims store
    Init,
    /// Show store statistics
    Status,
    /// Scan the store for orphaned or inconsistent rows
    Sweep,
    /// Evaluate a single permission decision
    Check {
        /// place, destroy, interact or spawn
        action: String,
        /// Subject display name (registered on first sight)
        #[arg(short, long)]
        subject: Option<String>,
        #[arg(short, long)]
        world: String,
        #[arg(long, allow_hyphen_values = true)]
        x: i32,
        #[arg(long, allow_hyphen_values = true)]
        y: i32,
        #[arg(long, allow_hyphen_values = true)]
        z: i32,
        /// Material id for place/destroy
        #[arg(short, long, default_value = "")]
        material: String,
        /// Spawn reason for spawn checks
        #[arg(short, long, default_value = "natural")]
        reason: String,
        /// Print the decision as JSON
        #[arg(long)]
        json: bool,
    },
}

fn open_store(config: &Config) -> Result<ClaimStore> {
    let path = config.storage.claims_db_path();
    let store = ClaimStoreBuilder::new(&path)
        .cell_size(config.rules.cell_size)
        .open()
        .map_err(|e| anyhow!("Failed to open claims store at {}: {}", path, e))?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init runs before a config file exists.
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Some(Config::load(&cli.config).await?),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Initializing new Townward configuration");
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                bail!("{} already exists; refusing to overwrite", cli.config);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            let config = Config::load(&cli.config).await?;
            let store = open_store(&config)?;
            store.flush()?;
            info!(
                "Claims store ready at {}",
                config.storage.claims_db_path()
            );
        }
        Commands::Status => {
            let config = pre_config.ok_or_else(|| anyhow!("configuration not loaded"))?;
            let store = open_store(&config)?;
            println!("Townward v{}", env!("CARGO_PKG_VERSION"));
            println!("store:      {}", config.storage.claims_db_path());
            println!("cell size:  {}", store.cell_size());
            println!("towns:      {}", store.count_towns());
            println!("cells:      {}", store.count_cells());
            println!("residences: {}", store.count_residences());
            println!("subjects:   {}", store.count_subjects());
            let mut worlds: Vec<_> = config.worlds.keys().cloned().collect();
            worlds.sort();
            if !worlds.is_empty() {
                println!("world overrides: {}", worlds.join(", "));
            }
        }
        Commands::Sweep => {
            let config = pre_config.ok_or_else(|| anyhow!("configuration not loaded"))?;
            let store = Arc::new(open_store(&config)?);
            let (tx, rx) = tokio::sync::oneshot::channel();
            spawn_sweep(store, move |result| {
                let _ = tx.send(result);
            })
            .await?;
            let report = rx.await??;
            print_report(&report);
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
        Commands::Check {
            action,
            subject,
            world,
            x,
            y,
            z,
            material,
            reason,
            json,
        } => {
            let config = pre_config.ok_or_else(|| anyhow!("configuration not loaded"))?;
            let store = open_store(&config)?;
            let action = ActionKind::parse(&action)
                .ok_or_else(|| anyhow!("unknown action '{}'", action))?;
            let subject = match subject {
                Some(name) => Some(store.resolve_subject(&name)?),
                None => None,
            };
            let loc = Location::new(&world, x, y, z);
            let resolver = PermissionResolver::new(&store, &config);
            let decision = match action {
                ActionKind::Spawn => {
                    let reason = SpawnReason::parse(&reason)
                        .ok_or_else(|| anyhow!("unknown spawn reason '{}'", reason))?;
                    resolver.decide_spawn(subject, &loc, reason)
                }
                ActionKind::Interact => {
                    let subject = subject.ok_or_else(|| anyhow!("--subject is required"))?;
                    resolver.decide_interact(subject, &loc)
                }
                ActionKind::Place | ActionKind::Destroy => {
                    let subject = subject.ok_or_else(|| anyhow!("--subject is required"))?;
                    if material.is_empty() {
                        warn!("no --material given; allow-lists will not match");
                    }
                    resolver.decide_edit(action, subject, &loc, &material)
                }
            };
            if json {
                let payload = serde_json::json!({
                    "action": action.as_str(),
                    "world": world,
                    "x": x,
                    "y": y,
                    "z": z,
                    "allowed": decision.allowed,
                    "reason": decision.reason.to_string(),
                    "lookup_failures": metrics::snapshot().lookup_failures,
                });
                println!("{}", payload);
            } else {
                println!(
                    "{} at {} {},{},{}: {} ({})",
                    action.as_str(),
                    world,
                    x,
                    y,
                    z,
                    if decision.allowed { "ALLOWED" } else { "DENIED" },
                    decision.reason
                );
            }
        }
    }

    Ok(())
}

fn print_report(report: &SweepReport) {
    println!("{}", report.summary_line());
    for id in &report.orphan_areas {
        println!("  area without residence: {}", id);
    }
    for id in &report.residences_without_area {
        println!("  residence without area: {}", id);
    }
    for chunk in &report.orphan_cells {
        println!(
            "  cell {},{} in {} held by missing town {}",
            chunk.x, chunk.z, chunk.world, chunk.town
        );
    }
    for (town, recorded, indexed) in &report.cell_count_drift {
        println!(
            "  town {} records {} cells, index holds {}",
            town, recorded, indexed
        );
    }
    for (namespace, entity) in &report.orphan_flags {
        println!("  flags of missing {} {}", namespace, entity);
    }
    for row in &report.dangling_members {
        println!(
            "  membership {} -> residence {} / subject {}",
            row.id, row.residence, row.subject
        );
    }
    for row in &report.dangling_leaders {
        println!(
            "  leadership {} -> town {} / subject {}",
            row.id, row.town, row.subject
        );
    }
    for row in &report.dangling_likes {
        println!(
            "  like {} -> residence {} / subject {}",
            row.id, row.residence, row.subject
        );
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|cfg| cfg.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config.as_ref().and_then(|cfg| cfg.logging.file.clone());
    if let Some(file) = log_file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

            // Mirror to the console only when stdout is a terminal
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
            let _ = builder.try_init();
            return;
        }
    }
    builder.format(|fmt, record| {
        writeln!(
            fmt,
            "{} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.args()
        )
    });
    let _ = builder.try_init();
}
