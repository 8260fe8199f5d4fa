//! CLI interface for postline

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{self, Config};
use crate::llm::keys;
use crate::pipeline::Pipeline;
use crate::platform::PublicApi;
use crate::rules::PolicySource;
use crate::store::Store;
use crate::types::{ActorId, ContentItem, Destination, DestinationStatus};

#[derive(Parser)]
#[command(name = "postline")]
#[command(about = "Schedule, publish and watch creator content across communities", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (default: platform config dir)
    #[arg(short, long, global = true, env = "POSTLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log lifecycle events (INFO)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: intake, scheduling, dispatch, monitoring, learning
    Run,
    /// Add a content item to the intake queue
    Enqueue {
        #[arg(short, long)]
        actor: Option<String>,
        /// Media file to upload
        #[arg(short, long)]
        media: PathBuf,
        /// Creator caption
        #[arg(short = 'C', long, default_value = "")]
        caption: String,
        #[arg(long)]
        nsfw: bool,
        /// Style tag used by the learner
        #[arg(long)]
        style: Option<String>,
        /// Content id (default: random)
        #[arg(long)]
        id: Option<String>,
    },
    /// Plan a JSON list of content items right away, skipping the batch window
    Schedule {
        #[arg(short, long)]
        actor: Option<String>,
        /// JSON array of content items
        file: PathBuf,
    },
    /// Submit everything that is due now
    Dispatch,
    /// Run one outcome monitor cycle
    Monitor,
    /// Re-run the risk adapter over every destination
    Sweep,
    /// Recompute performance summaries and print them
    Learn {
        #[arg(short, long)]
        actor: Option<String>,
    },
    /// Show queue and outcome counts
    Status {
        #[arg(short, long)]
        actor: Option<String>,
        /// Recent requests to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Manage destinations
    Destination {
        #[command(subcommand)]
        command: DestinationCommands,
    },
    /// Show or change configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Print the config file path
        #[arg(long)]
        path: bool,
        /// Store the OpenRouter API key
        #[arg(long)]
        set_api_key: Option<String>,
        /// Remove the stored OpenRouter API key
        #[arg(long)]
        delete_api_key: bool,
    },
}

#[derive(Subcommand)]
enum DestinationCommands {
    /// Add a suggested destination
    Add {
        name: String,
        #[arg(short, long)]
        actor: Option<String>,
        #[arg(long)]
        nsfw: bool,
        #[arg(long, default_value = "0")]
        members: u64,
        /// Approve right away
        #[arg(long)]
        approve: bool,
        /// Prefer this destination when assigning slots
        #[arg(long)]
        elevated: bool,
        /// Fill members and NSFW flag from the public API
        #[arg(long)]
        lookup: bool,
    },
    /// Approve a suggested destination for scheduling
    Approve {
        name: String,
        #[arg(short, long)]
        actor: Option<String>,
    },
    /// Lift a ban, verification flag or cooldown after manual review
    Review {
        name: String,
        #[arg(short, long)]
        actor: Option<String>,
    },
    /// List destinations of an actor
    List {
        #[arg(short, long)]
        actor: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// `--actor`, or the only configured actor
fn resolve_actor(config: &Config, actor: Option<String>) -> Result<ActorId> {
    if let Some(id) = actor {
        let id = ActorId::new(id);
        if config.actor(&id).is_none() {
            bail!("Unknown actor '{}'. Add it under [[actors]] in the config.", id);
        }
        return Ok(id);
    }
    match config.actors.as_slice() {
        [only] => Ok(only.actor_id()),
        [] => bail!("No actors configured. Add one under [[actors]] in the config."),
        _ => bail!("Several actors configured; pick one with --actor"),
    }
}

async fn open_store(config: &Config) -> Result<Store> {
    Store::open(config.database_path()?).await
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run => {
            Pipeline::build(config).await?.run().await?;
        }
        Commands::Enqueue {
            actor,
            media,
            caption,
            nsfw,
            style,
            id,
        } => {
            let actor = resolve_actor(&config, actor)?;
            if !media.exists() {
                bail!("Media file not found: {}", media.display());
            }
            let media = media
                .canonicalize()
                .with_context(|| format!("Failed to resolve {}", media.display()))?;
            let item = ContentItem {
                id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                media_path: media.display().to_string(),
                caption,
                nsfw,
                style,
            };
            let store = open_store(&config).await?;
            let row = store.push_intake(&actor, &item).await?;
            println!("Queued {} for {} (intake #{})", item.id, actor, row);
        }
        Commands::Schedule { actor, file } => {
            let actor = resolve_actor(&config, actor)?;
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let items: Vec<ContentItem> =
                serde_json::from_str(&raw).with_context(|| format!("{} is not a list of content items", file.display()))?;

            let pipeline = Pipeline::build(config).await?;
            let outcome = pipeline.scheduler().schedule_batch(&actor, items).await?;
            for req in &outcome.queued {
                println!(
                    "{}  r/{:<24} {}",
                    req.scheduled_at.format("%Y-%m-%d %H:%M"),
                    req.destination,
                    req.title
                );
            }
            println!(
                "{} queued, {} already scheduled, {} without a slot",
                outcome.queued.len(),
                outcome.duplicates,
                outcome.overflow.len()
            );
        }
        Commands::Dispatch => {
            let pipeline = Pipeline::build(config).await?;
            let report = pipeline.dispatcher().dispatch_due().await;
            pipeline.shutdown().await;
            let report = report?;
            println!(
                "Published {}, blocked {}, failed {}, retrying {}",
                report.published, report.blocked, report.failed, report.requeued
            );
        }
        Commands::Monitor => {
            let pipeline = Pipeline::build(config).await?;
            let report = pipeline.monitor().run_cycle().await?;
            println!(
                "Checked {}, newly removed {}, unreachable {}",
                report.checked, report.removed, report.unknown
            );
        }
        Commands::Sweep => {
            let store = open_store(&config).await?;
            let adjusted = crate::risk::RiskAdapter::new(store).sweep().await?;
            println!("Adjusted {} risk profiles", adjusted);
        }
        Commands::Learn { actor } => {
            let store = open_store(&config).await?;
            let learner = crate::learner::PerformanceLearner::new(store.clone());
            let actors = match actor {
                Some(id) => vec![resolve_actor(&config, Some(id))?],
                None => store.list_actors().await?,
            };
            for actor in actors {
                let summary = learner.recompute(&actor).await?;
                println!("{}", actor);
                println!("  top:        {}", summary.top_destinations.join(", "));
                println!("  high risk:  {}", summary.high_risk_destinations.join(", "));
                println!(
                    "  best hours: {}",
                    summary
                        .best_hours
                        .iter()
                        .map(|h| format!("{:02}:00", h))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                for (destination, style) in &summary.best_style {
                    println!("  style r/{}: {}", destination, style);
                }
            }
        }
        Commands::Status { actor, limit } => {
            let actor = resolve_actor(&config, actor)?;
            let store = open_store(&config).await?;
            let stats = store.stats(&actor).await?;
            println!("Actor:        {}", actor);
            println!("Destinations: {}", stats.destinations);
            println!("Queued:       {}", stats.queued);
            println!("Published:    {} ({} removed)", stats.published, stats.removed);
            println!("Blocked:      {}", stats.blocked);
            println!("Failed:       {}", stats.failed);

            let recent = store.list_submissions(&actor, limit).await?;
            if !recent.is_empty() {
                println!();
                for req in recent {
                    println!(
                        "{}  {:<10} r/{:<24} {}{}",
                        req.scheduled_at.format("%Y-%m-%d %H:%M"),
                        req.state.as_str(),
                        req.destination,
                        req.title,
                        req.last_error.map(|e| format!("  ({})", e)).unwrap_or_default()
                    );
                }
            }
        }
        Commands::Destination { command } => destination_command(&config, command).await?,
        Commands::Config {
            show,
            path,
            set_api_key,
            delete_api_key,
        } => {
            if let Some(key) = set_api_key {
                let stored_in = keys::set_api_key(&key)?;
                println!("OpenRouter API key stored in the {}.", stored_in);
            } else if delete_api_key {
                keys::delete_api_key()?;
                println!("OpenRouter API key removed.");
            } else if path {
                match &cli.config {
                    Some(path) => println!("{}", path.display()),
                    None => println!("{}", config::config_path()?.display()),
                }
            } else if show {
                config::show_config(&config)?;
                match keys::find_api_key() {
                    Some((_, source)) => println!("API key:       from {}", source),
                    None => println!("API key:       missing"),
                }
            } else {
                println!("Configuration options:");
                println!("  --show                 Display current configuration");
                println!("  --path                 Print the config file path");
                println!("  --set-api-key <key>    Store your OpenRouter API key");
                println!("  --delete-api-key       Remove the stored API key");
            }
        }
    }

    Ok(())
}

async fn destination_command(config: &Config, command: DestinationCommands) -> Result<()> {
    let store = open_store(config).await?;
    match command {
        DestinationCommands::Add {
            name,
            actor,
            nsfw,
            members,
            approve,
            elevated,
            lookup,
        } => {
            let actor = resolve_actor(config, actor)?;
            let name = name.trim().trim_start_matches("r/").to_string();
            let mut dest = store
                .get_destination(&actor, &name)
                .await?
                .unwrap_or_else(|| Destination::suggested(actor.clone(), &name));
            dest.nsfw = nsfw;
            dest.member_count = members;
            dest.elevated_priority = elevated;
            if approve {
                dest.status = DestinationStatus::Approved;
            }
            if lookup {
                let metadata = PublicApi::new(&config.platform)?.fetch_metadata(&name).await?;
                dest.member_count = metadata.subscribers.unwrap_or(dest.member_count);
                dest.nsfw = metadata.over18.unwrap_or(dest.nsfw);
            }
            store.upsert_destination(&dest).await?;
            println!(
                "r/{} ({}, {} members{}) saved for {}",
                dest.name,
                dest.status.as_str(),
                dest.member_count,
                if dest.nsfw { ", nsfw" } else { "" },
                actor
            );
        }
        DestinationCommands::Approve { name, actor } => {
            let actor = resolve_actor(config, actor)?;
            let Some(mut dest) = store.get_destination(&actor, &name).await? else {
                bail!("r/{} is not a destination of {}", name, actor);
            };
            dest.status = DestinationStatus::Approved;
            store.upsert_destination(&dest).await?;
            println!("r/{} approved for {}", name, actor);
        }
        DestinationCommands::Review { name, actor } => {
            let actor = resolve_actor(config, actor)?;
            if store.review_destination(&actor, &name).await? {
                println!("r/{} reviewed: ban, verification flag and cooldown cleared", name);
            } else {
                bail!("r/{} is not a destination of {}", name, actor);
            }
        }
        DestinationCommands::List { actor } => {
            let actor = resolve_actor(config, actor)?;
            let now = chrono::Utc::now();
            for dest in store.list_destinations(&actor).await? {
                let mut flags = Vec::new();
                if dest.banned {
                    flags.push("banned".to_string());
                }
                if dest.needs_verification {
                    flags.push("needs verification".to_string());
                }
                if let Some(until) = dest.cooldown_until.filter(|u| *u > now) {
                    flags.push(format!("cooling down until {}", until.format("%Y-%m-%d %H:%M")));
                }
                if dest.elevated_priority {
                    flags.push("elevated".to_string());
                }
                println!(
                    "r/{:<24} {:<9} risk {:.2}  {}",
                    dest.name,
                    dest.status.as_str(),
                    dest.risk_score,
                    flags.join(", ")
                );
            }
        }
    }
    Ok(())
}
