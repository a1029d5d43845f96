use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trainflow_core::{CollisionPolicy, PipelineConfig};

mod commands;
mod dates;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train announcement reconciliation pipeline", long_about = None)]
struct Cli {
    /// Pipeline config file (falls back to TRAINFLOW_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build curated batches from raw announcements
    Process(DateSelection),
    /// Merge curated batches into the combined total
    Combine(CombineArgs),
    /// Build timetable trips from planned announcements (default: tomorrow)
    Plan(DateSelection),
    /// Process, then combine the dates that succeeded
    Run(RunArgs),
    /// Print statistics of the combined total
    Stats,
}

#[derive(Args, Debug, Default, Clone)]
struct DateSelection {
    /// Service dates as YYYYMMDD or YYYY-MM-DD
    #[arg(long, num_args = 1.., value_parser = dates::parse_date_arg, conflicts_with = "all")]
    dates: Vec<NaiveDate>,

    /// Every available date instead of the lookback window
    #[arg(long)]
    all: bool,
}

#[derive(Args, Debug, Clone)]
struct CombineArgs {
    #[command(flatten)]
    selection: DateSelection,

    /// Override the configured collision policy
    #[arg(long)]
    policy: Option<CollisionPolicy>,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    selection: DateSelection,

    #[arg(long)]
    policy: Option<CollisionPolicy>,

    #[arg(long)]
    skip_process: bool,

    /// Skip the timetable step (it also runs only when planned announcements exist)
    #[arg(long)]
    skip_planned: bool,

    #[arg(long)]
    skip_combine: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref()).context("failed to load config")?;
    info!(
        root = %config.storage.root.display(),
        timezone = %config.processing.timezone,
        pipeline = %config.processing.pipeline,
        "configuration loaded"
    );

    let app = commands::App::new(config)?;

    match cli.command {
        Command::Process(selection) => {
            let dates = app.process_selection(selection.dates, selection.all)?;
            app.process(dates).await?;
        }
        Command::Combine(args) => {
            let policy = args.policy.unwrap_or(app.collision_policy());
            if args.selection.all {
                app.combine_all(policy).await?;
            } else {
                let dates = app.combine_selection(args.selection.dates)?;
                app.combine(dates, policy).await?;
            }
        }
        Command::Plan(selection) => {
            let dates = app.planned_selection(selection.dates, selection.all)?;
            app.plan(dates).await?;
        }
        Command::Run(args) => {
            let policy = args.policy.unwrap_or(app.collision_policy());
            let all = args.selection.all;
            let dates = if args.skip_process {
                info!("skipping processing step");
                if all {
                    Vec::new()
                } else {
                    app.combine_selection(args.selection.dates)?
                }
            } else {
                let selected = app.process_selection(args.selection.dates, all)?;
                app.process(selected).await?
            };

            if args.skip_planned {
                info!("skipping timetable step");
            } else if app.has_planned_raw()? {
                let planned = app.planned_selection(Vec::new(), false)?;
                app.plan(planned).await?;
            } else {
                info!("no planned announcements; skipping timetable step");
            }

            if args.skip_combine {
                info!("skipping combine step");
            } else if all {
                app.combine_all(policy).await?;
            } else {
                app.combine(dates, policy).await?;
            }
        }
        Command::Stats => app.stats()?,
    }

    Ok(())
}
