use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ep724_core::{format_ds, parse_ds};
use ep724_sync::{
    pipeline_from_env, transform_to_run_dir, PgLoader, SyncConfig, SyncOutcome, SyncPipeline,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ep724")]
#[command(about = "STB EP724 weekly rail service data ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Exit 0 when the latest release covers the target date, 2 otherwise.
    Check {
        #[arg(long)]
        target_date: String,
    },
    Fetch {
        #[arg(long)]
        target_path: PathBuf,
    },
    /// Build both output tables from a local workbook.
    Transform {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        target_date: String,
        #[arg(long)]
        release_date: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    Load {
        #[arg(long)]
        run_dir: PathBuf,
    },
    Run {
        #[arg(long)]
        target_date: Option<String>,
        #[arg(long)]
        release_date: Option<String>,
    },
    Migrate,
}

fn today() -> String {
    format_ds(Utc::now().date_naive())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        target_date: None,
        release_date: None,
    });

    match command {
        Commands::Check { target_date } => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env()?)?;
            if pipeline.check_availability(&target_date).await? {
                println!("available");
            } else {
                println!("waiting");
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Fetch { target_path } => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env()?)?;
            let release = pipeline.fetch(&target_path).await?;
            println!(
                "fetched: date={} url={} path={}",
                release.link.date,
                release.url,
                target_path.display()
            );
        }
        Commands::Transform {
            source,
            target_date,
            release_date,
            output_dir,
        } => {
            let release_date = release_date.unwrap_or_else(today);
            let run_dir = match output_dir {
                Some(dir) => dir,
                None => SyncConfig::from_env()?.run_dir(parse_ds(&target_date)?),
            };
            let (delta, outputs) =
                transform_to_run_dir(&source, &target_date, &release_date, &run_dir).await?;
            println!(
                "transform complete: series={} observations={} delta={} manifest={}",
                delta.series.len(),
                delta.observations.len(),
                outputs.delta_path.display(),
                outputs.manifest_path.display()
            );
        }
        Commands::Load { run_dir } => {
            let pipeline = pipeline_from_env().await?;
            if pipeline.config().database_url.is_none() {
                bail!("DATABASE_URL is not set; nothing to load into");
            }
            let load = pipeline.load_run_dir(&run_dir).await?;
            println!(
                "load complete: loader={} series={} observations={}",
                load.loader, load.series_rows, load.observation_rows
            );
        }
        Commands::Run {
            target_date,
            release_date,
        } => {
            let target_date = target_date.unwrap_or_else(today);
            let release_date = release_date.unwrap_or_else(today);
            let pipeline = pipeline_from_env().await?;
            match pipeline.run_once(&target_date, &release_date).await? {
                SyncOutcome::NotYetAvailable { latest_date, .. } => {
                    println!("waiting: latest release is {latest_date}");
                    return Ok(ExitCode::from(2));
                }
                SyncOutcome::Completed(summary) => {
                    println!(
                        "sync complete: run_id={} source_date={} series={} observations={} loader={} run_dir={}",
                        summary.run_id,
                        summary.source_date,
                        summary.series_rows,
                        summary.observation_rows,
                        summary.load.loader,
                        summary.run_dir
                    );
                }
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let url = config
                .database_url
                .context("DATABASE_URL is required for migrate")?;
            PgLoader::connect(&url).await?.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}
