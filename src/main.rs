use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use sen2_prep::config::{pipeline_config_toml, PipelineConfig};
use sen2_prep::element84::EarthSearchCatalog;
use sen2_prep::marker::SceneMarker;
use sen2_prep::pipeline;

#[derive(Parser)]
#[command(name = "sen2-prep")]
#[command(author, version, about = "Download and preprocess Sentinel-2 scenes", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = "sen2-prep.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the download and preprocessing pipeline once
    Run,
    /// Write a starter configuration file
    Template {
        /// Where to write it
        #[arg(default_value = "sen2-prep.toml")]
        path: PathBuf,
    },
    /// Print the acquisition date of the last processed scene
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = read_config(&cli.config)?;
            let catalog = EarthSearchCatalog::from_config(&config);
            let summary = pipeline::run(&config, &catalog).await?;
            log::info!("run finished: {:?}", summary.outcome);
        }
        Commands::Template { path } => {
            let config = PipelineConfig::from_template(&pipeline_config_toml());
            config.write(&path)?;
            println!("wrote starter config to {}", path.display());
        }
        Commands::Status => {
            let config = read_config(&cli.config)?;
            match SceneMarker::new(config.marker_path()).read()? {
                Some(date) => println!("last processed acquisition date: {date}"),
                None => println!("no acquisition processed yet"),
            }
        }
    }

    Ok(())
}

fn read_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::read(path).with_context(|| format!("reading config {}", path.display()))
}
