use std::path::{Path, PathBuf};
use std::sync::Arc;

use adstack_classify::RuleBasedClassifier;
use adstack_core::AdDraft;
use adstack_pipeline::{AdPipeline, PipelineConfig, PipelineSnapshot};
use adstack_salary::StaticRateTable;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "adstack")]
#[command(about = "Job-ad deduplication and enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one batch over a JSON array of ad drafts.
    Run {
        #[arg(long)]
        input: PathBuf,
        /// YAML rate table; without it only the reporting currency converts.
        #[arg(long)]
        rates: Option<PathBuf>,
        /// YAML position-level rules for the offline classifier.
        #[arg(long)]
        levels: Option<PathBuf>,
        /// Snapshot to resume from (if present) and write back after the run.
        #[arg(long)]
        state: Option<PathBuf>,
        /// Where to write the resulting ads, stacks and salary records.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the active vectorization parameters.
    Params,
}

fn read_drafts(path: &Path) -> Result<Vec<AdDraft>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading drafts {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing drafts {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    match cli.command {
        Commands::Params => {
            config.params.validate().context("invalid vectorization parameters")?;
            println!("{}", serde_json::to_string_pretty(&config.params)?);
        }
        Commands::Run {
            input,
            rates,
            levels,
            state,
            output,
        } => {
            let drafts = read_drafts(&input)?;
            let rates = match rates {
                Some(path) => StaticRateTable::load(path)?,
                None => StaticRateTable::new(config.normalizer.reporting_currency),
            };
            let classifier = match levels {
                Some(path) => {
                    let classifier = RuleBasedClassifier::load(path)?;
                    config.classifier.version = classifier.version();
                    classifier
                }
                None => RuleBasedClassifier::default(),
            };

            let previous = match &state {
                Some(path) if path.exists() => Some(PipelineSnapshot::load(path)?),
                _ => None,
            };
            let classifier = Arc::new(classifier);
            let mut pipeline = match previous {
                Some(snapshot) => AdPipeline::from_snapshot(config, rates, classifier, snapshot)?,
                None => AdPipeline::new(config, rates, classifier)?,
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; cancelling batch");
                    on_signal.cancel();
                }
            });

            let summary = pipeline.run_batch(drafts, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            let snapshot = pipeline.snapshot();
            if let Some(path) = &state {
                snapshot.save(path)?;
            }
            if let Some(path) = &output {
                snapshot.save(path)?;
            }
        }
    }

    Ok(())
}
