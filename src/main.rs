use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use newsreel::app::Newsreel;
use newsreel::config::Config;
use newsreel::types::SourceTier;

#[derive(Parser)]
#[command(name = "newsreel", about = "Multi-source news aggregation and breaking-news detection")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the poller, clustering, summarizer, and monitor loops.
    Serve,
    /// Applies the document store schema and exits.
    Migrate,
    /// Registers a feed to be polled.
    AddFeed {
        url: String,
        #[arg(long, value_enum, default_value = "tier2")]
        tier: CliTier,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        language: Option<String>,
    },
    /// Prints feed and cluster counts.
    Stats,
}

#[derive(Clone, clap::ValueEnum)]
enum CliTier {
    Tier1,
    Tier2,
}

impl From<CliTier> for SourceTier {
    fn from(value: CliTier) -> Self {
        match value {
            CliTier::Tier1 => SourceTier::Tier1,
            CliTier::Tier2 => SourceTier::Tier2,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Migrate => {
            info!("applying document store schema");
            let _ = Newsreel::connect(config).await?;
            info!("schema up to date");
        }
        Command::AddFeed { url, tier, category, language } => {
            let app = Newsreel::connect(config).await?;
            let feed_id = app.add_feed(url.clone(), tier.into(), category, language).await?;
            info!(%feed_id, url, "feed added");
        }
        Command::Stats => {
            let app = Newsreel::connect(config).await?;
            match app.stats().await {
                Ok(stats) => {
                    info!(feeds = stats.feed_count, breaking = stats.breaking_cluster_count, "newsreel stats");
                }
                Err(e) => error!(error = %e, "failed to read stats"),
            }
        }
        Command::Serve => {
            let app = Arc::new(Newsreel::connect(config).await?);
            let app = if let Ok(webhook) = std::env::var("NOTIFY_WEBHOOK_URL") {
                Arc::try_unwrap(app).map(|a| Arc::new(a.with_webhook_notifier(webhook))).unwrap_or_else(|a| a)
            } else {
                app
            };
            app.serve().await?;
        }
    }

    Ok(())
}
