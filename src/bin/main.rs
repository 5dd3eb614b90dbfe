use clap::{Parser, Subcommand};
use cricket_stats_agent::{
    agent::Pipeline,
    config::AppConfig,
    llm::build_model,
    seed::seed_collections,
    store::build_store,
    AskRequest,
};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statbot", about = "Ask cricket stats questions from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one question through the pipeline and print every snapshot as a JSON line
    Ask {
        question: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Load the player CSV files into the stats collections
    Seed {
        #[arg(long, default_value = "data")]
        dir: PathBuf,
    },
}

/// Directory to seed before `ask`: only the in-memory store starts empty on every run.
fn preload_dir(config: &AppConfig) -> Option<&Path> {
    match config.database_url {
        Some(_) => None,
        None => config.seed_dir.as_deref(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing (stderr, so stdout stays machine-readable)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    let store = build_store(config.database_url.as_deref());

    match cli.command {
        Command::Ask {
            question,
            user,
            session,
        } => {
            match preload_dir(&config) {
                Some(dir) => {
                    for report in seed_collections(store.as_ref(), dir).await? {
                        info!(?report, "Preloaded");
                    }
                }
                None if config.database_url.is_none() => {
                    warn!("No POSTGRES_URL and no SEED_DIR: the in-memory store is empty, stats questions will find no data");
                }
                None => {}
            }

            let model = build_model(&config.model)?;
            let pipeline = Arc::new(Pipeline::with_context(model, store, config.context.clone()));

            let mut stream = pipeline.stream(AskRequest {
                question: Some(question),
                user_id: user,
                session_id: session,
            });

            let mut failed = false;
            while let Some(snapshot) = stream.next().await {
                failed |= snapshot.is_error();
                println!("{}", serde_json::to_string(&snapshot)?);
            }

            if failed {
                std::process::exit(1);
            }
        }
        Command::Seed { dir } => {
            if config.database_url.is_none() {
                warn!("No POSTGRES_URL set: seeded rows live in memory and are discarded on exit");
            }
            info!("Seeding from {}", dir.display());
            for report in seed_collections(store.as_ref(), &dir).await? {
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }

    Ok(())
}
