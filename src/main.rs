use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;

use resilient_client::auth::Credential;
use resilient_client::config::{load_config, ResilienceConfig};
use resilient_client::lifecycle::wait_for_signal;
use resilient_client::observability::{logging::init_logging, metrics::init_metrics};
use resilient_client::subscription::{SubscriptionEvent, SubscriptionRequest};
use resilient_client::AppContext;

#[derive(Parser)]
#[command(name = "resilient-client")]
#[command(about = "Resilient streaming and offline-queue client", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream data frames for a topic to stdout
    Subscribe {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        scope: String,

        /// Subscription document sent in the start frame
        #[arg(long)]
        query: Option<String>,

        /// Seed the session with a refresh token before subscribing
        #[arg(long)]
        refresh_token: Option<String>,
    },
    /// Validate the configuration and print the effective values
    CheckConfig,
    /// Print operations waiting in the offline queue
    Queue,
    /// Forget the stored session
    Logout,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ResilienceConfig::default(),
    };

    if let Commands::CheckConfig = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging(&config.observability);
    tracing::info!("resilient-client v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let ctx = AppContext::new(config)?;

    match cli.command {
        Commands::Subscribe {
            topic,
            scope,
            query,
            refresh_token,
        } => {
            if let Some(token) = refresh_token {
                ctx.tokens
                    .mark_authenticated(Credential {
                        access_token: String::new(),
                        id_token: String::new(),
                        refresh_token: Some(token),
                        expires_at: 0,
                    })
                    .await?;
            }
            ctx.start().await?;
            let result = stream(&ctx, topic, scope, query).await;
            ctx.stop().await;
            result?;
        }
        Commands::Queue => {
            ctx.queue.load().await?;
            for operation in ctx.queue.snapshot() {
                println!("{}", serde_json::to_string(&operation)?);
            }
            let stats = ctx.queue.stats();
            eprintln!(
                "{} queued (high {}, medium {}, low {})",
                stats.total, stats.high, stats.medium, stats.low
            );
        }
        Commands::Logout => {
            ctx.tokens.logout().await?;
            println!("Session cleared");
        }
        Commands::CheckConfig => {}
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn stream(
    ctx: &AppContext,
    topic: String,
    scope: String,
    query: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload = json!({
        "query": query.unwrap_or_default(),
        "variables": { "topic": &topic, "scopeId": &scope },
    });
    let mut handle = ctx
        .connections
        .subscribe(SubscriptionRequest::new(topic, scope, payload))?;

    let signal = wait_for_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => {
                handle.unsubscribe().await;
                return Ok(());
            }
            event = handle.recv() => match event {
                Some(SubscriptionEvent::Data(data)) => println!("{data}"),
                Some(SubscriptionEvent::Error(fault)) => eprintln!("Error: {fault}"),
                Some(SubscriptionEvent::Terminated(reason)) => {
                    eprintln!("Subscription ended: {reason:?}");
                    return Ok(());
                }
                None => return Ok(()),
            },
        }
    }
}
