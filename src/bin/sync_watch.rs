//! Watch games live
//!
//! ```text
//! SYNC_TOKEN=... sync-watch sync.yaml 42 43
//! ```
//!
//! Connects, loads and subscribes to every game given on the command line,
//! then prints each engine event until interrupted. Log verbosity follows
//! `RUST_LOG` (default `info`).

use anyhow::{Context, bail};
use realtime::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(config_path) = args.next() else {
        bail!("usage: sync-watch <config.yaml> <game_id>...");
    };
    let game_ids = args
        .map(|arg| {
            arg.parse::<EntityId>()
                .with_context(|| format!("invalid game id '{}'", arg))
        })
        .collect::<Result<Vec<_>>>()?;
    if game_ids.is_empty() {
        bail!("no game ids given");
    }

    let config = SyncConfig::from_yaml_file(&config_path)?;
    let mut builder = SyncClient::builder().with_config(config);
    if let Ok(token) = std::env::var("SYNC_TOKEN") {
        builder = builder.with_bearer_token(token);
    }
    let client = builder.build()?;

    println!("👀 Watching {} game(s)", game_ids.len());
    let mut events = client.events().subscribe();

    let mut subscriptions = Vec::new();
    for &game_id in &game_ids {
        match client.load(game_id).await {
            Ok(entry) => println!("   - game {} at version {}", game_id, entry.version),
            Err(e) => println!("   - game {} not loaded yet: {}", game_id, e),
        }
        subscriptions.push(client.subscribe(game_id));
    }
    client.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = events.recv() => match received {
                Ok(envelope) => print_event(&envelope.event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    println!("⚠️  missed {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    println!("👋 Shutting down");
    drop(subscriptions);
    client.shutdown();
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::ConnectionChanged { status, attempt } if *attempt > 0 => {
            println!("🔌 {} (attempt {})", status, attempt)
        }
        SyncEvent::ConnectionChanged { status, .. } => println!("🔌 {}", status),
        SyncEvent::EntityUpdated {
            entity_id,
            version,
            provenance,
        } => println!("📦 game {} → v{} ({})", entity_id, version, provenance.label()),
        SyncEvent::EntityRolledBack { entity_id, version } => {
            println!("↩️  game {} rolled back to v{}", entity_id, version)
        }
        SyncEvent::TurnStarted { entity_id, source } => {
            println!("🎯 your turn in game {} ({:?})", entity_id, source)
        }
        SyncEvent::WaitInvalidated { entity_id } => println!("⏰ wait invalidated ({:?})", entity_id),
        SyncEvent::ServerError { code, message } => println!("❌ server error {}: {}", code, message),
        SyncEvent::SyncErrorChanged { error: Some(error) } => println!("⚠️  {}", error),
        SyncEvent::SyncErrorChanged { error: None } => println!("✅ sync error cleared"),
    }
}
