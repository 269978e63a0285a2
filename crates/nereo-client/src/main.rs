//! Nereo sync daemon.
//!
//! Keeps one tenant's dashboard queries in step with the backend: loads them,
//! subscribes to the push streams, refetches whatever push events invalidate
//! and polls while a stream is in fallback mode.
//!
//! # Usage
//!
//! ```bash
//! # Both topics of one tenant against a local backend
//! nereo-sync --tenant tenant-1
//!
//! # Kiosk view of one branch
//! nereo-sync --base-url https://api.example.com --tenant tenant-1 --branch b-1 --topic bookings
//! ```

use clap::Parser;
use futures::future::select_all;
use nereo_client::{ClientConfig, SyncClient};
use nereo_core::{Scope, Subscription, keys};
use nereo_proto::{Topic, paths};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Nereo real-time cache sync
#[derive(Parser, Debug)]
#[command(name = "nereo-sync")]
#[command(about = "Keeps Nereo dashboard data in sync over server-sent events")]
#[command(version)]
struct Args {
    /// Backend base URL (defaults to NEREO_API_URL, then http://localhost:8080)
    #[arg(long)]
    base_url: Option<String>,

    /// Tenant to follow
    #[arg(long)]
    tenant: String,

    /// Branch to follow
    #[arg(long)]
    branch: Option<String>,

    /// Topics to subscribe to (repeatable)
    #[arg(long = "topic", default_values = ["bookings", "analytics"])]
    topics: Vec<Topic>,

    /// Bearer token (defaults to NEREO_API_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = ClientConfig::from_env();
    if let Some(base_url) = &args.base_url {
        config = config.with_base_url(base_url.as_str());
    }
    if let Some(token) = &args.token {
        config = config.with_bearer_token(token.as_str());
    }

    tracing::info!("Nereo sync starting");
    tracing::info!("Backend: {}", config.base_url);

    let client = SyncClient::new(config)?;
    let mut scope = Scope::tenant(args.tenant.as_str());
    if let Some(branch) = &args.branch {
        scope = scope.with_branch(branch.as_str());
    }
    let branch = scope.branch_id.as_deref();

    let mut queries = vec![(
        keys::subscriber_list(&scope.tenant_id, branch),
        paths::subscriber_list(branch),
    )];
    for topic in &args.topics {
        match topic {
            Topic::Analytics => {
                queries.push((keys::kpis(&scope.tenant_id), paths::analytics_kpis(branch)));
            },
            Topic::Bookings => queries.push((
                keys::booking_board(&scope.tenant_id, branch),
                paths::bookings_today(&scope.tenant_id, branch),
            )),
        }
    }

    for (key, path) in queries {
        if let Err(e) = client.fetch(key.clone(), &path).await {
            tracing::warn!(%key, "initial load failed: {}", e);
        }
    }

    let mut invalidations = client.invalidations();
    let mut handles = Vec::new();
    for topic in &args.topics {
        handles.push(client.subscribe(Subscription::new(*topic, scope.clone())).await);
    }
    let mut statuses: Vec<_> = handles.iter().map(|h| h.watch_status()).collect();
    if statuses.is_empty() {
        tracing::warn!("No topics to follow");
        return Ok(());
    }

    loop {
        let poll_every = handles
            .iter()
            .map(|h| h.status().polling_interval)
            .filter(|interval| !interval.is_zero())
            .min();
        let poll = async {
            match poll_every {
                Some(interval) => tokio::time::sleep(interval).await,
                None => std::future::pending::<()>().await,
            }
        };
        let status_change = select_all(statuses.iter_mut().map(|s| Box::pin(s.changed())));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            },
            received = invalidations.recv() => match received {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    let refreshed = client.refetch_stale().await;
                    tracing::info!("Refetched {} invalidated queries", refreshed.len());
                },
                Err(RecvError::Closed) => break,
            },
            () = poll => {
                let refreshed = client.refetch_all().await;
                tracing::info!("Fallback poll refreshed {} queries", refreshed.len());
            },
            _ = status_change => {
                for handle in &handles {
                    let status = handle.status();
                    tracing::info!(
                        "{}: {} (retries: {}, polling every {:?})",
                        handle.key(),
                        status.state,
                        status.retry_count,
                        status.polling_interval
                    );
                }
            },
        }
    }

    client.close_all().await;
    Ok(())
}
