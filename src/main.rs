//! flightsync CLI
//!
//! Keeps per-airport flight replicas in sync with upstream and distributes
//! changes and scheduled pushes to subscribers.

use clap::{Parser, Subcommand};
use flightsync::{
    client::AmsClient,
    collector::{Collector, CollectorStats},
    config::{Config, NotificationTransport},
    delivery::PushClient,
    dispatch::ChangeDispatcher,
    events::EventBus,
    ingest::Ingestor,
    profile::ProfileRegistry,
    protocol::{self, ParseError},
    query::QueryEngine,
    scheduler::PushScheduler,
    source::{HttpPollSource, NotificationSource},
    storage::{AirportStore, Repository, RepositoryAccess, SharedRepository},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "flightsync")]
#[command(about = "Airport flight replica with change and scheduled push distribution", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration
    #[arg(short, long, env = "FLIGHTSYNC_CONFIG", default_value = "flightsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every configured airport and serve pushes until Ctrl+C
    Serve {
        /// Seconds between stats log lines
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },

    /// Load and validate the configuration, then print a summary
    CheckConfig,

    /// Decode a notification or bulk response file and print it as JSON
    Parse {
        /// Path to an XML file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve { stats_interval } => {
            let config = Config::load(&cli.config)?;
            serve(config, Duration::from_secs(stats_interval.max(1))).await?;
        }

        Commands::CheckConfig => {
            let config = Config::load(&cli.config)?;
            print_summary(&config);
        }

        Commands::Parse { file } => {
            parse_file(&file)?;
        }
    }

    Ok(())
}

struct AirportRuntime {
    code: String,
    repository: SharedRepository,
    collector: Arc<Collector<AmsClient>>,
    scheduler: PushScheduler,
}

fn notification_source(
    transport: &NotificationTransport,
    token: Option<&str>,
    timeout: Duration,
) -> Result<Option<Box<dyn NotificationSource>>, Box<dyn std::error::Error>> {
    Ok(match transport {
        NotificationTransport::Disabled => None,
        NotificationTransport::HttpPoll { url, poll_interval } => {
            let source = HttpPollSource::new(url.clone(), token, *poll_interval, timeout)?;
            Some(Box::new(source) as Box<dyn NotificationSource>)
        }
    })
}

async fn serve(config: Config, stats_interval: Duration) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting flightsync");
    tracing::info!("Airports: {}", config.airports.len());
    tracing::info!("Users: {}", config.users.len());

    let mut store = AirportStore::new();
    let repositories: Vec<SharedRepository> = config
        .airports
        .iter()
        .map(|a| store.insert(Repository::new(a.code.clone())))
        .collect();
    let store = Arc::new(store);

    let registry = Arc::new(ProfileRegistry::new(config.users.clone()));
    let engine = Arc::new(QueryEngine::new(Arc::clone(&store)).with_policy(config.query));
    let push = PushClient::new(config.dispatch.delivery_timeout)?;

    let (bus, streams) = EventBus::new(config.dispatch.event_buffer);
    let horizon = chrono::Duration::from_std(config.dispatch.staleness_horizon)?;
    let dispatcher = Arc::new(ChangeDispatcher::new(Arc::clone(&registry), push.clone()).with_horizon(horizon));
    let dispatch_handle = tokio::spawn(Arc::clone(&dispatcher).run(streams));

    let mut airports = Vec::new();
    let mut collector_handles = Vec::new();
    for (airport, repository) in config.airports.iter().zip(repositories) {
        let client = AmsClient::new(airport.client_config())?;
        let ingestor = Ingestor::new(repository.clone(), airport.window(), bus.clone());
        let collector = Arc::new(Collector::new(client, ingestor, airport.collector_config()));
        let source = notification_source(
            &airport.notifications,
            airport.token.as_deref(),
            airport.request_timeout,
        )?;

        tracing::info!(
            airport = %airport.code,
            window = ?airport.window(),
            chunk_days = airport.chunk_days,
            "Starting collector"
        );
        collector_handles.push({
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.run(source).await })
        });

        let scheduler = PushScheduler::new(
            airport.code.clone(),
            Arc::clone(&engine),
            push.clone(),
            Arc::clone(&registry),
        );
        let jobs = scheduler.start();
        tracing::info!(airport = %airport.code, jobs, "Push jobs scheduled");

        airports.push(AirportRuntime {
            code: airport.code.clone(),
            repository,
            collector,
            scheduler,
        });
    }
    // Only ingestors hold senders from here on.
    drop(bus);

    // Spawn stats reporting task
    let stats_handle = {
        let reports: Vec<(String, SharedRepository, Arc<CollectorStats>)> = airports
            .iter()
            .map(|a| (a.code.clone(), a.repository.clone(), a.collector.stats()))
            .collect();
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            loop {
                interval.tick().await;
                for (code, repository, stats) in &reports {
                    let s = stats.snapshot();
                    let r = repository.with_read(|repo| repo.stats());
                    tracing::info!(
                        "Stats {}: flights={}, allocations={}, refreshes={}, notifications={}, dropped={}, errors={}",
                        code,
                        r.flights,
                        r.allocations,
                        s.refreshes,
                        s.notifications,
                        s.dropped,
                        s.errors
                    );
                }
                let d = dispatcher.stats();
                tracing::info!(
                    "Dispatch: events={}, pushes={}, stale={}",
                    d.events,
                    d.matched,
                    d.skipped_stale
                );
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down...");

    stats_handle.abort();
    for airport in &airports {
        airport.collector.stop();
        airport.scheduler.cancel_all();
    }
    for handle in collector_handles {
        match handle.await {
            Ok(Err(e)) => tracing::error!("Collector error: {}", e),
            Err(e) => tracing::error!("Collector task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    dispatch_handle.abort();

    tracing::info!("Final statistics:");
    for airport in &airports {
        let s = airport.collector.stats().snapshot();
        let r = airport.repository.with_read(|repo| repo.stats());
        tracing::info!("  {}:", airport.code);
        tracing::info!("    Flights: {}", r.flights);
        tracing::info!("    Resources: {}", r.resources);
        tracing::info!("    Allocations: {}", r.allocations);
        tracing::info!("    Refreshes: {}", s.refreshes);
        tracing::info!("    Notifications: {}", s.notifications);
        tracing::info!("    Dropped: {}", s.dropped);
        tracing::info!("    Evicted: {}", s.evicted);
        tracing::info!("    Errors: {}", s.errors);
    }
    let d = dispatcher.stats();
    tracing::info!("  Change pushes: {} of {} events", d.matched, d.events);

    Ok(())
}

fn print_summary(config: &Config) {
    println!("Configuration OK");
    println!("================");
    for airport in &config.airports {
        let transport = match &airport.notifications {
            NotificationTransport::Disabled => "refresh only".to_string(),
            NotificationTransport::HttpPoll { url, .. } => format!("polling {url}"),
        };
        println!(
            "Airport {}: window {}..{} days, chunks of {} days, refresh every {:?}, {}",
            airport.code,
            airport.window_min_days,
            airport.window_max_days,
            airport.chunk_days,
            airport.refresh_interval,
            transport
        );
    }
    for user in &config.users {
        println!(
            "User {}: {} airports, {} change subscriptions, {} push subscriptions",
            user.name,
            user.allowed_airports.len(),
            user.change_subscriptions.len(),
            user.push_subscriptions.len()
        );
    }
}

fn parse_file(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let xml = std::fs::read_to_string(path)?;

    tracing::info!("Parsing file: {} ({} bytes)", path.display(), xml.len());

    match protocol::parse_notification(&xml) {
        Ok(notification) => {
            println!("Notification: {}", notification.action);
            println!("{}", serde_json::to_string_pretty(&notification.flight)?);
        }
        Err(ParseError::UnknownMessage(_)) => {
            let flights = protocol::parse_flights(&xml)?;
            println!("Flights: {}", flights.len());
            println!("{}", serde_json::to_string_pretty(&flights)?);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
