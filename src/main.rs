use anyhow::Context;
use clap::Parser;
use entity_monitor::retry::{RetryConfigBuilder, RetryingFetcher};
use entity_monitor::{
	start, ChangeNotification, ItemFetchScope, MemoryStore, MonitorConfig, WatchConfiguration,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "monitor-replay")]
#[command(
	about = "Replays recorded change notifications against a store snapshot and prints the resulting events"
)]
struct Cli {
	/// Store snapshot (JSON) to fetch items and collections from
	#[arg(short, long)]
	store: PathBuf,

	/// Notifications to replay, one JSON object per line
	#[arg(short, long)]
	notifications: PathBuf,

	/// Watch configuration (JSON). Defaults to monitoring everything.
	#[arg(short, long)]
	watch: Option<PathBuf>,

	/// Enable verbose logging
	#[arg(short, long)]
	verbose: bool,

	/// Maximum number of notifications in flight
	#[arg(short, long, default_value_t = 5)]
	depth: usize,

	/// Simulated latency of every fetch in milliseconds
	#[arg(short, long, default_value_t = 0)]
	latency: u64,

	/// Fetch timeout in milliseconds, 0 disables it
	#[arg(short, long, default_value_t = 30_000)]
	timeout: u64,

	/// Fetch full items along with the notifications
	#[arg(long)]
	fetch_items: bool,

	/// Fetch collection statistics instead of announcing placeholders
	#[arg(long)]
	fetch_statistics: bool,

	/// Delay for batching statistics refreshes in milliseconds
	#[arg(long, default_value_t = 500)]
	statistics_delay: u64,

	/// Retries for failed fetches, with exponential backoff starting at 100ms
	#[arg(long, default_value_t = 0)]
	retries: u32,

	/// Collections to reference before replaying; enables reference tracking
	#[arg(short, long, value_delimiter = ',')]
	reference: Vec<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	// Logs go to stderr, events to stdout
	let level = if cli.verbose {
		Level::DEBUG
	} else {
		Level::INFO
	};
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_writer(std::io::stderr)
		.init();

	let store = MemoryStore::from_json_file(&cli.store)
		.with_context(|| format!("loading store snapshot {:?}", cli.store))?
		.with_default_latency(Duration::from_millis(cli.latency));
	let watch = match &cli.watch {
		Some(path) => WatchConfiguration::from_file(path)
			.with_context(|| format!("loading watch configuration {path:?}"))?,
		None => WatchConfiguration::new().monitor_all(true),
	};

	let statistics_delay = Duration::from_millis(cli.statistics_delay);
	let config = MonitorConfig {
		pipeline_depth: cli.depth,
		item_cache_capacity: cli.depth.max(50),
		collection_cache_capacity: cli.depth.max(50),
		fetch_timeout: (cli.timeout > 0).then(|| Duration::from_millis(cli.timeout)),
		item_fetch_scope: if cli.fetch_items { ItemFetchScope::full() } else { ItemFetchScope::default() },
		fetch_statistics: cli.fetch_statistics,
		statistics_delay,
		reference_tracking: !cli.reference.is_empty(),
		..MonitorConfig::default()
	};

	let contents = tokio::fs::read_to_string(&cli.notifications)
		.await
		.with_context(|| format!("reading notifications {:?}", cli.notifications))?;

	let store = RetryingFetcher::new(store, RetryConfigBuilder::new().max_retries(cli.retries).build());
	let (handle, mut events) = start(config, watch, Arc::new(store))?;
	for collection in &cli.reference {
		handle.ref_collection(*collection)?;
	}

	let printer = tokio::spawn(async move {
		let mut printed = 0usize;
		while let Some(event) = events.recv().await {
			match event.to_json() {
				Ok(json) => println!("{json}"),
				Err(e) => warn!("Failed to serialize event: {}", e),
			}
			printed += 1;
		}
		printed
	});

	let mut replayed = 0usize;
	for (index, line) in contents.lines().enumerate() {
		if line.trim().is_empty() {
			continue;
		}
		let notification: ChangeNotification = serde_json::from_str(line)
			.with_context(|| format!("parsing notification on line {}", index + 1))?;
		handle.notify(notification)?;
		replayed += 1;
	}
	info!("Replaying {} notifications", replayed);

	tokio::select! {
		result = drain(&handle) => result?,
		_ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down..."),
	}
	// let the last statistics batch fire
	tokio::time::sleep(statistics_delay + Duration::from_millis(50)).await;

	let stats = handle.stats().await?;
	handle.stop().await?;
	let printed = printer.await?;

	info!(
		"Done: {} received, {} accepted, {} events, {} dropped ({} after failed fetches)",
		stats.received, stats.accepted, printed, stats.dropped, stats.dropped_failed
	);
	Ok(())
}

/// Wait until nothing is queued anymore
async fn drain(handle: &entity_monitor::MonitorHandle) -> anyhow::Result<()> {
	loop {
		let stats = handle.stats().await?;
		if stats.queued() == 0 {
			return Ok(());
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}
