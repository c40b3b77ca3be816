use std::process;
use std::sync::Arc;

use tracing::{error, info};

use granary::feed::{
    start_updater, FeedFetcher, FeedUpdater, HttpFeedFetcher, RefreshProgress, RefreshService,
};
use granary::{Config, Database};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load_with_env("granary.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load granary.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        process::exit(1);
    }

    // Initialize logging
    if let Err(e) = granary::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        granary::logging::init_console_only(&config.logging.level);
    }

    info!("Granary feed reader");

    if let Err(e) = run(&config).await {
        error!("{}", e);
        process::exit(1);
    }
}

async fn run(config: &Config) -> granary::Result<()> {
    let db = Database::open(&config.database.path).await?;
    let fetcher = Arc::new(HttpFeedFetcher::new(&config.refresh)?);

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("watch") {
        return watch(db, fetcher, config).await;
    }

    let service =
        RefreshService::new(&db, fetcher).with_concurrency(config.refresh.max_concurrent_fetches);

    if args.is_empty() {
        refresh_all_with_progress(&service).await
    } else {
        for url in &args {
            let feed = service.retrieve_or_refresh(url).await?;
            if feed.is_stored() {
                println!("{}  {}", feed.title, feed.url);
            } else {
                println!("(not fetched)  {}", feed.url);
            }
        }
        Ok(())
    }
}

/// Refresh every subscription, printing one line per settled feed.
async fn refresh_all_with_progress(service: &RefreshService<'_>) -> granary::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<RefreshProgress>();

    let printer = tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            match report.feed {
                Some(feed) => {
                    let name = if feed.title.is_empty() {
                        feed.url
                    } else {
                        feed.title
                    };
                    println!("[{}/{}] {}", report.completed, report.total, name);
                }
                None => println!(
                    "Refreshed {} feed(s), {} failed",
                    report.total, report.failed
                ),
            }
        }
    });

    let result = service.refresh_all(Some(tx)).await;
    let _ = printer.await;
    let outcome = result?;

    println!(
        "{} new article(s), {} updated",
        outcome.articles_added, outcome.articles_updated
    );

    Ok(())
}

/// Run the periodic updater until interrupted.
async fn watch(db: Database, fetcher: Arc<dyn FeedFetcher>, config: &Config) -> granary::Result<()> {
    let updater = FeedUpdater::new(Arc::new(db), fetcher)
        .with_interval(config.refresh.update_interval_secs)
        .with_concurrency(config.refresh.max_concurrent_fetches);
    let handle = start_updater(updater);

    info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    handle.stop().await;
    Ok(())
}
