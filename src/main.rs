//! CLI entry point for the manuscript monitor tool.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use manuscript_monitor::network::{NetworkResilience, RequestContext, RetryPolicy};
use manuscript_monitor::progress::{
    DownloadOptions, EnhancedProgress, ManuscriptDownloader, MonitoredDownloadOptions,
    ProgressTick,
};
use manuscript_monitor::{
    MonitorEvent, MonitorEventKind, MonitoringConfig, ProgressIntegration, ProgressMonitor,
};
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs on stderr keep stdout clean for command output.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = Arc::new(MonitoringConfig::new());
    if let Some(path) = &args.config {
        let installed = config
            .load_overrides_from_file(path)
            .with_context(|| format!("failed to load config overrides from {}", path.display()))?;
        info!(installed, path = %path.display(), "config overrides loaded");
    }

    match args.command {
        Command::Config {
            library,
            pages,
            json,
        } => show_config(&config, &library, pages, json),
        Command::Recommend {
            library,
            pages,
            progress,
            speed,
            eta,
        } => {
            recommend(&config, &library, pages, progress, speed, eta);
            Ok(())
        }
        Command::Fetch {
            urls,
            library,
            max_attempts,
            rate_limit,
            health,
        } => {
            let network = NetworkResilience::builder(Arc::clone(&config))
                .retry_policy(RetryPolicy::with_max_attempts(u32::from(max_attempts)))
                .min_request_interval(Duration::from_millis(rate_limit))
                .build();
            fetch(config, &network, &urls, &library, args.quiet).await?;
            if health {
                println!("{}", serde_json::to_string_pretty(&network.health_snapshot())?);
            }
            Ok(())
        }
    }
}

fn show_config(config: &MonitoringConfig, library: &str, pages: u32, json: bool) -> Result<()> {
    let generated = config.generate_monitoring_config(library, pages);
    if json {
        println!("{}", serde_json::to_string_pretty(&generated)?);
        return Ok(());
    }

    let c = &generated.config;
    println!("library: {}", generated.library);
    println!("base_timeout_minutes: {}", c.base_timeout_minutes);
    println!("timeout_multiplier: {}", c.timeout_multiplier);
    println!("slow_progress_threshold: {}", c.slow_progress_threshold);
    println!("stuck_threshold_minutes: {}", c.stuck_threshold_minutes);
    println!("auto_split_threshold_pages: {}", c.auto_split_threshold_pages);
    println!("page_count_multiplier: {}", generated.page_count_multiplier);
    println!(
        "effective_timeout_minutes: {:.1}",
        generated.effective_timeout.as_secs_f64() / 60.0
    );
    Ok(())
}

fn recommend(
    config: &MonitoringConfig,
    library: &str,
    pages: u32,
    progress: u32,
    speed: f64,
    eta: Option<f64>,
) {
    let recommendation = config.get_download_recommendation(library, pages, progress, speed, eta);
    println!("{}: {}", recommendation.action.as_str(), recommendation.reason);
    if recommendation.slow_warning {
        println!("warning: progress is below the slow threshold for {library}");
    }
}

/// Fetches a batch of URLs in order, reporting one page per successful fetch.
struct BatchFetcher<'a> {
    network: &'a NetworkResilience,
    urls: &'a [String],
    ctx: RequestContext,
    bar: ProgressBar,
}

#[async_trait]
impl<'a> ManuscriptDownloader for BatchFetcher<'a> {
    type Output = u32;
    type Error = anyhow::Error;

    async fn download_manuscript(&self, _url: &str, options: DownloadOptions) -> Result<u32> {
        let total = u32::try_from(self.urls.len()).context("too many URLs")?;
        let mut fetched = 0_u32;
        for url in self.urls {
            self.bar.set_message(url.clone());
            match self.network.fetch_bytes(url, &self.ctx).await {
                Ok(body) => {
                    fetched += 1;
                    info!(url = %url, bytes = body.len(), "fetched");
                    if let Some(on_progress) = &options.on_progress {
                        on_progress(ProgressTick::new(fetched, total, "downloading"));
                    }
                }
                Err(error) => {
                    warn!(url = %url, error = %error, "fetch failed");
                    self.bar.suspend(|| {
                        eprintln!("{url}: {}", error.user_message());
                        eprintln!("  {}", error.suggested_action());
                    });
                }
            }
            self.bar.inc(1);
        }
        self.bar.finish_and_clear();

        println!("fetched {fetched} of {total} URLs");
        if fetched < total {
            anyhow::bail!("{} of {total} URLs failed", total - fetched);
        }
        Ok(fetched)
    }
}

async fn fetch(
    config: Arc<MonitoringConfig>,
    network: &NetworkResilience,
    urls: &[String],
    library: &str,
    quiet: bool,
) -> Result<()> {
    let first = urls.first().context("no URLs to fetch")?;
    let total = u32::try_from(urls.len()).context("too many URLs")?;

    let integration = ProgressIntegration::new(ProgressMonitor::new(config));
    let monitor = integration.monitor();
    monitor.on(
        MonitorEventKind::StuckDetected,
        Arc::new(|event: &MonitorEvent| {
            if let MonitorEvent::StuckDetected { stalled_for, .. } = event {
                warn!(stalled_secs = stalled_for.as_secs(), "no progress, download looks stuck");
            }
        }),
    );
    monitor.on(
        MonitorEventKind::Timeout,
        Arc::new(|event: &MonitorEvent| {
            if let MonitorEvent::Timeout { elapsed, .. } = event {
                warn!(elapsed_secs = elapsed.as_secs(), "download exceeded its timeout");
            }
        }),
    );

    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(u64::from(total));
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {prefix} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    };

    let status_bar = bar.clone();
    let options = MonitoredDownloadOptions {
        on_progress: Some(Arc::new(move |progress: EnhancedProgress| {
            let eta = progress
                .estimated_time_remaining
                .map_or_else(|| "eta ?".to_string(), |minutes| format!("eta {minutes:.1}m"));
            let flag = if progress.is_stuck {
                " stuck"
            } else if progress.is_slow {
                " slow"
            } else {
                ""
            };
            status_bar.set_prefix(format!("{:.1} p/min {eta}{flag}", progress.average_speed));
        })),
        ..MonitoredDownloadOptions::default()
    };

    let fetcher = BatchFetcher {
        network,
        urls,
        ctx: RequestContext::for_library(library, total),
        bar,
    };
    let result = integration
        .wrap_download_manuscript(&fetcher, first, library, total, options)
        .await;
    monitor.shutdown();
    result.map(|_| ())
}
