//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use manuscript_monitor::network::constants::DEFAULT_MAX_ATTEMPTS;

/// Inspect manuscript download monitoring and fetch through the resilience layer.
///
/// Shows the effective per-library monitoring config, evaluates the
/// continue/split/abort policy, and fetches URLs with circuit breaking,
/// retries, and progress tracking.
#[derive(Parser, Debug)]
#[command(name = "manuscript-monitor")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// JSON file of per-library config overrides
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the effective monitoring config for a library
    Config {
        /// Library name (e.g. gallica, internet_culturale)
        library: String,

        /// Manuscript page count, for the page-count multiplier and timeout
        #[arg(short, long, default_value_t = 1)]
        pages: u32,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Evaluate the continue/split/abort policy for a running download
    Recommend {
        /// Library name
        library: String,

        /// Total pages in the manuscript
        #[arg(short, long)]
        pages: u32,

        /// Pages downloaded so far
        #[arg(long, default_value_t = 0)]
        progress: u32,

        /// Average speed in pages per minute
        #[arg(long, default_value_t = 0.0)]
        speed: f64,

        /// Estimated minutes remaining (omit if unknown)
        #[arg(long)]
        eta: Option<f64>,
    },

    /// Fetch URLs through the resilience layer while tracking progress
    Fetch {
        /// URLs to fetch, in order
        #[arg(required = true)]
        urls: Vec<String>,

        /// Library the URLs belong to
        #[arg(short, long, default_value = "default")]
        library: String,

        /// Maximum attempts per URL (1-10)
        #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_ATTEMPTS as u8, value_parser = clap::value_parser!(u8).range(1..=10))]
        max_attempts: u8,

        /// Minimum delay between requests to the same host in milliseconds (max 60000)
        #[arg(short = 'l', long, default_value_t = 0, value_parser = clap::value_parser!(u64).range(0..=60000))]
        rate_limit: u64,

        /// Print the network health summary after fetching
        #[arg(long)]
        health: bool,
    },
}
