//! Crosspost: multi-website submission poster.
//!
//! Main binary with subcommands:
//! - `run`: post every pending submission, honoring per-website rate
//!   limits and dependency ordering
//! - `check`: validate the website registry and pending submissions
//!   without posting

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod daemon;
mod notifier;
mod poster;
mod store;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "crosspost")]
#[command(about = "Multi-website submission poster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Post every pending submission
    Run {
        /// Website registry file (JSON)
        #[arg(long, env = "CROSSPOST_WEBSITES", default_value = "websites.json")]
        websites: String,

        /// Pending submissions file (JSON)
        #[arg(long, env = "CROSSPOST_SUBMISSIONS", default_value = "submissions.json")]
        submissions: String,

        /// Last-post-time store file (JSON)
        #[arg(long, env = "CROSSPOST_POST_TIMES", default_value = "post-times.json")]
        post_times: String,

        /// Wait this many minutes between posts instead of each website's
        /// own interval (0 disables the override)
        #[arg(long, env = "CROSSPOST_POST_INTERVAL", default_value = "0")]
        post_interval_minutes: u64,

        /// Cancel everything queued after a submission that fails
        #[arg(long, env = "CROSSPOST_CLEAR_QUEUE_ON_FAILURE", value_parser = parse_bool_env, default_value = "false")]
        clear_queue_on_failure: bool,

        /// Exit once the queue drains
        #[arg(long, env = "CROSSPOST_AUTO_CLOSE", value_parser = parse_bool_env, default_value = "true")]
        auto_close: bool,
    },

    /// Validate config files without posting
    Check {
        /// Website registry file (JSON)
        #[arg(long, env = "CROSSPOST_WEBSITES", default_value = "websites.json")]
        websites: String,

        /// Pending submissions file (JSON)
        #[arg(long, env = "CROSSPOST_SUBMISSIONS", default_value = "submissions.json")]
        submissions: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("CROSSPOST_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "crosspost=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            websites,
            submissions,
            post_times,
            post_interval_minutes,
            clear_queue_on_failure,
            auto_close,
        } => {
            daemon::run(daemon::DaemonConfig {
                websites_path: websites,
                submissions_path: submissions,
                post_times_path: post_times,
                post_interval_minutes,
                clear_queue_on_failure,
                auto_close,
            })
            .await
        }
        Commands::Check {
            websites,
            submissions,
        } => daemon::check(&websites, &submissions).await,
    }
}
