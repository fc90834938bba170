use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::utils::parse_duration;

const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "uptime-monitor", version, about = "Periodic HTTP healthchecks with Slack notifications")]
pub struct Cli {
    /// Data directory holding config.yaml and state.json.
    #[arg(short = 'd', long, env = "VAR_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Healthcheck config file (defaults to <data-dir>/config.yaml).
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Address for the liveness endpoint.
    #[arg(short = 'e', long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:5000")]
    pub listen: SocketAddr,

    /// Slack access token.
    #[arg(short = 't', long, env = "SLACK_TOKEN", hide_env_values = true)]
    pub slack_token: String,

    /// Username shown on Slack messages.
    #[arg(short = 'u', long, env = "SLACK_USERNAME", default_value = "UptimeMonitor")]
    pub slack_username: String,

    /// Period between two check cycles, e.g. "30s" or "5m".
    #[arg(short = 'p', long, default_value = "1m", value_parser = parse_period)]
    pub period: Duration,

    /// Upper bound on probes running at once.
    #[arg(long, default_value_t = 64)]
    pub max_concurrency: usize,
}

fn parse_period(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration {s:?}"))
}

/// Process settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub listen: SocketAddr,
    pub slack_token: String,
    pub slack_username: String,
    pub period: Duration,
    pub max_concurrency: usize,
}

impl Cli {
    /// Fills in derived paths and creates the data directory.
    pub fn resolve(self) -> Result<Settings> {
        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .context("unable to determine working directory")?
                .join("var"),
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("unable to create data directory {}", data_dir.display()))?;

        let period = if self.period <= Duration::from_secs(1) {
            warn!(requested = ?self.period, "period too short, using {:?}", DEFAULT_PERIOD);
            DEFAULT_PERIOD
        } else {
            self.period
        };

        if self.slack_token.trim().is_empty() {
            anyhow::bail!("Slack access token is not set");
        }

        Ok(Settings {
            config_path: self.config.unwrap_or_else(|| data_dir.join("config.yaml")),
            state_path: data_dir.join("state.json"),
            data_dir,
            listen: self.listen,
            slack_token: self.slack_token,
            slack_username: self.slack_username,
            period,
            max_concurrency: self.max_concurrency,
        })
    }
}
