use std::error::Error as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::models::{ProbeResult, Target};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Checks one target. Never fails: every failure is a down result.
pub trait Probe: Send + Sync + 'static {
    fn execute(&self, target: &Arc<Target>) -> impl Future<Output = ProbeResult> + Send;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(PROBE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("uptime-monitor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Probe for HttpProbe {
    async fn execute(&self, target: &Arc<Target>) -> ProbeResult {
        let start = std::time::Instant::now();
        match self.client.get(target.url.clone()).send().await {
            Ok(resp) => {
                let status = resp.status();
                debug!(url = %target.url, %status, elapsed_ms = start.elapsed().as_millis() as u64, "probe answered");
                if status.as_u16() >= 400 {
                    ProbeResult::down(
                        target.clone(),
                        &format!(
                            "non-successful response {} {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("")
                        ),
                    )
                } else {
                    ProbeResult::up(target.clone())
                }
            }
            Err(e) => {
                debug!(url = %target.url, error = %e, "probe failed");
                ProbeResult::down(target.clone(), &error_chain(&e))
            }
        }
    }
}

/// Joins an error and its sources with ": " so the deepest cause ends up
/// as the last segment.
fn error_chain(err: &reqwest::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
