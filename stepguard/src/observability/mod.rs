//! Logging setup and span helpers.

use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(
    level: &str,
    format: LogFormat,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    build_subscriber(filter, format).try_init()?;
    Ok(())
}

/// Builds the formatting subscriber without installing it.
#[must_use]
pub fn build_subscriber(filter: EnvFilter, format: LogFormat) -> Box<dyn Subscriber + Send + Sync + 'static> {
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match format {
        LogFormat::Pretty => Box::new(builder.finish()),
        LogFormat::Json => Box::new(builder.json().with_current_span(true).finish()),
    }
}

/// Span covering one step of one item.
#[must_use]
pub fn step_span(item_id: &str, step: &str) -> tracing::Span {
    tracing::info_span!("step", item_id = %item_id, step = %step)
}

/// Span covering one item's run.
#[must_use]
pub fn item_span(item_id: &str, job_id: Option<&str>) -> tracing::Span {
    tracing::info_span!("item", item_id = %item_id, job_id = job_id.unwrap_or(""))
}
