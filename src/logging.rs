//! Tracing setup for the `morax` binary.
//!
//! Console output by default, one JSON object per event with `json = true`.
//! `RUST_LOG` replaces the built-in filter entirely.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Debug level for this crate instead of info.
    pub verbose: bool,
}

impl From<&LoggingConfig> for LogConfig {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            json: config.json,
            verbose: config.verbose,
        }
    }
}

/// Filter used when `RUST_LOG` is unset. Dependencies stay at warn so
/// reqwest/hyper connection chatter does not drown out call logs.
pub fn default_directives(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("warn,morax={level}")
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config.verbose)));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(config.verbose))
            .try_init()
    };
    installed.map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}

/// Lets one message through per interval and counts the ones held back.
///
/// ```ignore
/// if let Some(suppressed) = throttle.admit() {
///     tracing::error!(error = %e, suppressed, "failed to accept connection");
/// }
/// ```
pub struct LogThrottle {
    interval: Duration,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// `Some(n)` if this message should be logged, `n` being how many were
    /// dropped since the last one that was.
    pub fn admit(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match state.last {
            Some(last) if now.duration_since(last) < self.interval => {
                state.suppressed += 1;
                None
            }
            _ => {
                state.last = Some(now);
                Some(std::mem::take(&mut state.suppressed))
            }
        }
    }
}
