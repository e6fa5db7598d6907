//! Structured logging via `tracing`.
//!
//! Archive work runs inside a `run` span (`run_id`) and one `item` span per
//! file (`remote_id`, `name`). Both output formats carry those fields, so
//! every line can be traced back to the file it concerns.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line instead of human-readable text
    pub json: bool,
    /// darc at DEBUG, and a closing line with timings for each item span
    pub verbose: bool,
}

/// Install the global subscriber. `RUST_LOG` replaces the default filter.
///
/// Logs go to stderr so that command output on stdout stays parseable.
/// Dependencies (HTTP client, SQLite) are held at WARN unless `RUST_LOG`
/// says otherwise.
pub fn init(config: LogConfig) {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,darc={}", level.as_str().to_lowercase()))
    });

    let span_events = if config.verbose {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events)
                    // run_id and remote_id both, not only the innermost span
                    .with_span_list(true)
                    .with_current_span(false)
                    .with_target(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events)
                    .with_target(false),
            )
            .init();
    }
}

/// Rate limiter for per-file download progress lines.
///
/// Each file has its own window, so one fast download cannot starve the
/// progress lines of the others running beside it.
pub struct ProgressThrottle {
    interval: Duration,
    last_logged: HashMap<String, Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: HashMap::new(),
        }
    }

    /// True if `remote_id` has not been logged within the interval.
    pub fn should_log(&mut self, remote_id: &str) -> bool {
        let now = Instant::now();
        match self.last_logged.get_mut(remote_id) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                self.last_logged.insert(remote_id.to_string(), now);
                true
            }
        }
    }

    /// Drop the window of a file that has finished.
    pub fn finish(&mut self, remote_id: &str) {
        self.last_logged.remove(remote_id);
    }
}
