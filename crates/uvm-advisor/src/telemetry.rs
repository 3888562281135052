//! Structured logging setup
//!
//! The advisor emits `tracing` events from every module. Hosts with their
//! own subscriber need nothing from here; standalone hosts and the replay
//! demo call [`init_tracing`] once at startup.
//!
//! `RUST_LOG` picks the filter (default `uvm_advisor=info,warn`) and
//! `UVM_ADVISOR_LOG_FORMAT` picks one of `pretty`, `json` or `compact`.

pub const ENV_LOG_FORMAT: &str = "UVM_ADVISOR_LOG_FORMAT";
pub const ENV_LOG_FILTER: &str = "RUST_LOG";

const DEFAULT_FILTER: &str = "uvm_advisor=info,warn";

/// Log line layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingFormat {
    /// Multi-line, human oriented
    #[default]
    Pretty,
    /// One JSON object per event, for log shippers
    Json,
    /// Single line per event
    Compact,
}

impl TracingFormat {
    /// Unknown names fall back to [`TracingFormat::Pretty`]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => TracingFormat::Json,
            "compact" => TracingFormat::Compact,
            _ => TracingFormat::Pretty,
        }
    }
}

/// Subscriber settings
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub format: TracingFormat,
    /// `EnvFilter` directive, e.g. `uvm_advisor=trace`
    pub filter: String,
    pub with_ansi: bool,
    pub with_thread_ids: bool,
}

impl TracingConfig {
    /// Read settings through `lookup` instead of the process environment
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            format: lookup(ENV_LOG_FORMAT)
                .map(|s| TracingFormat::parse(&s))
                .unwrap_or_default(),
            filter: lookup(ENV_LOG_FILTER).unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            with_ansi: true,
            with_thread_ids: false,
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Install the global subscriber described by `config`
///
/// Fails on a malformed filter directive or when a global subscriber is
/// already set.
#[cfg(feature = "tracing")]
pub fn init_tracing(config: TracingConfig) -> anyhow::Result<()> {
    use anyhow::Context;
    use tracing_subscriber::{
        fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    };

    let filter = EnvFilter::try_new(&config.filter)
        .with_context(|| format!("invalid log filter `{}`", config.filter))?;

    let base = fmt::layer().with_thread_ids(config.with_thread_ids);
    let layer = match config.format {
        TracingFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        TracingFormat::Compact => base.compact().with_ansi(config.with_ansi).boxed(),
        TracingFormat::Json => base.json().with_current_span(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(())
}

/// No-op without the `tracing` feature
#[cfg(not(feature = "tracing"))]
pub fn init_tracing(_config: TracingConfig) -> anyhow::Result<()> {
    Ok(())
}
