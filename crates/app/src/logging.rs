//! Tracing subscriber setup.
//!
//! [`init`] installs a registry with a reloadable [`EnvFilter`] and a text or
//! JSON fmt layer. [`init_with_handle`] also returns a [`LogLevelHandle`], which
//! changes the global level or the level of one PAP crate while running.
//!
//! Crate targets that accept their own level:
//!
//! | Target | Contents |
//! |--------|----------|
//! | `pap_comm` | dispatch, timers, heartbeats |
//! | `pap_notification` | deployment ledger |
//! | `pap_common` | model, stores |
//! | `pap_app` | lifecycle |

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::LoggingConfig;

/// Crates whose level can be set individually.
pub const LOG_TARGETS: &[&str] = &["pap_comm", "pap_notification", "pap_common", "pap_app"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Text format only.
    pub ansi_colors: bool,
    pub with_source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            ansi_colors: true,
            with_source_location: false,
        }
    }
}

impl LogConfig {
    /// Maps the `[logging]` section. Unknown levels fall back to INFO.
    pub fn from_settings(settings: &LoggingConfig) -> Self {
        let format = if settings.format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        };
        Self {
            level: parse_level(&settings.level).unwrap_or(Level::INFO),
            format,
            ansi_colors: settings.colors && format == LogFormat::Text,
            with_source_location: format == LogFormat::Json,
        }
    }
}

fn parse_level(level: &str) -> anyhow::Result<Level> {
    let level = if level.eq_ignore_ascii_case("warning") {
        "warn"
    } else {
        level
    };
    level
        .parse::<Level>()
        .map_err(|_| anyhow::anyhow!("invalid log level: {level}"))
}

#[derive(Debug)]
struct Levels {
    global: Level,
    overrides: BTreeMap<&'static str, Level>,
}

impl Levels {
    fn filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::new(self.global.as_str());
        for (target, level) in &self.overrides {
            let level = level.as_str().to_lowercase();
            filter = filter.add_directive(format!("{target}={level}").parse()?);
        }
        Ok(filter)
    }
}

/// Changes levels of the installed subscriber.
#[derive(Clone)]
pub struct LogLevelHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    levels: Arc<Mutex<Levels>>,
}

impl LogLevelHandle {
    /// Sets the global level and clears every per-crate override.
    pub fn set_level(&self, level: &str) -> anyhow::Result<()> {
        let level = parse_level(level)?;
        let mut levels = self.levels.lock();
        levels.global = level;
        levels.overrides.clear();
        self.reload.reload(levels.filter()?)?;
        Ok(())
    }

    /// Sets the level of one crate in [`LOG_TARGETS`].
    pub fn set_target_level(&self, target: &str, level: &str) -> anyhow::Result<()> {
        let level = parse_level(level)?;
        let target = LOG_TARGETS
            .iter()
            .copied()
            .find(|known| *known == target)
            .ok_or_else(|| anyhow::anyhow!("unknown log target: {target}"))?;

        let mut levels = self.levels.lock();
        levels.overrides.insert(target, level);
        self.reload.reload(levels.filter()?)?;
        tracing::debug!(target_crate = target, %level, "log level changed");
        Ok(())
    }

    /// The global level.
    pub fn level(&self) -> Level {
        self.levels.lock().global
    }

    /// Effective level of one crate.
    pub fn target_level(&self, target: &str) -> Level {
        let levels = self.levels.lock();
        levels.overrides.get(target).copied().unwrap_or(levels.global)
    }
}

/// Installs the global subscriber.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    init_with_handle(config).map(drop)
}

/// Installs the global subscriber and returns a handle to adjust it.
///
/// `RUST_LOG`, when set, replaces the configured level until the first
/// change made through the handle.
pub fn init_with_handle(config: &LogConfig) -> anyhow::Result<LogLevelHandle> {
    let levels = Levels {
        global: config.level,
        overrides: BTreeMap::new(),
    };
    let initial = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => levels.filter()?,
    };
    let (filter, reload) = reload::Layer::new(initial);
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(config.ansi_colors)
                    .with_target(true)
                    .with_file(config.with_source_location)
                    .with_line_number(config.with_source_location),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_file(config.with_source_location)
                    .with_line_number(config.with_source_location),
            )
            .try_init()?,
    }

    Ok(LogLevelHandle {
        reload,
        levels: Arc::new(Mutex::new(levels)),
    })
}
