//! Application wiring for the policy administration core.
//!
//! This crate turns the dispatch engine of `pap-comm` into a runnable service
//! component:
//!
//! - **Configuration**: loading and validating the TOML document with `PAP_`
//!   environment overrides ([`config`] module)
//! - **Logging**: installing the tracing subscriber ([`logging`] module)
//! - **Lifecycle**: building every component and supervising the background
//!   tasks ([`activator`] module)
//!
//! # Usage
//!
//! ```no_run
//! use pap_app::{Collaborators, LogConfig, PapActivator, PapConfig};
//!
//! # async fn example(collaborators: Collaborators) -> anyhow::Result<()> {
//! let config = PapConfig::from_file_with_env("pap.toml")?;
//! pap_app::logging::init(&LogConfig::from_settings(&config.logging))?;
//!
//! let activator = PapActivator::new(&config, collaborators)?;
//! activator.start()?;
//! // feed PDP topic messages to activator.status_handler()
//! activator.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod activator;
pub mod config;
pub mod logging;

pub use activator::{Collaborators, PapActivator};
pub use config::{
    LoggingConfig, PapConfig, PdpParameters, RequestParameters, ShutdownConfig, TopicsConfig,
};
pub use logging::{init_with_handle, LogConfig, LogFormat, LogLevelHandle, LOG_TARGETS};
