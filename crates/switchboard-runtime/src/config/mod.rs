//! Configuration for the Switchboard runtime.
//!
//! Settings are layered with figment from built-in defaults, TOML or YAML
//! files, `SWITCHBOARD_*` environment variables and programmatic overrides,
//! then checked by [`validate_config`].

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    DispatcherConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig,
    PersistenceBackend, PersistenceConfig, SpanEventConfig, SwitchboardConfig,
};
pub use validation::validate_config;
