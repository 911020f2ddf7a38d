//! Switchboard Runtime - orchestration layer for the Switchboard dispatcher.
//!
//! This crate provides:
//! - Layered configuration (`ConfigLoader`, `SwitchboardConfig`)
//! - Logging setup (`LoggingBuilder`, `SpanEvents`)
//! - The `Runtime`, which opens persistence, builds the dispatcher and runs
//!   it until Ctrl+C
//!
//! ```rust,ignore
//! use switchboard_runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::builder().build().await?;
//!     runtime.add_handler(0, my_conversation()?).await?;
//!
//!     let sender = runtime.update_sender().await.expect("fresh runtime");
//!     tokio::spawn(my_transport(sender));
//!
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{
    ConfigError, ConfigLoader, ConfigResult, DispatcherConfig, LoggingConfig, PersistenceBackend,
    PersistenceConfig, Profile, SwitchboardConfig,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeStats};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides all the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
