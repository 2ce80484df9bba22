//! Shared pieces for ChatForYou: signaling protocol, data-channel envelope,
//! file transfer, error types and logging.

#![forbid(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod file_transfer;
pub mod protocol;

pub use envelope::{DataEnvelope, EventKind};
pub use error::{Error, Result};
pub use protocol::{ParticipantInfo, SignalMessage};

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
