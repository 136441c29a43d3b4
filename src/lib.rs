pub mod config;
pub mod execution;
pub mod protocol;
pub mod subject;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod testing;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Output goes to stderr in every mode: a worker's stdout carries protocol
/// lines only.
pub fn init_tracing() {
    // Default: warn for most crates, info for ours
    // Use RUST_LOG=debug for per-operation logs
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,imaging_pipeline=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
