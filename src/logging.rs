use tracing_subscriber::EnvFilter;

/// Env var holding the filter directives, e.g. `GFX_UMD_LOG=gfx_csr=debug`.
pub const LOG_ENV: &str = "GFX_UMD_LOG";

/// Install a `fmt` subscriber filtered by [`LOG_ENV`] (default `warn`). A no-op when the
/// process already has a global subscriber.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
