// Third Party
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
    low_level::signal_name,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over `level` when set.
pub fn init_tracing(crate_name: &str, level: tracing::Level) {
    let level = level.as_str().to_ascii_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("error,{}={}", crate_name, level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM. A second signal exits immediately.
pub fn setup_exit_hooks(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::Builder::new()
        .name("exit-hooks".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(
                    "Received {}. Shutting down.",
                    signal_name(signal).unwrap_or("signal")
                );
                shutdown.cancel();
            }
            if signals.forever().next().is_some() {
                warn!("Received a second signal, exiting without waiting for the current pass");
                std::process::exit(130);
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    // System
    use std::time::Duration;

    // Third Party
    use signal_hook::{consts::SIGTERM, low_level::raise};
    use tokio_util::sync::CancellationToken;

    // Local
    use super::setup_exit_hooks;

    #[tokio::test]
    async fn test_sigterm_cancels_shutdown_token() {
        let shutdown = CancellationToken::new();
        setup_exit_hooks(shutdown.clone()).unwrap();

        raise(SIGTERM).unwrap();

        tokio::time::timeout(Duration::from_secs(2), shutdown.cancelled())
            .await
            .expect("SIGTERM did not cancel the shutdown token");
    }
}
