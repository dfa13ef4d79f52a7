//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter for a verbosity count (`-v` repeats) and quiet flag
pub fn default_directive(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "gary4local=warn";
    }
    match verbose {
        0 => "gary4local=info",
        1 => "gary4local=debug",
        _ => "gary4local=trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the flags.
///
/// Logs go to stderr so progress bars and tables on stdout stay intact.
pub fn init(verbose: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(0, false), "gary4local=info");
        assert_eq!(default_directive(1, false), "gary4local=debug");
        assert_eq!(default_directive(5, false), "gary4local=trace");
        assert_eq!(default_directive(2, true), "gary4local=warn");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(0, true);
        init(1, false);
    }
}
