//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "scriptorium=debug,info" } else { "warn,scriptorium=info" }
}

/// Install the global subscriber. Logs go to stderr so stdout stays clean
/// for generated text and JSON output.
pub fn init(verbose: bool, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    // Already installed by an embedding caller.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_raises_crate_level() {
        assert!(default_directive(true).contains("scriptorium=debug"));
        assert!(default_directive(false).contains("scriptorium=info"));
        assert!(EnvFilter::try_new(default_directive(true)).is_ok());
    }
}
