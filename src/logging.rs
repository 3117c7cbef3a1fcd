use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info,lumen_lib=debug";

/// Build the filter from `RUST_LOG`, falling back to `default` when the
/// variable is unset or unparsable.
pub fn env_filter(default: &str) -> EnvFilter {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    filter_or(directives.as_deref(), default)
}

fn filter_or(directives: Option<&str>, default: &str) -> EnvFilter {
    match directives.filter(|d| !d.trim().is_empty()) {
        Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|e| {
            eprintln!("Ignoring invalid log filter {directives:?}: {e}");
            EnvFilter::new(default)
        }),
        None => EnvFilter::new(default),
    }
}

/// Install the global fmt subscriber. Safe to call more than once.
pub fn init() {
    let result = tracing_subscriber::fmt()
        .with_env_filter(env_filter(DEFAULT_LOG_FILTER))
        .with_target(true)
        .try_init();

    if result.is_ok() {
        tracing::debug!(filter = DEFAULT_LOG_FILTER, "Logging initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_directives_are_used() {
        let filter = filter_or(Some("lumen_lib=debug"), "warn");
        assert!(filter.to_string().contains("lumen_lib=debug"));
    }

    #[test]
    fn unparsable_or_missing_directives_fall_back() {
        assert_eq!(filter_or(Some("lumen_lib=loud"), "warn").to_string(), "warn");
        assert_eq!(filter_or(Some("  "), "warn").to_string(), "warn");
        assert_eq!(filter_or(None, "warn").to_string(), "warn");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init();
        init();
    }
}
