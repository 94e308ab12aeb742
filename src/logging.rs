use tracing_subscriber::EnvFilter;

/// Filter directive for a `-v` count: sluice's own events get louder,
/// dependencies stay at `warn`.
pub fn filter_for(verbosity: u8) -> String {
    let level = match verbosity {
        0 => return "warn".to_string(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("warn,sluice={}", level)
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins over the verbosity flag. A second call is a no-op.
pub fn init(verbosity: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity > 1)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_only_own_events() {
        assert_eq!(filter_for(0), "warn");
        assert_eq!(filter_for(1), "warn,sluice=info");
        assert_eq!(filter_for(2), "warn,sluice=debug");
        assert_eq!(filter_for(7), "warn,sluice=trace");
    }
}
