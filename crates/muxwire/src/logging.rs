//! Tracing setup for binaries and tests embedding the transport.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive for a `MUXWIRE_LOG` value.
fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("muxwire={level}")
}

/// Initialize tracing with RUST_LOG, MUXWIRE_LOG and LOG_FORMAT support.
///
/// Logs go to stderr. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("MUXWIRE_LOG").ok();
        EnvFilter::new(filter_directive(level.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_directives() {
        assert_eq!(filter_directive(Some("debug")), "muxwire=debug");
        assert_eq!(filter_directive(Some("warning")), "muxwire=warn");
        assert_eq!(filter_directive(Some("loud")), "muxwire=info");
        assert_eq!(filter_directive(None), "muxwire=info");
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::debug!("still fine");
    }
}
