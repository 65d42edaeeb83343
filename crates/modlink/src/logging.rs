//! Tracing setup shared by both roles.
//!
//! `RUST_LOG` wins when set. Otherwise `MODLINK_LOG` picks the level for the
//! crate while frame-level codec tracing stays quiet unless `trace` is asked
//! for. `LOG_FORMAT=json` switches to one JSON object per line.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Filter directive for a `MODLINK_LOG` value.
fn directive(level: Option<&str>) -> String {
    let level = match level.map(str::to_ascii_lowercase).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    let codec = if level == "trace" { "trace" } else { "warn" };
    format!("modlink={level},modlink::wire::codec={codec}")
}

/// Installs the global subscriber on stderr. Later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(directive(std::env::var("MODLINK_LOG").ok().as_deref()))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match LogFormat::from_env(std::env::var("LOG_FORMAT").ok().as_deref()) {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_directives() {
        assert_eq!(directive(None), "modlink=info,modlink::wire::codec=warn");
        assert_eq!(directive(Some("WARNING")), "modlink=warn,modlink::wire::codec=warn");
        assert_eq!(directive(Some("debug")), "modlink=debug,modlink::wire::codec=warn");
        assert_eq!(directive(Some("trace")), "modlink=trace,modlink::wire::codec=trace");
        assert_eq!(directive(Some("loud")), "modlink=info,modlink::wire::codec=warn");
    }

    #[test]
    fn json_format_is_opt_in() {
        assert_eq!(LogFormat::from_env(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::from_env(Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::from_env(Some("pretty")), LogFormat::Text);
        assert_eq!(LogFormat::from_env(None), LogFormat::Text);
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
