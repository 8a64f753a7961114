use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingSettings;

static TRACING_INIT: Once = Once::new();

fn normalize_level_directives(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return LoggingSettings::default().level;
    }

    match trimmed.to_ascii_lowercase().as_str() {
        "trace" => "trace".to_owned(),
        "debug" => "debug".to_owned(),
        "info" => "info".to_owned(),
        "warn" | "warning" => "warn".to_owned(),
        "error" => "error".to_owned(),
        "off" | "none" | "quiet" => "off".to_owned(),
        // Anything else is an `EnvFilter` directive string.
        _ => trimmed.to_owned(),
    }
}

fn config_env_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_new(normalize_level_directives(&settings.level)).unwrap_or_else(|_| {
        EnvFilter::default().add_directive(tracing_subscriber::filter::LevelFilter::WARN.into())
    })
}

/// The effective filter: the configured level, with `RUST_LOG` merged on top when set.
pub fn env_filter(settings: &LoggingSettings) -> EnvFilter {
    let env_directives = std::env::var("RUST_LOG")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty());

    match env_directives {
        Some(env_directives) => {
            let combined = format!(
                "{},{env_directives}",
                normalize_level_directives(&settings.level)
            );
            EnvFilter::try_new(combined)
                .or_else(|_| EnvFilter::try_new(&env_directives))
                .unwrap_or_else(|_| config_env_filter(settings))
        }
        None => config_env_filter(settings),
    }
}

/// Installs the global subscriber writing to stderr. Only the first call has an effect.
pub fn init_tracing(settings: &LoggingSettings) {
    TRACING_INIT.call_once(|| {
        let layer: Box<dyn Layer<_> + Send + Sync> = if settings.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        };

        // Another subscriber may already be installed (e.g. by a test harness).
        let _ = tracing_subscriber::registry()
            .with(env_filter(settings))
            .with(layer)
            .try_init();
    });
}
