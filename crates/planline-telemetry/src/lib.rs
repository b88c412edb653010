use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use planline_core::settings::LoggingSettings;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "planline_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from the `logging` settings section. An unknown default level
    /// falls back to INFO; modules with an unknown level are skipped.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        let module_levels = settings
            .modules
            .iter()
            .filter_map(|(module, level)| Some((module.clone(), level.parse().ok()?)))
            .collect();
        Self {
            log_level: settings.level.parse().unwrap_or(Level::INFO),
            module_levels,
            json: settings.json,
        }
    }

    /// The filter directive string, e.g. `info,planline_store=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Initialize the global tracing subscriber. Call once at startup.
///
/// Returns `false` when a subscriber was already installed (e.g. in tests).
pub fn init_telemetry(config: &TelemetryConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("planline_store".into(), Level::DEBUG)],
            json: false,
        };
        assert_eq!(config.filter_directives(), "warn,planline_store=debug");
    }

    #[test]
    fn from_settings_parses_level() {
        let settings = LoggingSettings {
            level: "debug".into(),
            json: true,
            ..LoggingSettings::default()
        };
        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.json);
    }

    #[test]
    fn module_levels_come_from_settings() {
        let settings = LoggingSettings {
            level: "warn".into(),
            modules: [
                ("planline_store".to_string(), "debug".to_string()),
                ("planline_engine".to_string(), "nonsense".to_string()),
            ]
            .into_iter()
            .collect(),
            ..LoggingSettings::default()
        };
        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(
            config.module_levels,
            vec![("planline_store".to_string(), Level::DEBUG)]
        );
        assert_eq!(config.filter_directives(), "warn,planline_store=debug");
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let settings = LoggingSettings {
            level: "chatty".into(),
            ..LoggingSettings::default()
        };
        assert_eq!(TelemetryConfig::from_settings(&settings).log_level, Level::INFO);
    }

    #[test]
    fn second_init_is_harmless() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        assert!(!init_telemetry(&config));
    }
}
