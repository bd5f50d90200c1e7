//! Watchdog configuration loading
//!
//! An optional TOML file overlaid by `WATCHDOG_*` environment variables
//! (`__` separates nested keys, e.g. `WATCHDOG_THRESHOLDS__SHED=86`).
//! Invalid configuration is fatal; nothing falls back to defaults silently.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use watchdog_lib::config::WatchdogConfig;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "WATCHDOG_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gpu-watchdog/watchdog.toml";

const ENV_PREFIX: &str = "WATCHDOG";

/// Load from `$WATCHDOG_CONFIG` (or the default path) plus environment
pub fn load() -> Result<WatchdogConfig> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from(&path)
}

/// Load and validate; a missing file is allowed, a malformed one is not
pub fn load_from(path: &str) -> Result<WatchdogConfig> {
    let settings = Config::builder()
        .add_source(File::new(path, FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("process_templates")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read configuration from {path}"))?;

    let config: WatchdogConfig = settings
        .try_deserialize()
        .with_context(|| format!("invalid configuration in {path}"))?;

    config.validate().context("configuration rejected")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_explicit_units() {
        let file = write_config(
            r#"
poll_interval_secs = 15
cooldown_secs = 120
command_timeout_secs = 45

[thresholds]
warn = 75.0
shed = 85.0
emergency = 90.0
critical = 95.0

[[units]]
id = 0
processes = ["gpu-server-0"]
health_url = "http://127.0.0.1:8000/health"

[[units]]
id = 1
processes = ["gpu-server-1"]
maintenance = true
"#,
        );

        let config = load_from(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.poll_interval_secs, 15);
        assert_eq!(config.cooldown_secs, 120);
        assert_eq!(config.command_timeout(), std::time::Duration::from_secs(45));
        assert_eq!(config.cache_release_timeout_secs, 10);
        assert_eq!(config.thresholds.warn, 75.0);
        assert_eq!(config.units.len(), 2);
        assert!(config.units[1].maintenance);
        assert_eq!(
            config.units[0].health_url.as_deref(),
            Some("http://127.0.0.1:8000/health")
        );
    }

    #[test]
    fn test_load_generated_units() {
        let file = write_config(
            r#"
gpu_count = 4
process_templates = ["gpu-server-{id}"]
"#,
        );

        let config = load_from(file.path().to_str().unwrap()).unwrap();
        let units = config.resolve_units();

        assert_eq!(units.len(), 4);
        assert_eq!(units[3].processes, vec!["gpu-server-3"]);
    }

    #[test]
    fn test_invalid_thresholds_are_fatal() {
        let file = write_config(
            r#"
gpu_count = 1

[thresholds]
warn = 90.0
shed = 85.0
emergency = 92.0
critical = 95.0
"#,
        );

        let err = load_from(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[test]
    fn test_no_units_is_fatal() {
        let err = load_from("/nonexistent/gpu-watchdog.toml").unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }
}
