//! Settings loading
//!
//! Layering, lowest to highest precedence: built-in defaults, optional config
//! file, `FX_*` environment variables (nested keys joined with `__`).

use config::{Config, Environment, File};
use std::env;

use fx_core::StreamSettings;

/// Env var naming the config file (extension optional)
pub const CONFIG_PATH_ENV: &str = "FX_STREAMER_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "fx-streamer";

pub const ENV_PREFIX: &str = "FX";

/// Load settings from the process environment
pub fn load_settings() -> anyhow::Result<StreamSettings> {
    let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from(&path, env_source())
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Load settings from `path` (missing file is fine) overlaid with `env`
pub fn load_from(path: &str, env: Environment) -> anyhow::Result<StreamSettings> {
    let settings: StreamSettings = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(env)
        .build()?
        .try_deserialize()?;

    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env_source().source(Some(map))
    }

    #[test]
    fn test_defaults_without_file_or_env() {
        let settings = load_from("does-not-exist", env_from(&[])).unwrap();
        assert_eq!(settings.feed_endpoint, "memory://forex_rates_stream");
        assert_eq!(settings.replay_pace_ms, 100);
    }

    #[test]
    fn test_env_overrides() {
        let settings = load_from(
            "does-not-exist",
            env_from(&[
                ("FX_REPLAY_PACE_MS", "5"),
                ("FX_STORAGE_ENDPOINT", "memory://"),
                ("FX_BASELINE_WINDOW_START", "1734213600000"),
                ("FX_BASELINE_WINDOW_END", "1734217200000"),
                ("FX_BASELINE__REFERENCE_HOUR", "16"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.replay_pace_ms, 5);
        assert_eq!(settings.storage_endpoint, "memory://");
        assert_eq!(settings.baseline_window_start, Some(1_734_213_600_000));
        assert_eq!(settings.baseline_window_end, Some(1_734_217_200_000));
        assert_eq!(settings.baseline.reference_hour, 16);
    }

    #[test]
    fn test_file_then_env_precedence() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "replay_pace_ms = 250").unwrap();
        writeln!(file, "notify_port = 9001").unwrap();
        writeln!(file, "[storage_retry]").unwrap();
        writeln!(file, "max_attempts = 2").unwrap();
        file.flush().unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let settings = load_from(&path, env_from(&[("FX_NOTIFY_PORT", "9002")])).unwrap();

        assert_eq!(settings.replay_pace_ms, 250);
        assert_eq!(settings.notify_port, 9002);
        assert_eq!(settings.storage_retry.max_attempts, 2);
        assert_eq!(settings.storage_retry.initial_delay_ms, 200);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let result = load_from(
            "does-not-exist",
            env_from(&[("FX_BASELINE_WINDOW_START", "10")]),
        );
        assert!(result.is_err());
    }
}
