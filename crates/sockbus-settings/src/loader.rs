//! Layered settings loading: defaults → JSON file → environment.

use std::path::Path;

use serde_json::Value;

use crate::errors::{Result, SettingsError};
use crate::types::BusSettings;

/// Environment variable naming an optional settings file.
pub const SETTINGS_PATH_ENV: &str = "SOCKBUS_SETTINGS";

const ENV_MAX_MESSAGE_SIZE: &str = "SOCKBUS_MAX_MESSAGE_SIZE";
const ENV_PING_PERIOD_MS: &str = "SOCKBUS_PING_PERIOD_MS";
const ENV_PONG_WAIT_MS: &str = "SOCKBUS_PONG_WAIT_MS";
const ENV_WRITE_TIMEOUT_MS: &str = "SOCKBUS_WRITE_TIMEOUT_MS";

/// Recursively merge `overlay` into `base`. Objects merge key-by-key; any
/// other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Load defaults, the file named by `SOCKBUS_SETTINGS` (if set), and env overrides.
pub fn load_settings() -> Result<BusSettings> {
    match std::env::var(SETTINGS_PATH_ENV) {
        Ok(path) => load_settings_from_path(Path::new(&path)),
        Err(_) => {
            let mut settings = BusSettings::default();
            apply_env_overrides(&mut settings)?;
            settings.validate();
            Ok(settings)
        }
    }
}

/// Load settings from a JSON file deep-merged over defaults, then apply env overrides.
pub fn load_settings_from_path(path: &Path) -> Result<BusSettings> {
    let raw = std::fs::read_to_string(path)?;
    let mut settings = parse_over_defaults(&raw)?;
    apply_env_overrides(&mut settings)?;
    settings.validate();
    tracing::debug!(?path, "settings loaded");
    Ok(settings)
}

fn parse_over_defaults(raw: &str) -> Result<BusSettings> {
    let overlay: Value = serde_json::from_str(raw)?;
    let defaults = serde_json::to_value(BusSettings::default())?;
    Ok(serde_json::from_value(deep_merge(defaults, overlay))?)
}

/// Apply `SOCKBUS_*` environment overrides from the process environment.
pub fn apply_env_overrides(settings: &mut BusSettings) -> Result<()> {
    apply_overrides_with(settings, |var| std::env::var(var).ok())
}

fn apply_overrides_with(
    settings: &mut BusSettings,
    lookup: impl Fn(&'static str) -> Option<String>,
) -> Result<()> {
    fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T> {
        value
            .trim()
            .parse()
            .map_err(|_| SettingsError::InvalidEnv { var, value })
    }

    if let Some(v) = lookup(ENV_MAX_MESSAGE_SIZE) {
        settings.max_message_size = parse(ENV_MAX_MESSAGE_SIZE, v)?;
    }
    if let Some(v) = lookup(ENV_PING_PERIOD_MS) {
        settings.ping_period_ms = parse(ENV_PING_PERIOD_MS, v)?;
    }
    if let Some(v) = lookup(ENV_PONG_WAIT_MS) {
        settings.pong_wait_ms = parse(ENV_PONG_WAIT_MS, v)?;
    }
    if let Some(v) = lookup(ENV_WRITE_TIMEOUT_MS) {
        settings.write_timeout_ms = parse(ENV_WRITE_TIMEOUT_MS, v)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, (*v).to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn deep_merge_nested_objects() {
        let a = serde_json::json!({"x": {"a": 1, "b": 2}, "y": 1});
        let b = serde_json::json!({"x": {"b": 3}, "z": 4});
        let merged = deep_merge(a, b);
        assert_eq!(merged, serde_json::json!({"x": {"a": 1, "b": 3}, "y": 1, "z": 4}));
    }

    #[test]
    fn deep_merge_scalar_replaces() {
        let merged = deep_merge(serde_json::json!({"x": 1}), serde_json::json!(5));
        assert_eq!(merged, serde_json::json!(5));
    }

    #[test]
    fn load_from_file_keeps_unspecified_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sockbus.json");
        std::fs::write(&path, r#"{"maxMessageSize": 4096}"#).unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.max_message_size, 4096);
        assert_eq!(s.pong_wait_ms, 60_000);
    }

    #[test]
    fn load_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sockbus.json");
        std::fs::write(&path, r#"{"pingPeriodMs": 90000}"#).unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert!(s.ping_period_ms < s.pong_wait_ms);
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let err = load_settings_from_path(Path::new("/nonexistent/sockbus.json")).unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
    }

    #[test]
    fn load_from_malformed_file_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sockbus.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path).unwrap_err(),
            SettingsError::Json(_)
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = BusSettings::default();
        apply_overrides_with(
            &mut s,
            lookup_from(&[
                (ENV_PONG_WAIT_MS, "20000"),
                (ENV_PING_PERIOD_MS, " 15000 "),
                (ENV_WRITE_TIMEOUT_MS, "500"),
                (ENV_MAX_MESSAGE_SIZE, "2048"),
            ]),
        )
        .unwrap();
        assert_eq!(s.pong_wait_ms, 20_000);
        assert_eq!(s.ping_period_ms, 15_000);
        assert_eq!(s.write_timeout_ms, 500);
        assert_eq!(s.max_message_size, 2048);
    }

    #[test]
    fn invalid_env_value_is_rejected() {
        let mut s = BusSettings::default();
        let err = apply_overrides_with(&mut s, lookup_from(&[(ENV_PONG_WAIT_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::InvalidEnv { var: ENV_PONG_WAIT_MS, .. }
        ));
    }

    #[test]
    fn huge_env_pong_wait_is_clamped_not_overflowed() {
        let mut s = BusSettings::default();
        apply_overrides_with(
            &mut s,
            lookup_from(&[(ENV_PONG_WAIT_MS, "18446744073709551615")]),
        )
        .unwrap();
        s.validate();
        assert_eq!(s.pong_wait_ms, crate::types::MAX_TIMEOUT_MS);
        assert!(s.ping_period_ms < s.pong_wait_ms);
    }

    #[test]
    fn no_env_leaves_settings_untouched() {
        let mut s = BusSettings::default();
        apply_overrides_with(&mut s, lookup_from(&[])).unwrap();
        assert_eq!(s, BusSettings::default());
    }
}
