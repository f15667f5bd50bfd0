//! Settings loading from configuration files and the environment.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Deep-merge a TOML or JSON document over them.
//! 3. Apply environment variable overrides (highest priority).
//!
//! ## Environment Variable Mapping
//!
//! | Env Var | Setting |
//! |---|---|
//! | `RELATA_DEBUG` | `debug` |
//! | `RELATA_LOG_LEVEL` | `log_level` |
//! | `RELATA_DATABASE_URL` | `databases[default_database].name` |
//! | `RELATA_DEFAULT_DATABASE` | `default_database` |
//! | `RELATA_ITERATE_CHUNK_SIZE` | `iterate_chunk_size` |
//! | `RELATA_BULK_BATCH_SIZE` | `bulk_batch_size` |
//!
//! ```rust,no_run
//! use relata_core::settings_loader;
//!
//! let settings = settings_loader::from_toml_file_with_env("relata.toml").unwrap();
//! ```

use std::path::Path;

use crate::error::{RelataError, RelataResult};
use crate::settings::{DatabaseSettings, Settings};

/// Loads settings from a TOML string, keeping defaults for absent keys.
pub fn from_toml_str(toml_str: &str) -> RelataResult<Settings> {
    let toml_value: toml::Value = toml::from_str(toml_str)
        .map_err(|e| RelataError::Configuration(format!("Failed to parse TOML: {e}")))?;
    merge_over_defaults(toml_to_json(toml_value), "TOML")
}

/// Loads settings from a TOML file.
pub fn from_toml_file(path: impl AsRef<Path>) -> RelataResult<Settings> {
    from_toml_str(&read_config(path.as_ref(), "TOML")?)
}

/// Loads settings from a TOML file and then applies environment overrides.
pub fn from_toml_file_with_env(path: impl AsRef<Path>) -> RelataResult<Settings> {
    let mut settings = from_toml_file(path)?;
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

/// Loads settings from a JSON string, keeping defaults for absent keys.
pub fn from_json_str(json_str: &str) -> RelataResult<Settings> {
    let json_value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| RelataError::Configuration(format!("Failed to parse JSON: {e}")))?;
    merge_over_defaults(json_value, "JSON")
}

/// Loads settings from a JSON file.
pub fn from_json_file(path: impl AsRef<Path>) -> RelataResult<Settings> {
    from_json_str(&read_config(path.as_ref(), "JSON")?)
}

/// Loads settings from a JSON file and then applies environment overrides.
pub fn from_json_file_with_env(path: impl AsRef<Path>) -> RelataResult<Settings> {
    let mut settings = from_json_file(path)?;
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

/// Loads settings from environment variables only, starting from defaults.
pub fn from_env() -> RelataResult<Settings> {
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

/// Applies `RELATA_*` environment variable overrides.
///
/// Numeric variables that fail to parse are reported as configuration errors
/// rather than silently ignored.
pub fn apply_env_overrides(settings: &mut Settings) -> RelataResult<()> {
    apply_overrides_from(settings, |key| std::env::var(key).ok())
}

fn apply_overrides_from(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> RelataResult<()> {
    if let Some(val) = lookup("RELATA_DEBUG") {
        settings.debug = matches!(val.to_lowercase().as_str(), "true" | "1" | "yes");
    }

    if let Some(val) = lookup("RELATA_LOG_LEVEL") {
        settings.log_level = val;
    }

    if let Some(val) = lookup("RELATA_DEFAULT_DATABASE") {
        settings.default_database = val;
    }

    if let Some(val) = lookup("RELATA_DATABASE_URL") {
        settings
            .databases
            .entry(settings.default_database.clone())
            .or_insert_with(DatabaseSettings::default)
            .name = val;
    }

    if let Some(val) = lookup("RELATA_ITERATE_CHUNK_SIZE") {
        settings.iterate_chunk_size = parse_positive("RELATA_ITERATE_CHUNK_SIZE", &val)?;
    }

    if let Some(val) = lookup("RELATA_BULK_BATCH_SIZE") {
        settings.bulk_batch_size = parse_positive("RELATA_BULK_BATCH_SIZE", &val)?;
    }

    Ok(())
}

// ============================================================
// Helpers
// ============================================================

fn read_config(path: &Path, format: &str) -> RelataResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        RelataError::Configuration(format!(
            "Failed to read {format} file '{}': {e}",
            path.display()
        ))
    })
}

fn merge_over_defaults(value: serde_json::Value, format: &str) -> RelataResult<Settings> {
    let default_json = serde_json::to_value(Settings::default()).map_err(|e| {
        RelataError::Configuration(format!("Failed to serialize default settings: {e}"))
    })?;
    let merged = merge_json(default_json, value);
    let settings: Settings = serde_json::from_value(merged).map_err(|e| {
        RelataError::Configuration(format!("Failed to deserialize settings from {format}: {e}"))
    })?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> RelataResult<()> {
    if settings.iterate_chunk_size == 0 || settings.bulk_batch_size == 0 {
        return Err(RelataError::Configuration(
            "iterate_chunk_size and bulk_batch_size must be positive".to_string(),
        ));
    }
    Ok(())
}

fn parse_positive(key: &str, val: &str) -> RelataResult<usize> {
    match val.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(RelataError::Configuration(format!(
            "{key} must be a positive integer, got '{val}'"
        ))),
    }
}

/// Converts a TOML value to a `serde_json::Value`.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Deep-merges two JSON values. The `override_val` takes precedence.
fn merge_json(base: serde_json::Value, override_val: serde_json::Value) -> serde_json::Value {
    match (base, override_val) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(override_map)) => {
            for (key, override_v) in override_map {
                let merged = match base_map.remove(&key) {
                    Some(base_v) => merge_json(base_v, override_v),
                    None => override_v,
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, override_val) => override_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_toml_str_basic() {
        let toml = r#"
            debug = false
            log_level = "relata_db=debug"
            iterate_chunk_size = 25
        "#;

        let settings = from_toml_str(toml).unwrap();
        assert!(!settings.debug);
        assert_eq!(settings.log_level, "relata_db=debug");
        assert_eq!(settings.iterate_chunk_size, 25);
        // Defaults preserved
        assert_eq!(settings.bulk_batch_size, 500);
        assert!(settings.databases.contains_key("default"));
    }

    #[test]
    fn test_from_toml_str_databases() {
        let toml = r#"
            [databases.analytics]
            engine = "relata.backends.sqlite"
            name = "analytics.db"
            options = {}
        "#;

        let settings = from_toml_str(toml).unwrap();
        assert_eq!(settings.databases.len(), 2);
        assert_eq!(settings.databases["analytics"].name, "analytics.db");
    }

    #[test]
    fn test_from_toml_str_empty() {
        let settings = from_toml_str("").unwrap();
        assert!(settings.debug);
        assert_eq!(settings.default_database, "default");
    }

    #[test]
    fn test_from_toml_str_invalid() {
        let err = from_toml_str("debug = [").unwrap_err();
        assert!(matches!(err, RelataError::Configuration(_)));
    }

    #[test]
    fn test_from_toml_rejects_zero_chunk_size() {
        let err = from_toml_str("iterate_chunk_size = 0").unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_from_json_str() {
        let settings =
            from_json_str(r#"{"debug": false, "bulk_batch_size": 50}"#).unwrap();
        assert!(!settings.debug);
        assert_eq!(settings.bulk_batch_size, 50);
        assert_eq!(settings.iterate_chunk_size, 100);
    }

    #[test]
    fn test_from_json_str_wrong_type() {
        assert!(from_json_str(r#"{"debug": "maybe"}"#).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("RELATA_DEBUG", "0"),
            ("RELATA_LOG_LEVEL", "warn"),
            ("RELATA_DATABASE_URL", "app.db"),
            ("RELATA_ITERATE_CHUNK_SIZE", "10"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        apply_overrides_from(&mut settings, |k| env.get(k).map(ToString::to_string)).unwrap();
        assert!(!settings.debug);
        assert_eq!(settings.log_level, "warn");
        assert_eq!(settings.databases["default"].name, "app.db");
        assert_eq!(settings.iterate_chunk_size, 10);
    }

    #[test]
    fn test_override_bad_number() {
        let mut settings = Settings::default();
        let err = apply_overrides_from(&mut settings, |k| {
            (k == "RELATA_BULK_BATCH_SIZE").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("RELATA_BULK_BATCH_SIZE"));
    }

    #[test]
    fn test_merge_json_nested() {
        let base = serde_json::json!({"a": {"b": 1, "c": 2}});
        let over = serde_json::json!({"a": {"c": 3}});
        assert_eq!(merge_json(base, over), serde_json::json!({"a": {"b": 1, "c": 3}}));
    }

    #[test]
    fn test_from_toml_file_missing() {
        let err = from_toml_file("/nonexistent/relata.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read TOML file"));
    }
}
