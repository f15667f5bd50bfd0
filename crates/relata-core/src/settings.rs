//! Settings for relata.
//!
//! [`Settings`] holds the database aliases known to the ORM and a few tuning
//! knobs for query execution. A process-wide [`SETTINGS`] instance is offered
//! for applications that prefer ambient configuration; the schema builder
//! itself always receives settings explicitly.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Connection configuration for one database alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// The backend engine (e.g. `relata.backends.sqlite`).
    pub engine: String,
    /// The database name, file path or `:memory:`.
    pub name: String,
    /// Additional engine-specific options.
    pub options: HashMap<String, String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "relata.backends.sqlite".to_string(),
            name: ":memory:".to_string(),
            options: HashMap::new(),
        }
    }
}

/// The complete set of relata settings.
///
/// # Examples
///
/// ```
/// use relata_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert_eq!(settings.default_database, "default");
/// assert!(settings.databases.contains_key("default"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Whether debug mode is enabled (pretty logs instead of JSON).
    pub debug: bool,
    /// The log filter directive (e.g. "info", "relata_db=debug").
    pub log_level: String,

    // ── Database ─────────────────────────────────────────────────────

    /// Database configurations, keyed by alias.
    pub databases: HashMap<String, DatabaseSettings>,
    /// The alias used by models that do not name one.
    pub default_database: String,

    // ── Query execution ──────────────────────────────────────────────

    /// Number of root rows fetched per round-trip by `iterate()`.
    pub iterate_chunk_size: usize,
    /// Maximum rows per multi-row INSERT issued by `bulk_create()`.
    pub bulk_batch_size: usize,
    /// Whether resolved relation paths are cached per registry.
    pub relation_path_cache: bool,

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Custom settings that don't fit into the above categories.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert("default".to_string(), DatabaseSettings::default());

        Self {
            debug: true,
            log_level: "info".to_string(),
            databases,
            default_database: "default".to_string(),
            iterate_chunk_size: 100,
            bulk_batch_size: 500,
            relation_path_cache: true,
            extra: HashMap::new(),
        }
    }
}

impl Settings {
    /// Returns the configuration for the given alias, if present.
    pub fn database(&self, alias: &str) -> Option<&DatabaseSettings> {
        self.databases.get(alias)
    }
}

/// A lazily-initialized, globally-accessible settings container.
///
/// Call [`configure`](LazySettings::configure) once at startup, then use
/// [`get`](LazySettings::get) anywhere.
pub struct LazySettings {
    inner: OnceLock<Settings>,
}

impl Default for LazySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl LazySettings {
    /// Creates a new, unconfigured `LazySettings`.
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Configures the global settings. Must be called exactly once.
    ///
    /// # Panics
    ///
    /// Panics if settings have already been configured.
    pub fn configure(&self, settings: Settings) {
        self.inner
            .set(settings)
            .expect("Settings have already been configured");
    }

    /// Returns the configured settings.
    ///
    /// # Panics
    ///
    /// Panics if settings have not been configured.
    pub fn get(&self) -> &Settings {
        self.inner
            .get()
            .expect("Settings have not been configured. Call SETTINGS.configure() first.")
    }

    /// Returns the configured settings, or `None` before configuration.
    pub fn try_get(&self) -> Option<&Settings> {
        self.inner.get()
    }

    /// Returns `true` if settings have been configured.
    pub fn is_configured(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// The global settings instance.
pub static SETTINGS: LazySettings = LazySettings::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert!(s.debug);
        assert_eq!(s.log_level, "info");
        assert_eq!(s.iterate_chunk_size, 100);
        assert_eq!(s.bulk_batch_size, 500);
        assert!(s.relation_path_cache);
    }

    #[test]
    fn test_default_database() {
        let s = Settings::default();
        let db = s.database("default").expect("default db should exist");
        assert_eq!(db.engine, "relata.backends.sqlite");
        assert_eq!(db.name, ":memory:");
        assert!(s.database("replica").is_none());
    }

    #[test]
    fn test_lazy_settings_configure_and_get() {
        let lazy = LazySettings::new();
        assert!(!lazy.is_configured());
        assert!(lazy.try_get().is_none());

        let mut settings = Settings::default();
        settings.debug = false;
        settings.iterate_chunk_size = 7;

        lazy.configure(settings);
        assert!(lazy.is_configured());
        assert!(!lazy.get().debug);
        assert_eq!(lazy.get().iterate_chunk_size, 7);
    }

    #[test]
    #[should_panic(expected = "already been configured")]
    fn test_lazy_settings_double_configure_panics() {
        let lazy = LazySettings::new();
        lazy.configure(Settings::default());
        lazy.configure(Settings::default());
    }

    #[test]
    #[should_panic(expected = "not been configured")]
    fn test_lazy_settings_get_before_configure_panics() {
        let lazy = LazySettings::new();
        let _ = lazy.get();
    }
}
