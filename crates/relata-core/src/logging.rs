//! Logging integration.
//!
//! Provides [`setup_logging`] to install a [`tracing`] subscriber from
//! [`Settings`](crate::settings::Settings) and [`query_span`] for wrapping
//! terminal ORM operations.

use crate::settings::Settings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// `settings.log_level` is an `EnvFilter` directive. In debug mode a pretty,
/// human-readable format is used; otherwise a structured JSON format is used.
/// Installing a second subscriber is a no-op.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a span for one ORM operation on a model.
///
/// ```
/// use relata_core::logging::query_span;
///
/// let span = query_span("Book", "all");
/// let _guard = span.enter();
/// tracing::debug!("loading books");
/// ```
pub fn query_span(model: &str, operation: &'static str) -> tracing::Span {
    tracing::info_span!("relata", model = model, op = operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_twice_is_harmless() {
        let settings = Settings::default();
        setup_logging(&settings);
        setup_logging(&settings);
    }

    #[test]
    fn test_query_span_enters() {
        let span = query_span("Book", "count");
        let _guard = span.enter();
        tracing::debug!("inside span");
    }
}
