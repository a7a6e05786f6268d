//! Bootstrap utilities for evlog services.
//!
//! Shared initialization code for processes embedding the library.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter directive.
pub const LOG_ENV_VAR: &str = "EVLOG_LOG";

/// Build the log filter from `EVLOG_LOG`, defaulting to "info".
pub fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize tracing with EVLOG_LOG environment variable.
///
/// Defaults to "info" level if EVLOG_LOG is not set. With the `otel` feature
/// the W3C trace-context propagator is installed and spans carry OpenTelemetry
/// context, so trace headers are written on append and picked up on consume.
/// Exporters are left to the embedding application.
pub fn init_tracing() {
    #[cfg(feature = "otel")]
    {
        use opentelemetry::trace::TracerProvider as _;

        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let tracer = provider.tracer("evlog");
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    }

    #[cfg(not(feature = "otel"))]
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
