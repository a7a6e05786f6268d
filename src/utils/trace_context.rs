//! W3C trace context propagation through message headers.
//!
//! With the `otel` feature the global text-map propagator writes the current
//! span's context into outgoing headers and restores it as the parent of the
//! consume span. Without it both directions are no-ops.

/// Headers carrying the current span's trace context.
#[cfg(feature = "otel")]
pub fn inject_current() -> Vec<(String, String)> {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = tracing::Span::current().context();
    let mut headers = Vec::new();

    opentelemetry::global::get_text_map_propagator(|propagator| {
        struct HeaderInjector<'a>(&'a mut Vec<(String, String)>);
        impl opentelemetry::propagation::Injector for HeaderInjector<'_> {
            fn set(&mut self, key: &str, value: String) {
                self.0.push((key.to_string(), value));
            }
        }
        propagator.inject_context(&cx, &mut HeaderInjector(&mut headers));
    });

    headers
}

#[cfg(not(feature = "otel"))]
pub fn inject_current() -> Vec<(String, String)> {
    Vec::new()
}

/// Set the trace context found in `headers` as the parent of `span`.
#[cfg(feature = "otel")]
pub fn set_parent_from_headers(span: &tracing::Span, headers: &[(String, String)]) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    if headers.is_empty() {
        return;
    }

    let parent_cx = opentelemetry::global::get_text_map_propagator(|propagator| {
        struct HeaderExtractor<'a>(&'a [(String, String)]);
        impl opentelemetry::propagation::Extractor for HeaderExtractor<'_> {
            fn get(&self, key: &str) -> Option<&str> {
                self.0
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v.as_str())
            }
            fn keys(&self) -> Vec<&str> {
                self.0.iter().map(|(k, _)| k.as_str()).collect()
            }
        }
        propagator.extract(&HeaderExtractor(headers))
    });
    span.set_parent(parent_cx);
}

#[cfg(not(feature = "otel"))]
pub fn set_parent_from_headers(_span: &tracing::Span, _headers: &[(String, String)]) {}
