//! Outbound W3C trace-context propagation (https://www.w3.org/TR/trace-context/).

use opentelemetry::trace::{SpanContext, TraceContextExt};
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn traceparent(ctx: &SpanContext) -> String {
    format!(
        "00-{}-{}-{:02x}",
        ctx.trace_id(),
        ctx.span_id(),
        ctx.trace_flags().to_u8()
    )
}

/// Headers carrying the current span's context. Empty outside a sampled span.
pub fn trace_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let otel_context = Span::current().context();
    let span = otel_context.span();
    let ctx = span.span_context();
    if !ctx.is_valid() {
        return headers;
    }

    if let Ok(value) = HeaderValue::from_str(&traceparent(ctx)) {
        headers.insert(TRACEPARENT_HEADER, value);
    }
    let state = ctx.trace_state().header();
    if !state.is_empty()
        && let Ok(value) = HeaderValue::from_str(&state)
    {
        headers.insert(TRACESTATE_HEADER, value);
    }
    headers
}

/// Attach trace headers to outgoing gateway, contract and notifier calls.
pub trait TracedRequestExt {
    fn with_trace_context(self) -> Self;
}

impl TracedRequestExt for reqwest::RequestBuilder {
    fn with_trace_context(self) -> Self {
        self.headers(trace_headers())
    }
}
