//! Building blocks for the `tracing` subscriber of a host running the loader.

use sentry::integrations::tracing::{EventFilter, SentryLayer};
use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::registry::LookupSpan;

/// A layer writing one JSON object per event to `make_writer`.
pub fn json_layer<S, W>(make_writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .boxed()
}

/// A layer forwarding events to Sentry.
///
/// Errors become Sentry events. Everything down to INFO is sent as logs instead of breadcrumbs.
pub fn sentry_layer<S>() -> SentryLayer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
        tracing::Level::ERROR => EventFilter::Event | EventFilter::Log,
        tracing::Level::WARN | tracing::Level::INFO => EventFilter::Log,
        tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
    })
}
