use std::time::Duration;

/// A completed operation reported to the telemetry sink.
#[derive(Clone, Debug)]
pub struct SpanRecord {
    pub name: &'static str,
    pub attributes: Vec<(&'static str, String)>,
    pub elapsed: Duration,
}

/// Opaque span-reporting interface supplied by the embedding toolchain.
///
/// The cache reports one span per public operation (download, extraction,
/// sweep). Reporting must never fail and must never block for long; the cache
/// calls it on the caller's own thread.
pub trait SpanReporter: Send + Sync {
    fn report(&self, span: &SpanRecord);
}

/// Default sink that drops every span.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSpanReporter;

impl SpanReporter for NoopSpanReporter {
    fn report(&self, _span: &SpanRecord) {}
}
