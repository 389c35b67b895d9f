use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide structured logging sink. This governs
/// operational events (bind, admission, dispatch errors, shutdown); the
/// one-line-per-request access log is a separate, plain-text line emitted
/// directly by the dispatcher, not routed through this JSON layer.
pub fn init() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The non-blocking writer's worker thread must outlive `init()`'s stack
    // frame; leaking the guard keeps it alive for the process lifetime.
    std::mem::forget(guard);
}
