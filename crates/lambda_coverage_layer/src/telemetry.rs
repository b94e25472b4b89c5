use lambda_coverage_core::settings::LOG_LEVEL_VAR;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs a JSON subscriber writing one object per line to stderr.
///
/// The filter comes from `COVERAGE_LOG_LEVEL` (a level or full directive
/// string). Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let directive = std::env::var(LOG_LEVEL_VAR)
        .ok()
        .map(|level| level.trim().to_ascii_lowercase())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    let filter =
        EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .try_init();
}
