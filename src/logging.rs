/// Subscriber setup. Logs go to stderr so the stdout exporter's output
/// stays machine-readable.
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG`, when set, takes precedence
/// over `level`.
pub fn init(format: &str, level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    }
}
