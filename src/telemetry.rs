use tracing::Level;

/// Installs the global subscriber. Logs go to stderr so stdout stays free for
/// the CSV report. A second call is a no-op.
pub fn init(level: Level, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
