use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global subscriber. Unknown level names fall back to `info`.
pub(crate) fn init(level: &str) {
    let max_level = level.trim().parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(max_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
