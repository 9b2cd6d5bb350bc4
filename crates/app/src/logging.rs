use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the stderr subscriber and the panic logger.
///
/// `RUST_LOG` takes precedence over `default_directive`; an unparsable
///  directive falls back to `warn`. The returned guard must be kept alive
///  until the program exits or buffered lines are lost.
pub fn init_logging(default_directive: &str) -> WorkerGuard {
    let (stderr_writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let directive = default_directive.parse::<Directive>().unwrap_or_else(|_| {
        eprintln!("Warning: invalid log level {default_directive:?}, using warn");
        LevelFilter::WARN.into()
    });
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stderr_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stderr_layer).init();
    register_panic_logger();

    tracing::debug!(
        version = env!("REPO_VERSION"),
        profile = env!("BUILD_PROFILE"),
        "epad starting"
    );
    guard
}

/// Registers a panic hook that logs panics using the `tracing` crate
fn register_panic_logger() {
    std::panic::set_hook(Box::new(|panic| match panic.location() {
        Some(loc) => {
            tracing::error!(
                message = %panic,
                panic.file = loc.file(),
                panic.line = loc.line(),
                panic.column = loc.column(),
            );
        }
        None => tracing::error!(message = %panic),
    }));
}
