use once_cell::sync::OnceCell;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use kiln_core::util::env_string;

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install console logging on stderr with an `info` default filter.
pub fn init() {
    init_with_default("info");
}

/// Install logging with `default_directive` used when `RUST_LOG` is unset.
///
/// Console output always goes to stderr. With `KILN_LOG_DIR` set, a rolling
/// file layer (`KILN_LOG_ROTATION` = daily|hourly|minutely) is added. Calling
/// this more than once is harmless.
pub fn init_with_default(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    let Some(dir) = env_string("KILN_LOG_DIR") else {
        let _ = registry.try_init();
        return;
    };
    if let Err(err) = std::fs::create_dir_all(&dir) {
        let _ = registry.try_init();
        tracing::warn!(directory = %dir, error = %err, "failed to create log directory");
        return;
    }
    let rotation = rotation_from(env_string("KILN_LOG_ROTATION").as_deref());
    let writer = RollingFileAppender::new(rotation, &dir, log_prefix());
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(file_filter);
    let _ = registry.with(file_layer).try_init();
}

fn log_prefix() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "kiln".into())
}

fn rotation_from(raw: Option<&str>) -> Rotation {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("hourly") => Rotation::HOURLY,
        Some("minutely") => Rotation::MINUTELY,
        _ => Rotation::DAILY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_defaults_to_daily() {
        assert_eq!(rotation_from(None), Rotation::DAILY);
        assert_eq!(rotation_from(Some("weekly")), Rotation::DAILY);
        assert_eq!(rotation_from(Some("HOURLY")), Rotation::HOURLY);
        assert_eq!(rotation_from(Some("minutely")), Rotation::MINUTELY);
    }

    #[test]
    fn repeated_init_does_not_panic() {
        init();
        init_with_default("warn");
    }
}
