use std::path::Path;

use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::{AppError, AppResult};

const TIMER_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Console-only tracing, filtered by `RUST_LOG` (a `.env` file is honoured).
///
/// Safe to call more than once: later calls leave the first subscriber in place.
pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIMER_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    // a subscriber installed by an earlier test or caller wins
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Ok(())
}

/// Console plus a daily rolling log file under `dir`.
///
/// The returned guard must be held for as long as file logging is wanted;
/// dropping it flushes and stops the background writer.
pub fn setup_tracing(dir: impl AsRef<Path>, file_prefix: &str) -> AppResult<WorkerGuard> {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::daily(dir, file_prefix);
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    // write to both the log file and stdout
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIMER_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already initialized: {e}")))?;

    Ok(worker_guard)
}
