//! slog logger construction shared by the binary and tests.

use slog::{o, Drain, Logger};

/// Root logger writing human-readable records to the terminal through an
/// async drain.
pub fn root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

/// Logger that drops everything. Handy for tests and embedding.
pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
