//! Root logger construction. Mirrors the teacher's `main.rs` verbatim: a
//! terminal drain wrapped for async delivery, level-filtered by `--verbose`,
//! stamped with the build version and package version so every log line is
//! traceable to a release.

use slog::Drain;

pub const GIT_VERSION: &str = git_version::git_version!(
    args = ["--long", "--all", "--always", "--dirty=-modified"],
    fallback = "unknown"
);

/// Builds the root logger: a terminal drain, optionally duplicated to the
/// system journal for deployments that run under systemd. Level-filtered by
/// `--verbose`, then wrapped for async, non-blocking delivery.
pub fn build_root_logger(verbose: bool, with_journald: bool) -> slog::Logger {
    let log_decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let term_drain = slog_term::CompactFormat::new(log_decorator).build().fuse();

    let log_level = if verbose { slog::Level::Debug } else { slog::Level::Info };

    let root = if with_journald {
        let duplicated = slog::Duplicate::new(term_drain, slog_journald::JournaldDrain).fuse();
        let filtered = slog::LevelFilter::new(duplicated, log_level).fuse();
        slog::Logger::root(slog_async::Async::new(filtered).build().fuse(), slog::o!())
    } else {
        let filtered = slog::LevelFilter::new(term_drain, log_level).fuse();
        slog::Logger::root(slog_async::Async::new(filtered).build().fuse(), slog::o!())
    };

    root.new(slog::o!("build" => GIT_VERSION, "pkg-version" => env!("CARGO_PKG_VERSION")))
}
