//! Logging setup for the solver binaries
//!
//! The library itself only emits `tracing` events; binaries and tests decide
//! whether and how to install a subscriber. Per-evaluation events of a solve
//! are logged at DEBUG (nominal) and TRACE (Jacobian columns).

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::SystemTime;

/// Install the INFO-level subscriber used by `solve_scene`.
///
/// `RUST_LOG` directives take precedence over the default level:
/// ```bash
/// RUST_LOG=matchmove_solver::core::reprojection=debug solve_scene scene.json
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install a subscriber whose default level is `default_level`.
///
/// Only the first call in a process installs anything.
pub fn init_logger_with_level(default_level: Level) {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(solve_filter(default_level, &directives))
        .with_timer(SystemTime)
        .with_target(true)
        .try_init();
}

/// Filter applying `directives` on top of `default_level`, skipping any that
/// fail to parse.
fn solve_filter(default_level: Level, directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .parse_lossy(directives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_default_level_without_directives() {
        let filter = solve_filter(Level::WARN, "");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn test_directives_raise_solver_verbosity() {
        let filter = solve_filter(Level::INFO, "matchmove_solver::core::reprojection=trace");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
        assert!(filter.to_string().contains("matchmove_solver::core::reprojection=trace"));
    }

    #[test]
    fn test_malformed_directives_are_skipped() {
        let filter = solve_filter(Level::INFO, "matchmove_solver=notalevel");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }
}
