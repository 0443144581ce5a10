//! Tracing subscriber setup for the binary.

use std::env;
use std::io::IsTerminal;

use tracing_subscriber::filter::EnvFilter;

/// Log level used when neither `RUST_LOG` nor `CANOPY_LOG_LEVEL` is set.
const DEFAULT_LEVEL: &str = "info";

fn level_from(raw: Option<&str>) -> &'static str {
    match raw {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") => "warn",
        Some("error") => "error",
        _ => DEFAULT_LEVEL,
    }
}

fn color_from(raw: Option<&str>, is_tty: bool) -> bool {
    match raw {
        Some("1" | "true" | "yes") => true,
        Some("0" | "false" | "no") => false,
        _ => is_tty,
    }
}

/// Installs the global tracing subscriber. Logs go to stderr so reports
/// printed on stdout stay machine-readable.
///
/// - `RUST_LOG` takes precedence; otherwise `CANOPY_LOG_LEVEL` picks the level
/// - `FORCE_COLOR=1|true|yes` forces colour, `0|false|no` disables it, and
///   anything else follows TTY detection on stderr
///
/// Call once at startup; a second call is ignored.
pub fn init_tracing() {
    let use_color = color_from(
        env::var("FORCE_COLOR").ok().as_deref(),
        std::io::stderr().is_terminal(),
    );

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(env::var("CANOPY_LOG_LEVEL").ok().as_deref());
        EnvFilter::new(format!("{level},tower=warn,hyper=warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_line_number(true)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(level_from(Some("verbose")), "info");
        assert_eq!(level_from(None), "info");
        assert_eq!(level_from(Some("debug")), "debug");
    }

    #[test]
    fn force_color_overrides_tty() {
        assert!(color_from(Some("yes"), false));
        assert!(!color_from(Some("0"), true));
        assert!(color_from(Some("auto"), true));
    }
}
