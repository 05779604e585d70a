//! Tracing conventions for fe-daq.
//!
//! The crates emit structured events under a common target prefix; subscriber
//! installation is left to the embedding binary.  Consumers filter with:
//! ```text
//! RUST_LOG=fedaq=debug
//! ```

use tracing::Level;

/// Target prefix used by all fe-daq tracing spans and events.
pub const TARGET_PREFIX: &str = "fedaq";

/// Standard span names used across the pipeline.
pub mod span_names {
    /// One cavity gradient change, validation through settle.
    pub const SET_GRADIENT: &str = "fedaq::set_gradient";
    /// Multi-step walk of one cavity to a distant target.
    pub const WALK_GRADIENT: &str = "fedaq::walk_gradient";
    /// Parallel batch update of several cavities.
    pub const APPLY_BATCH: &str = "fedaq::apply_batch";
    /// Batch rollback to pre-sample gradients.
    pub const ROLLBACK: &str = "fedaq::rollback";
    /// Monitored settle/averaging window.
    pub const SETTLE: &str = "fedaq::settle";
    /// One sample round of a scan procedure.
    pub const SCAN_ROUND: &str = "fedaq::scan_round";
}

/// Standard structured field names used in tracing events.
pub mod field_names {
    pub const CAVITY: &str = "cavity";
    pub const ZONE: &str = "zone";
    pub const CHANNEL: &str = "channel";
    pub const GSET: &str = "gset";
    pub const GMES: &str = "gmes";
    pub const OUTCOME: &str = "outcome";
    pub const FAILED_COUNT: &str = "failed_count";
    pub const DURATION_S: &str = "duration_s";
    pub const HEAT_W: &str = "heat_w";
}

/// Parse a log level string (case-insensitive).
///
/// Recognized values: `trace`, `debug`, `info`, `warn`, `error`.
#[must_use]
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Level from `FEDAQ_LOG_LEVEL`, falling back to the provided default.
#[must_use]
pub fn level_from_env(default: Level) -> Level {
    std::env::var("FEDAQ_LOG_LEVEL")
        .ok()
        .and_then(|s| parse_level(&s))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_prefix_is_fedaq() {
        assert_eq!(TARGET_PREFIX, "fedaq");
    }

    #[test]
    fn all_span_names_start_with_target_prefix() {
        let all_spans = [
            span_names::SET_GRADIENT,
            span_names::WALK_GRADIENT,
            span_names::APPLY_BATCH,
            span_names::ROLLBACK,
            span_names::SETTLE,
            span_names::SCAN_ROUND,
        ];
        for span in all_spans {
            assert!(
                span.starts_with(&format!("{TARGET_PREFIX}::")),
                "span {span:?} must start with \"{TARGET_PREFIX}::\"",
            );
        }
    }

    #[test]
    fn parse_level_recognizes_valid_levels() {
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("Debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("warn"), Some(Level::WARN));
        assert_eq!(parse_level("error"), Some(Level::ERROR));
    }

    #[test]
    fn parse_level_returns_none_for_invalid() {
        assert_eq!(parse_level("verbose"), None);
        assert_eq!(parse_level(""), None);
        assert_eq!(parse_level(" info"), None);
    }

    #[test]
    fn field_names_are_non_empty() {
        let all_fields = [
            field_names::CAVITY,
            field_names::ZONE,
            field_names::CHANNEL,
            field_names::GSET,
            field_names::GMES,
            field_names::OUTCOME,
            field_names::FAILED_COUNT,
            field_names::DURATION_S,
            field_names::HEAT_W,
        ];
        for field in all_fields {
            assert!(!field.is_empty());
        }
    }
}
