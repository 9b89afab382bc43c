//! Shared transient-error classification.
//!
//! One table, consumed by both the step-execution retry path and the
//! observer's rule tree, so the two can never drift apart.

/// Error substrings that indicate a transient, retryable failure.
pub const TRANSIENT_INDICATORS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "temporary",
    "try again",
    "503",
    "429",
    "connection",
    "ECONNREFUSED",
];

/// Case-insensitive check whether an error message looks transient.
pub fn is_transient_error(error_msg: &str) -> bool {
    let lower = error_msg.to_lowercase();
    TRANSIENT_INDICATORS
        .iter()
        .any(|ind| lower.contains(&ind.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_indicators_match() {
        assert!(is_transient_error("fetch timeout"));
        assert!(is_transient_error("Request Timed Out"));
        assert!(is_transient_error("Rate Limit exceeded"));
        assert!(is_transient_error("HTTP 503 Service Unavailable"));
        assert!(is_transient_error("HTTP 429"));
        assert!(is_transient_error("connection reset by peer"));
        assert!(is_transient_error("econnrefused"));
        assert!(is_transient_error("temporary failure, please try again"));
    }

    #[test]
    fn non_transient_errors_do_not_match() {
        assert!(!is_transient_error("Unknown subagent type: researcher"));
        assert!(!is_transient_error("Derivative Works Filter"));
        assert!(!is_transient_error("invalid input"));
        assert!(!is_transient_error(""));
    }
}
