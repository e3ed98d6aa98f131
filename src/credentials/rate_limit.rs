// Rate limit detection in worker output

use super::pool::MAX_BACKOFF_WINDOW;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Kinds of rate limiting an external API can report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    /// HTTP 429 Too Many Requests
    Http429,
    /// Generic rate limit message
    RateLimit,
    /// Quota or usage limit exhausted
    QuotaExceeded,
    /// Service overloaded or concurrency limited
    Overloaded,
}

/// A rate limit found in a piece of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSignal {
    pub kind: RateLimitKind,
    /// Reported retry-after, if the message carried one
    pub retry_after: Option<Duration>,
    /// The text that matched
    pub matched: String,
}

struct CompiledPattern {
    regex: Regex,
    kind: RateLimitKind,
}

static PATTERNS: OnceLock<Vec<CompiledPattern>> = OnceLock::new();
static RETRY_AFTER: OnceLock<Regex> = OnceLock::new();

fn patterns() -> &'static [CompiledPattern] {
    PATTERNS.get_or_init(|| {
        [
            // Word boundaries keep IDs like "ses_429f18" from matching
            (r"(?i)\b429\b", RateLimitKind::Http429),
            (r"(?i)HTTP/\d+(?:\.\d+)?\s+429", RateLimitKind::Http429),
            (r"(?i)rate[_\-\s]?limit(ed|ing)?", RateLimitKind::RateLimit),
            (r"(?i)too\s+many\s+requests", RateLimitKind::RateLimit),
            (r"(?i)quota\s*(exceeded|limit)", RateLimitKind::QuotaExceeded),
            (r"(?i)usage\s+limit\s+(exceeded|reached)", RateLimitKind::QuotaExceeded),
            (r"(?i)overloaded", RateLimitKind::Overloaded),
            (r"(?i)service\s+(unavailable|busy)", RateLimitKind::Overloaded),
            (r"(?i)(high|reduce)\s+concurrency", RateLimitKind::Overloaded),
        ]
        .into_iter()
        .map(|(pattern, kind)| CompiledPattern {
            regex: Regex::new(pattern).unwrap(),
            kind,
        })
        .collect()
    })
}

fn retry_after_regex() -> &'static Regex {
    RETRY_AFTER.get_or_init(|| Regex::new(r"(?i)retry[_\-\s]?after[:\s]*(\d+)").unwrap())
}

/// Scans worker output (typically stderr) for rate limit messages
#[derive(Debug, Default, Clone, Copy)]
pub struct RateLimitDetector;

impl RateLimitDetector {
    pub fn new() -> Self {
        Self
    }

    /// First rate limit found in `output`, if any
    pub fn detect(&self, output: &str) -> Option<RateLimitSignal> {
        let pattern = patterns().iter().find(|p| p.regex.is_match(output))?;
        let matched = pattern
            .regex
            .find(output)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        Some(RateLimitSignal {
            kind: pattern.kind,
            retry_after: self.retry_after(output),
            matched,
        })
    }

    /// Retry-after in seconds, as reported in the output, capped at
    /// `MAX_BACKOFF_WINDOW`
    pub fn retry_after(&self, output: &str) -> Option<Duration> {
        retry_after_regex()
            .captures(output)
            .and_then(|caps| caps.get(1))
            .map(|m| {
                // Digit runs too long for u64 are treated as the cap as well
                m.as_str()
                    .parse::<u64>()
                    .unwrap_or(u64::MAX)
                    .min(MAX_BACKOFF_WINDOW.as_secs())
            })
            .map(Duration::from_secs)
    }

    pub fn is_rate_limited(&self, output: &str) -> bool {
        self.detect(output).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_http_429() {
        let detector = RateLimitDetector::new();
        let signal = detector
            .detect("Error: 429 Too Many Requests - please slow down")
            .unwrap();
        assert_eq!(signal.kind, RateLimitKind::Http429);
        assert!(detector.is_rate_limited("HTTP/2 429"));
        assert!(detector.is_rate_limited("status: 429"));
    }

    #[test]
    fn test_detects_generic_rate_limit() {
        let detector = RateLimitDetector::new();
        let signal = detector.detect("API Error: rate-limit exceeded").unwrap();
        assert_eq!(signal.kind, RateLimitKind::RateLimit);
        assert_eq!(signal.matched, "rate-limit");
    }

    #[test]
    fn test_detects_quota_and_overload() {
        let detector = RateLimitDetector::new();
        assert_eq!(
            detector.detect("Quota exceeded for today").unwrap().kind,
            RateLimitKind::QuotaExceeded
        );
        assert_eq!(
            detector.detect("service overloaded, try later").unwrap().kind,
            RateLimitKind::Overloaded
        );
        assert_eq!(
            detector
                .detect("High concurrency usage of this API")
                .unwrap()
                .kind,
            RateLimitKind::Overloaded
        );
    }

    #[test]
    fn test_extracts_retry_after_seconds() {
        let detector = RateLimitDetector::new();
        let signal = detector
            .detect("Rate limited. Retry-After: 30 seconds")
            .unwrap();
        assert_eq!(signal.retry_after, Some(Duration::from_secs(30)));

        assert_eq!(
            detector.retry_after("retry after 45"),
            Some(Duration::from_secs(45))
        );
        assert_eq!(detector.retry_after("no hint here"), None);
    }

    #[test]
    fn test_retry_after_is_capped() {
        let detector = RateLimitDetector::new();
        assert_eq!(
            detector.retry_after("429: retry-after 18446744073709551615"),
            Some(MAX_BACKOFF_WINDOW)
        );
        assert_eq!(
            detector.retry_after("retry after 99999999999999999999999999"),
            Some(MAX_BACKOFF_WINDOW)
        );
    }

    #[test]
    fn test_no_false_positives() {
        let detector = RateLimitDetector::new();
        assert!(!detector.is_rate_limited("Normal error: file not found"));
        assert!(!detector.is_rate_limited("ses_429f18024ffeVo6UO6EAo2tIHG"));
        assert!(!detector.is_rate_limited("task_id_429_hash"));
    }
}
