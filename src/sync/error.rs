//! Error taxonomy for the sync engine.
//!
//! The retry wrapper classifies failures into these variants; everything
//! above the paginators carries them through `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Authentication failed and is not retryable (a single token refresh
    /// may already have been attempted upstream).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider throttled us and retries are exhausted.
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Connection-level failure (refused, reset, DNS, ...).
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response after retries. `body` is truncated for logs.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    /// Malformed provider payload. Skippable per record/page; fatal only on
    /// the first page of an offset fetch.
    #[error("malformed provider data: {0}")]
    ProviderData(String),

    /// Cleanup would delete too large a fraction of the store.
    #[error("cleanup aborted: {would_delete} of {population} local records would be deleted")]
    SafetyAbort {
        would_delete: usize,
        population: usize,
    },

    /// A bounded wait ran out (bulk-export polling, client timeout).
    #[error("timed out: {0}")]
    Timeout(String),
}

impl SyncError {
    /// Whether the retry wrapper may try again on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout(e.to_string())
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

/// Keep logged response bodies readable.
pub fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        s.truncate(max_len);
        s.push('…');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Timeout("poll".into()).is_retryable());
        assert!(!SyncError::Auth("expired".into()).is_retryable());
        assert!(!SyncError::ProviderData("bad count".into()).is_retryable());
        assert!(!SyncError::SafetyAbort {
            would_delete: 60,
            population: 100
        }
        .is_retryable());
    }

    #[test]
    fn truncation_appends_ellipsis() {
        let s = truncate_for_log("a".repeat(50), 10);
        assert_eq!(s.chars().count(), 11);
        assert!(s.ends_with('…'));
        assert_eq!(truncate_for_log("short".into(), 10), "short");
    }
}
